//! Defines the read-only application state and the handling of one
//! relay job.

use crate::client;
use crate::conf::Settings;
use crate::forward::Forwarder;
use crate::pipeline::{self, PipelineResult, RecordRules};
use crate::trigger::Trigger;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use envy::from_env;
use once_cell::sync::OnceCell;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{info, instrument};

/// An App is an initialized application state, derived from settings.
/// This is only useful to pre-compute stuff that will be used
/// constantly.
pub struct App {
    /// The original settings.
    pub settings: Settings,

    /// The record filter and recoding tables applied by every job.
    pub rules: RecordRules,
}

impl App {
    /// Initialize an App instance given a settings struct. Consumes
    /// the settings struct.
    pub fn new(settings: Settings) -> Self {
        let rules = RecordRules::new(settings.drop_fields.iter().cloned());
        App { settings, rules }
    }

    /// Handle one relay job end to end: fetch the archive into a
    /// fresh scratch workspace, stream it through the record pipeline,
    /// and forward every sealed batch in order.
    #[instrument(skip_all)]
    pub async fn handle(&self, trigger: Trigger, http: &reqwest::Client) -> Result<Summary> {
        let job = trigger.resolve(&self.settings)?;
        let token = client::exchange_token(http, &self.settings.token_url, &job.api_key).await?;

        let scratch = TempDir::new().context("Failed to create the scratch workspace")?;
        let archive = scratch.path().join("archive.gz");
        let object_url = job.object_url();
        let object_size = client::download(http, &token, &object_url, &archive).await?;
        info!("Fetched {:?} ({} bytes)", object_url, object_size);

        let forwarder = Forwarder::new(http.clone(), &job);
        let fallback_timestamp = Utc::now().timestamp_millis();
        let reader = client::read_lines(&archive)?;
        let result = pipeline::run(
            reader,
            &self.rules,
            fallback_timestamp,
            job.max_batch_records,
            |index, batch| forwarder.forward(index, batch),
        )
        .await?;
        info!(
            "Forwarded {} records in {} batches ({} parse failures, {} failed batches)",
            result.ingested_records,
            result.batches_built,
            result.parse_failures,
            result.batches_failed
        );

        if self.settings.keep_scratch {
            let kept = scratch.into_path();
            info!("Scratch workspace kept at {:?}", kept);
        }
        Ok(Summary::new(object_url, object_size, &result))
    }
}

/// The machine-readable result printed on stdout after a successful
/// run.
#[derive(Debug, Serialize)]
pub struct Summary {
    /// The URL of the relayed object.
    pub source: String,

    /// The size in bytes of the fetched object, as stored.
    #[serde(rename = "object-size")]
    pub object_size: u64,

    /// The serialized bytes submitted for ingestion.
    #[serde(rename = "ingest-size")]
    pub ingest_size: u64,

    /// The records contained in batches accepted by the primary
    /// endpoint.
    #[serde(rename = "ingested-records")]
    pub ingested_records: u64,

    /// The batches the primary endpoint did not accept; omitted when
    /// zero.
    #[serde(rename = "failed-batches", skip_serializing_if = "is_zero")]
    pub failed_batches: u64,
}

impl Summary {
    /// Assemble the summary for one completed job.
    pub fn new(source: String, object_size: u64, result: &PipelineResult) -> Self {
        Summary {
            source,
            object_size,
            ingest_size: result.ingest_bytes,
            ingested_records: result.ingested_records,
            failed_batches: result.batches_failed,
        }
    }
}

/// Whether a counter is zero, for serde.
fn is_zero(count: &u64) -> bool {
    *count == 0
}

/// Global App instance.
static CURRENT: OnceCell<App> = OnceCell::new();

/// Initialize the global App instance.
pub fn init() -> Result<()> {
    let settings = from_env()?;
    let app = App::new(settings);
    CURRENT
        .set(app)
        .map_err(|_| anyhow!("app::CURRENT was already initialized"))
}

/// Get the current App instance, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static App {
    CURRENT.get().expect("app is not initialized")
}
