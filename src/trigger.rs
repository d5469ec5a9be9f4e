//! Defines a _trigger_, the input document for one relay invocation.
//! The trigger is built from the JSON event delivered by the invoking
//! platform, and carries the credential bindings attached to it.

use crate::conf::Settings;
use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Credential bindings nested inside the trigger document.
#[derive(Debug, Default, Deserialize)]
pub struct Credentials {
    /// Binding for the object store holding the log archives.
    #[serde(default)]
    pub object_storage: Option<ObjectStorageCredentials>,
}

/// The object store credential binding.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectStorageCredentials {
    /// The API key exchanged for a bearer token before fetching.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// The raw trigger document. Fields the platform didn't bind are
/// absent rather than carrying sentinel values; `resolve` performs the
/// single validation pass that rejects incomplete triggers.
#[derive(Debug, Default, Deserialize)]
pub struct Trigger {
    /// Credential bindings attached by the platform.
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// The bucket holding the new object.
    #[serde(default)]
    pub bucket: Option<String>,

    /// The object store endpoint. A bare host is addressed over https.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// The key of the new object.
    #[serde(default)]
    pub key: Option<String>,

    /// Overrides the configured primary ingestion endpoint.
    #[serde(default)]
    pub ingestion_url: Option<String>,

    /// Overrides the configured second ingestion endpoint.
    #[serde(default)]
    pub tandem_ingestion_url: Option<String>,

    /// Overrides the configured ingestion key.
    #[serde(default)]
    pub ingestion_key: Option<String>,

    /// The application label attached to every forwarded line. When
    /// absent it is derived from the object key.
    #[serde(default)]
    pub app: Option<String>,

    /// Overrides the configured maximum number of records per batch.
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

impl Trigger {
    /// Parse a trigger from the raw invocation document.
    pub fn parse(document: &str) -> Result<Self> {
        serde_json::from_str(document).context("Failed to parse the trigger document")
    }

    /// Validate the trigger against the settings, producing a job with
    /// every required value present and typed. Runs once, before any
    /// network call is made.
    pub fn resolve(self, settings: &Settings) -> Result<Job> {
        let api_key = self
            .credentials
            .and_then(|credentials| credentials.object_storage)
            .and_then(|binding| binding.api_key)
            .filter(|api_key| !api_key.is_empty())
            .context("No object storage API key is bound to the trigger")?;
        let bucket = self
            .bucket
            .filter(|bucket| !bucket.is_empty())
            .context("The trigger names no bucket")?;
        let endpoint = self
            .endpoint
            .filter(|endpoint| !endpoint.is_empty())
            .context("The trigger names no object store endpoint")?;
        let key = self
            .key
            .filter(|key| !key.is_empty())
            .context("The trigger names no object key")?;
        let ingestion_url = self
            .ingestion_url
            .or_else(|| settings.ingestion_url.clone())
            .filter(|url| !url.is_empty())
            .context("No ingestion endpoint is configured")?;
        let ingestion_key = self
            .ingestion_key
            .or_else(|| settings.ingestion_key.clone())
            .filter(|ingestion_key| !ingestion_key.is_empty())
            .context("No ingestion key is configured")?;
        let tandem_ingestion_url = self
            .tandem_ingestion_url
            .or_else(|| settings.tandem_ingestion_url.clone())
            .filter(|url| !url.is_empty());
        let app = self
            .app
            .filter(|app| !app.is_empty())
            .unwrap_or_else(|| app_label(&key));
        let max_batch_records = self.chunk_size.unwrap_or(settings.max_batch_records);
        ensure!(
            max_batch_records >= 1,
            "The batch record limit must be at least 1"
        );
        Ok(Job {
            api_key,
            bucket,
            endpoint,
            key,
            ingestion_url,
            tandem_ingestion_url,
            ingestion_key,
            app,
            max_batch_records,
        })
    }
}

/// A fully-resolved relay job: the validated union of a trigger
/// document and the environment settings.
#[derive(Debug)]
pub struct Job {
    /// The object store API key, exchanged for a bearer token.
    pub api_key: String,

    /// The bucket holding the archive. Doubles as the source label on
    /// forwarded batches.
    pub bucket: String,

    /// The object store endpoint.
    pub endpoint: String,

    /// The key of the archive to relay.
    pub key: String,

    /// The primary ingestion endpoint. Its outcomes drive the
    /// ingested-records accounting.
    pub ingestion_url: String,

    /// An optional second ingestion endpoint receiving every batch.
    pub tandem_ingestion_url: Option<String>,

    /// The ingestion key, sent as the basic-auth username.
    pub ingestion_key: String,

    /// The application label attached to every forwarded line.
    pub app: String,

    /// The maximum number of records per forwarded batch.
    pub max_batch_records: usize,
}

impl Job {
    /// The URL of the object this job relays. A bare endpoint host is
    /// addressed over https; an explicit scheme is kept as given.
    pub fn object_url(&self) -> String {
        let base = if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")
        {
            self.endpoint.clone()
        } else {
            format!("https://{}", self.endpoint)
        };
        format!("{}/{}/{}", base.trim_end_matches('/'), self.bucket, self.key)
    }
}

/// Derive an application label from an object key: the final path
/// component, without the compression suffix.
fn app_label(key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    let name = name.strip_suffix(".gz").unwrap_or(name);
    if name.is_empty() {
        String::from(key)
    } else {
        String::from(name)
    }
}
