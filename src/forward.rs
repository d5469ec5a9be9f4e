//! Serializes sealed batches into ingestion requests and submits them
//! to the configured endpoint(s).

use crate::pipeline::{BatchDisposition, Entry};
use crate::trigger::Job;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

/// The request body accepted by the ingestion API: one batch wrapped
/// with its source and application labels.
#[derive(Serialize)]
struct IngestionRequest<'a> {
    /// The source label: the bucket the archive came from.
    hostname: &'a str,

    /// The application label.
    app: &'a str,

    /// The batched records, in source order.
    lines: Vec<Line<'a>>,
}

/// One record in the target schema.
#[derive(Serialize)]
struct Line<'a> {
    timestamp: i64,
    app: &'a str,
    line: &'a str,
}

/// The outcome of submitting one batch to one endpoint.
#[derive(Debug)]
pub struct Outcome {
    /// Whether the endpoint accepted the batch.
    pub success: bool,

    /// The HTTP status, when a response arrived at all.
    pub http_status: Option<u16>,

    /// The transport error or response body accompanying a failure.
    pub error: Option<String>,
}

/// Serialize one sealed batch into the ingestion request body.
pub fn request_body(hostname: &str, app: &str, batch: &[Entry]) -> Result<String> {
    let request = IngestionRequest {
        hostname,
        app,
        lines: batch
            .iter()
            .map(|entry| Line {
                timestamp: entry.timestamp,
                app,
                line: &entry.line,
            })
            .collect(),
    };
    serde_json::to_string(&request).context("Failed to serialize an ingestion request")
}

/// Submits sealed batches, in order, to the primary ingestion endpoint
/// and optionally to a second one. Performs no retries; a failed
/// submission is reported through the batch disposition.
pub struct Forwarder {
    client: Client,
    primary: String,
    tandem: Option<String>,
    key: String,
    hostname: String,
    app: String,
}

impl Forwarder {
    /// Build a forwarder for the given job.
    pub fn new(client: Client, job: &Job) -> Self {
        Forwarder {
            client,
            primary: job.ingestion_url.clone(),
            tandem: job.tandem_ingestion_url.clone(),
            key: job.ingestion_key.clone(),
            hostname: job.bucket.clone(),
            app: job.app.clone(),
        }
    }

    /// Serialize and submit one sealed batch to every configured
    /// endpoint. Endpoint outcomes are independent: a failure at one
    /// endpoint never prevents submission to the other.
    pub async fn forward(&self, index: u64, batch: Vec<Entry>) -> Result<BatchDisposition> {
        let body = request_body(&self.hostname, &self.app, &batch)?;
        let bytes = body.len() as u64;
        let primary = self.submit(&self.primary, &body).await;
        report(index, &self.primary, batch.len(), &primary);
        let accepted = primary.success;
        if let Some(tandem) = &self.tandem {
            let outcome = self.submit(tandem, &body).await;
            report(index, tandem, batch.len(), &outcome);
        }
        Ok(BatchDisposition { accepted, bytes })
    }

    /// Submit one serialized batch to a single endpoint.
    async fn submit(&self, endpoint: &str, body: &str) -> Outcome {
        let response = self
            .client
            .post(endpoint)
            .basic_auth(&self.key, None::<&str>)
            .header("Content-Type", "application/json")
            .body(String::from(body))
            .send()
            .await;
        match response {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Outcome {
                        success: true,
                        http_status: Some(status.as_u16()),
                        error: None,
                    }
                } else {
                    Outcome {
                        success: false,
                        http_status: Some(status.as_u16()),
                        error: Some(response.text().await.unwrap_or_default()),
                    }
                }
            }
            Err(error) => Outcome {
                success: false,
                http_status: None,
                error: Some(error.to_string()),
            },
        }
    }
}

/// Log the outcome of one submission.
fn report(index: u64, endpoint: &str, records: usize, outcome: &Outcome) {
    if outcome.success {
        info!(
            "Batch {} ({} records) accepted by {:?}",
            index, records, endpoint
        );
    } else {
        warn!(
            "Batch {} ({} records) rejected by {:?}: status {:?}, {:?}",
            index, records, endpoint, outcome.http_status, outcome.error
        );
    }
}
