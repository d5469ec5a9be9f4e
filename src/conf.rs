//! Defines configuration as read from the environment.

use serde::Deserialize;

/// Default `token_url` value.
fn default_token_url() -> String {
    String::from("https://iam.cloud.ibm.com/identity/token")
}

/// Default `max_batch_records` value.
fn default_max_batch_records() -> usize {
    4000
}

/// Default `connect_timeout_seconds` value.
fn default_connect_timeout_seconds() -> u64 {
    10
}

/// Default `request_timeout_seconds` value.
fn default_request_timeout_seconds() -> u64 {
    30
}

/// Default `drop_fields` value.
fn default_drop_fields() -> Vec<String> {
    vec![
        String::from("tenant_id"),
        String::from("instance_id"),
        String::from("checksum"),
    ]
}

/// The relay is configured to exchange an API key for a bearer token,
/// pull a log archive from an object store, and forward its records to
/// an ingestion endpoint. The configuration must be given as
/// environment variables; per-invocation values arrive in the trigger
/// document and take precedence where noted.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// The identity service endpoint used to exchange the API key
    /// bound to the trigger for a bearer token.
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// The ingestion endpoint receiving batched records, used when the
    /// trigger doesn't name one itself.
    #[serde(default)]
    pub ingestion_url: Option<String>,

    /// An optional second ingestion endpoint. Every sealed batch is
    /// also submitted here, independently of the primary endpoint.
    #[serde(default)]
    pub tandem_ingestion_url: Option<String>,

    /// The ingestion key authorizing submissions, used when the
    /// trigger doesn't carry one itself.
    #[serde(default)]
    pub ingestion_key: Option<String>,

    /// The maximum number of records per forwarded batch. The trigger
    /// may override this with its `chunk_size` field.
    #[serde(default = "default_max_batch_records")]
    pub max_batch_records: usize,

    /// Seconds allowed for establishing any HTTP connection.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,

    /// Seconds allowed for any single HTTP request to complete.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Record fields removed before forwarding, to conserve ingestion
    /// quota. Given as a comma-separated list.
    #[serde(default = "default_drop_fields")]
    pub drop_fields: Vec<String>,

    /// Keeps the scratch workspace on disk after the run instead of
    /// removing it, for local testing.
    #[serde(default)]
    pub keep_scratch: bool,
}
