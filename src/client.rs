//! Defines the global HTTP client and the object store plumbing:
//! bearer token exchange, archive download, and the decompressed line
//! stream.

use crate::conf::Settings;
use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use once_cell::sync::OnceCell;
use reqwest::Client;
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// The identity service response to a token exchange.
#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Exchange an API key for a bearer token at the identity service.
/// An empty or missing token in the response is an error of its own:
/// the relay never proceeds with a blank bearer token.
pub async fn exchange_token(client: &Client, token_url: &str, api_key: &str) -> Result<String> {
    let response = client
        .post(token_url)
        .form(&[
            ("grant_type", "urn:ibm:params:oauth:grant-type:apikey"),
            ("apikey", api_key),
        ])
        .send()
        .await
        .with_context(|| format!("Failed to reach the identity service at {:?}", token_url))?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(anyhow!(
            "Identity service rejected the token exchange with status {}: {}",
            status,
            detail
        ));
    }
    let token: TokenResponse = response
        .json()
        .await
        .context("Failed to parse the identity service response")?;
    token
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| anyhow!("Identity service returned no usable access token"))
}

/// Download the object behind `url` into the given scratch path, using
/// the bearer token for authorization. Returns the number of bytes
/// written.
pub async fn download(client: &Client, token: &str, url: &str, path: &Path) -> Result<u64> {
    let mut response = client
        .get(url)
        .bearer_auth(token)
        .send()
        .await
        .with_context(|| format!("Failed to fetch object {:?}", url))?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(anyhow!(
            "Object fetch from {:?} failed with status {}: {}",
            url,
            status,
            detail
        ));
    }
    let mut file = File::create(path).await.with_context(|| {
        format!(
            "Failed to create local file {:?} to hold remote object {:?}",
            path, url
        )
    })?;
    let mut size = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("Failed while reading the body of object {:?}", url))?
    {
        file.write_all(&chunk).await.with_context(|| {
            format!(
                "Failed to save the contents of remote object {:?} into local file {:?}",
                url, path
            )
        })?;
        size += chunk.len() as u64;
    }
    file.flush()
        .await
        .with_context(|| format!("Failed to flush local file {:?}", path))?;
    Ok(size)
}

/// Open a downloaded archive as a decompressed line stream.
pub fn read_lines(path: &Path) -> Result<impl BufRead> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open downloaded archive {:?}", path))?;
    Ok(BufReader::new(GzDecoder::new(BufReader::new(file))))
}

/// Build an HTTP client with bounded timeouts, so that no single
/// network call can hang the invocation indefinitely.
pub fn build(settings: &Settings) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(settings.connect_timeout_seconds))
        .timeout(Duration::from_secs(settings.request_timeout_seconds))
        .build()
        .context("Failed to initialize the HTTP client")
}

/// Global HTTP client instance.
static CURRENT: OnceCell<Client> = OnceCell::new();

/// Initialize the global HTTP client.
pub fn init(settings: &Settings) -> Result<()> {
    let client = build(settings)?;
    CURRENT
        .set(client)
        .map_err(|_| anyhow!("client::CURRENT was already initialized"))
}

/// Get the current HTTP client instance, or panic if it hasn't been
/// initialized.
pub fn current() -> &'static Client {
    CURRENT.get().expect("client is not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn a_token_is_exchanged_for_the_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/identity/token"))
            .and(body_string_contains("apikey=secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "bearer-token"})),
            )
            .mount(&server)
            .await;
        let token = exchange_token(
            &Client::new(),
            &format!("{}/identity/token", server.uri()),
            "secret",
        )
        .await
        .unwrap();
        assert_eq!(token, "bearer-token");
    }

    #[tokio::test]
    async fn an_empty_access_token_is_its_own_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": ""})),
            )
            .mount(&server)
            .await;
        let error = exchange_token(&Client::new(), &server.uri(), "secret")
            .await
            .unwrap_err();
        assert!(error.to_string().contains("no usable access token"));
    }

    #[tokio::test]
    async fn a_downloaded_archive_streams_back_its_lines() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"n\":1}\n{\"n\":2}\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/archive.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(compressed.clone()))
            .mount(&server)
            .await;

        let scratch = tempfile::tempdir().unwrap();
        let target = scratch.path().join("archive.gz");
        let size = download(
            &Client::new(),
            "token",
            &format!("{}/bucket/archive.gz", server.uri()),
            &target,
        )
        .await
        .unwrap();
        assert_eq!(size, compressed.len() as u64);

        let lines: Vec<String> = read_lines(&target)
            .unwrap()
            .lines()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(lines, vec!["{\"n\":1}", "{\"n\":2}"]);
    }
}
