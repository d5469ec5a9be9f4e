use anyhow::{Context, Result};
use chrono::Utc;
use log_relay::app::Summary;
use log_relay::pipeline::BatchDisposition;
use log_relay::{app, client, forward, pipeline};
use std::path::Path;
use tracing::info;

/// Run the record pipeline over a local gzip archive without touching
/// the network, reporting what one relay invocation would have
/// forwarded.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
    app::init()?;

    let argument = std::env::args()
        .nth(1)
        .context("Usage: dry-run <archive.gz>")?;
    let path = Path::new(&argument);
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .context("The archive path has no file name")?;
    let app_label = String::from(name.strip_suffix(".gz").unwrap_or(name));

    let app = app::current();
    let reader = client::read_lines(path)?;
    let fallback_timestamp = Utc::now().timestamp_millis();
    let result = pipeline::run(
        reader,
        &app.rules,
        fallback_timestamp,
        app.settings.max_batch_records,
        |index, batch| {
            let app_label = &app_label;
            async move {
                let body = forward::request_body(name, app_label, &batch)?;
                info!(
                    "Batch {} would submit {} records ({} bytes)",
                    index,
                    batch.len(),
                    body.len()
                );
                Ok(BatchDisposition {
                    accepted: true,
                    bytes: body.len() as u64,
                })
            }
        },
    )
    .await?;
    info!(
        "{} records read, {} parse failures, {} batches",
        result.records_read, result.parse_failures, result.batches_built
    );

    let object_size = std::fs::metadata(path)
        .with_context(|| format!("Failed to inspect archive {:?}", path))?
        .len();
    let summary = Summary::new(format!("file://{}", argument), object_size, &result);
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
