use anyhow::{Context, Result};
use log_relay::{app, client, trigger::Trigger};
use std::io::Read;

/// Relay one object store log archive to the ingestion API, as
/// directed by the trigger document given as the first argument or on
/// stdin. Diagnostics go to stderr; stdout carries nothing but the
/// summary JSON of a successful run.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
    app::init()?;
    client::init(&app::current().settings)?;

    let document = match std::env::args().nth(1) {
        Some(argument) => argument,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read the trigger document from stdin")?;
            buffer
        }
    };
    let trigger = Trigger::parse(&document)?;
    let summary = app::current()
        .handle(trigger, client::current())
        .await
        .context("Failed to handle the relay trigger")?;

    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
