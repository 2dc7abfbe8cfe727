use stream_load_sink::config::{env_or, STREAM_LOAD_NODE_URLS_ENV};
use stream_load_sink::init::init_logging;
use stream_load_sink::{BatchFlushController, Record, SinkConfig};
use tracing::{error, info};

/// Loads a few rows into a real stream load endpoint.
///
/// Reads `STREAM_LOAD_NODE_URLS`, `STREAM_LOAD_DATABASE`, `STREAM_LOAD_TABLE`
/// and the other `STREAM_LOAD_*` variables.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(tracing::Level::DEBUG)?;

    info!(nodes = %env_or(STREAM_LOAD_NODE_URLS_ENV, "<unset>"), "stream load example started");
    let config = SinkConfig::from_env()?;
    let sink = BatchFlushController::open_stream_load(config).await?;
    let dest = sink.default_destination();

    for id in 0..10 {
        let record = Record::new()
            .with("id", id)
            .with("name", format!("row {}", id))
            .with("created_at", chrono::Utc::now().to_rfc3339());
        sink.write(&dest, &record).await?;
    }

    match sink.close().await {
        Ok(reports) => {
            for r in reports {
                info!(label = %r.label, rows = r.rows, attempts = r.attempts, "flushed");
            }
        }
        Err(e) => error!(error = %e, "final flush failed"),
    }
    Ok(())
}
