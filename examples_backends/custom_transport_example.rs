use std::sync::Arc;

use async_trait::async_trait;
use stream_load_sink::{
    init::init_logging, BatchFlushController, LoadRequest, LoadResponse, Record, SinkConfig, Transport,
    TransportError,
};
use tracing::info;

/// Example of plugging in a completely custom ingestion endpoint by
/// implementing the `Transport` trait directly. Imagine this talks to
/// some proprietary bulk loader for which this crate does not provide a
/// built-in transport.
struct MyBulkLoader;

#[async_trait]
impl Transport for MyBulkLoader {
    async fn submit(&self, request: &LoadRequest<'_>) -> Result<LoadResponse, TransportError> {
        // Here you would call your own client library.
        println!(
            "[my-bulk-loader] {} label={} rows={} bytes={}",
            request.destination,
            request.label,
            request.rows,
            request.payload.len()
        );
        Ok(LoadResponse {
            loaded_rows: Some(request.rows as u64),
            ..LoadResponse::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(tracing::Level::DEBUG)?;

    let config = SinkConfig::new(vec!["loader.internal:9000".into()], "shop", "orders")
        .with_batch_limits(3, 1024, 500);
    let sink = BatchFlushController::open(config, Arc::new(MyBulkLoader)).await?;
    let dest = sink.default_destination();

    info!("custom transport example started");
    for id in 0..7 {
        sink.write(&dest, &Record::new().with("order_id", id).with("amount", 9.99)).await?;
    }
    sink.close().await?;
    Ok(())
}
