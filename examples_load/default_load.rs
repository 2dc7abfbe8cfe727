use std::sync::Arc;
use std::time::Instant;

use stream_load_sink::init::init_logging;
use stream_load_sink::{BatchFlushController, NoopTransport, Record, SinkConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(tracing::Level::INFO)?;

    let config = SinkConfig::new(vec!["127.0.0.1:8030".into()], "demo", "events");
    let sink = BatchFlushController::open(config, Arc::new(NoopTransport::default())).await?;
    let dest = sink.default_destination();

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        let record = Record::new()
            .with("id", i)
            .with("name", format!("user_{}", i))
            .with("score", (i % 100) as f64 / 3.0);
        sink.write(&dest, &record).await?;
    }
    let reports = sink.close().await?;

    let elapsed = start.elapsed();
    let metrics = sink.metrics();
    println!("default config: wrote {} records in {:?} (~{:.0} rec/s), {} flushes ({} on close)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64(),
        metrics.flushes,
        reports.len()
    );
    Ok(())
}
