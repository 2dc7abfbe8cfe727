use std::sync::Arc;
use std::time::Instant;

use stream_load_sink::init::init_logging;
use stream_load_sink::{BatchFlushController, Destination, LoadFormat, NoopTransport, Record, SinkConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(tracing::Level::WARN)?;

    let config = SinkConfig::new(vec!["127.0.0.1:8030".into()], "demo", "events")
        .with_format(LoadFormat::Json)
        .with_batch_limits(10_000, 16 * 1024 * 1024, 200)
        .with_retries(5, 50, 2_000);
    let sink = BatchFlushController::open(config, Arc::new(NoopTransport::default())).await?;

    // Spread the load over a few tables; each gets its own buffer.
    let tables: Vec<Destination> = (0..4).map(|i| Destination::new("demo", format!("events_{}", i))).collect();

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        let record = Record::new().with("id", i).with("payload", "x".repeat(64));
        sink.write(&tables[(i % 4) as usize], &record).await?;
    }
    sink.close().await?;

    let elapsed = start.elapsed();
    let metrics = sink.metrics();
    println!("custom config: wrote {} records in {:?} (~{:.0} rec/s), {} flushes, {} coalesced triggers",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64(),
        metrics.flushes,
        metrics.coalesced_triggers
    );
    Ok(())
}
