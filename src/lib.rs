pub mod buffer;
pub mod config;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod format;
pub mod label;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod transaction;
pub mod transport;
pub mod trigger;

#[cfg(feature = "stream-load")]
pub mod stream_load;

pub mod init;
pub mod noop;

pub use config::{LoadFormat, SinkConfig};
pub use controller::BatchFlushController;
pub use error::{ConfigError, SinkError, TransportError, TransportErrorKind};
pub use metrics::MetricsSnapshot;
pub use noop::NoopTransport;
pub use record::{Destination, Record};
pub use retry::{FlushReport, RetryPolicy};
pub use transport::{LoadRequest, LoadResponse, PreparedLoad, Transport};
pub use trigger::{BatchThresholds, FlushTrigger};

#[cfg(feature = "stream-load")]
pub use stream_load::StreamLoadTransport;
