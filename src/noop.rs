use crate::error::TransportError;
use crate::transport::{LoadRequest, LoadResponse, PreparedLoad, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};

/// A transport that accepts every load without sending anything.
///
/// Useful for measuring the overhead of the controller itself without any
/// network I/O, and for tests that don't care about delivery.
#[derive(Debug, Default)]
pub struct NoopTransport {
    next_txn: AtomicI64,
}

#[async_trait]
impl Transport for NoopTransport {
    async fn submit(&self, request: &LoadRequest<'_>) -> Result<LoadResponse, TransportError> {
        let txn_id = request
            .two_phase_commit
            .then(|| self.next_txn.fetch_add(1, Ordering::Relaxed) + 1);
        Ok(LoadResponse {
            loaded_rows: Some(request.rows as u64),
            txn_id,
            deduplicated: false,
        })
    }

    async fn commit(&self, _prepared: &PreparedLoad) -> Result<(), TransportError> {
        Ok(())
    }

    async fn abort(&self, _prepared: &PreparedLoad) -> Result<(), TransportError> {
        Ok(())
    }
}
