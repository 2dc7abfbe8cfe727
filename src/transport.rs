use crate::config::LoadFormat;
use crate::error::TransportError;
use crate::record::Destination;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One submission handed to a [`Transport`].
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub destination: &'a Destination,
    /// Idempotency label; identical for every retry of the same batch.
    pub label: &'a str,
    pub format: LoadFormat,
    pub column_separator: &'a str,
    /// Serialized rows joined by newlines.
    pub payload: &'a [u8],
    pub rows: usize,
    /// Extra load options, forwarded verbatim.
    pub options: &'a BTreeMap<String, String>,
    /// Prepare the load inside a transaction instead of publishing it.
    pub two_phase_commit: bool,
}

/// What the endpoint reported for an accepted load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResponse {
    /// Rows the endpoint says it loaded, when it reports them.
    pub loaded_rows: Option<u64>,
    /// Transaction id of a prepared (two-phase) load.
    pub txn_id: Option<i64>,
    /// The label had already been loaded; this submission was a duplicate.
    pub deduplicated: bool,
}

/// A load prepared under two-phase commit, waiting for commit or abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedLoad {
    pub destination: Destination,
    pub label: String,
    pub txn_id: i64,
}

/// Wire-level access to the bulk-load endpoint.
///
/// Implementations own the endpoint addresses and credentials and report
/// every failure as a classified [`TransportError`]; the controller only
/// decides whether to retry based on that classification.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit one batch.
    ///
    /// **Returns**
    /// - `Ok(..)` if the endpoint accepted the batch, including the case
    ///   where the label was already loaded by an earlier attempt.
    /// - `Err(..)` with a retryable kind (timeout, connect, server busy)
    ///   if the same submission may succeed later, or a fatal kind
    ///   otherwise.
    ///
    /// Called from the flush task, possibly several times with the same
    /// label.
    async fn submit(&self, request: &LoadRequest<'_>) -> Result<LoadResponse, TransportError>;

    /// Commit a prepared load. Default: unsupported.
    async fn commit(&self, prepared: &PreparedLoad) -> Result<(), TransportError> {
        Err(TransportError::unsupported(format!(
            "transport cannot commit transaction {}",
            prepared.txn_id
        )))
    }

    /// Abort a prepared load. Default: unsupported.
    async fn abort(&self, prepared: &PreparedLoad) -> Result<(), TransportError> {
        Err(TransportError::unsupported(format!(
            "transport cannot abort transaction {}",
            prepared.txn_id
        )))
    }
}
