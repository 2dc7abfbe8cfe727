use crate::record::Destination;

/// Invalid or missing configuration, detected once at `open`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required option `{0}`")]
    Missing(&'static str),

    #[error("option `{key}` is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("unknown load format `{0}`, expected CSV or JSON")]
    UnknownFormat(String),

    #[error("environment variable {key} is not valid: {reason}")]
    Env { key: &'static str, reason: String },
}

/// Failure class of one submission, as reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Request or response timed out.
    Timeout,
    /// Could not reach any node.
    Connect,
    /// Endpoint is overloaded or temporarily failing (429, 5xx, job still running).
    ServerBusy,
    /// Credentials rejected.
    Authentication,
    /// Endpoint refused the data (schema mismatch, bad rows, quality filter).
    Rejected,
    /// Label already used by a load that did not finish.
    LabelConflict,
    /// Response could not be understood, or the payload could not be built.
    Malformed,
    /// Operation not implemented by this transport.
    Unsupported,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::ServerBusy => "server busy",
            TransportErrorKind::Authentication => "authentication",
            TransportErrorKind::Rejected => "rejected",
            TransportErrorKind::LabelConflict => "label conflict",
            TransportErrorKind::Malformed => "malformed",
            TransportErrorKind::Unsupported => "unsupported",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{} error: {message}", .kind.as_str())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn server_busy(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ServerBusy, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Authentication, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Rejected, message)
    }

    pub fn label_conflict(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::LabelConflict, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Malformed, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unsupported, message)
    }

    /// Whether re-submitting the same payload can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout | TransportErrorKind::Connect | TransportErrorKind::ServerBusy
        )
    }
}

/// Failure of a flush or of a controller lifecycle call.
///
/// Every flush variant names the destination, the label and the number of
/// rows in the batch, so the caller knows exactly which data was not
/// confirmed delivered.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("flush {label} to {destination} ({rows} rows) failed: {cause}")]
    Fatal {
        destination: Destination,
        label: String,
        rows: usize,
        cause: TransportError,
    },

    #[error("flush {label} to {destination} ({rows} rows) gave up after {attempts} attempts: {cause}")]
    RetryExhausted {
        destination: Destination,
        label: String,
        rows: usize,
        attempts: u32,
        cause: TransportError,
    },

    #[error("flush {label} to {destination} ({rows} rows) was cancelled, delivery outcome unknown")]
    UnknownOutcome {
        destination: Destination,
        label: String,
        rows: usize,
    },

    #[error("{rows} rows buffered for {destination} were never submitted")]
    Unflushed { destination: Destination, rows: usize },

    #[error("{} flushes failed: {}", .0.len(), describe_failures(.0))]
    Incomplete(Vec<SinkError>),

    #[error("failed to serialize record: {0}")]
    Serialization(String),

    #[error("sink is unusable after an earlier failure: {0}")]
    Poisoned(String),

    #[error("sink is closed")]
    Closed,

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("flush task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SinkError {
    /// Label of the batch this error refers to, if any.
    pub fn label(&self) -> Option<&str> {
        match self {
            SinkError::Fatal { label, .. }
            | SinkError::RetryExhausted { label, .. }
            | SinkError::UnknownOutcome { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Rows that were drained for the failed batch and are not confirmed delivered.
    pub fn undelivered_rows(&self) -> usize {
        match self {
            SinkError::Fatal { rows, .. }
            | SinkError::RetryExhausted { rows, .. }
            | SinkError::UnknownOutcome { rows, .. }
            | SinkError::Unflushed { rows, .. } => *rows,
            SinkError::Incomplete(failures) => failures.iter().map(SinkError::undelivered_rows).sum(),
            _ => 0,
        }
    }

    /// Fold the failures of a multi-destination call into one error.
    pub(crate) fn from_failures(mut failures: Vec<SinkError>) -> Option<SinkError> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(SinkError::Incomplete(failures)),
        }
    }
}

fn describe_failures(failures: &[SinkError]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
