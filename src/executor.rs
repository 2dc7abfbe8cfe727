use crate::config::SinkConfig;
use crate::error::{SinkError, TransportError};
use crate::format::RowSerializer;
use crate::record::{Destination, Record};
use crate::transport::{LoadRequest, Transport};
use crate::trigger::FlushTrigger;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One submission unit: a drained batch, its payload and its label.
///
/// The payload and label are fixed when the attempt is created and are
/// reused unchanged by every retry.
#[derive(Debug, Clone)]
pub struct FlushAttempt {
    pub destination: Destination,
    pub label: String,
    pub payload: Arc<[u8]>,
    pub rows: usize,
    pub bytes: u64,
    pub trigger: FlushTrigger,
    /// Checkpoint of the open transaction, for two-phase loads.
    pub checkpoint: Option<u64>,
    /// Submissions made so far.
    pub attempts: u32,
}

/// Result of one submission, classified for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Success {
        rows_written: u64,
        txn_id: Option<i64>,
        deduplicated: bool,
    },
    RetryableFailure(TransportError),
    FatalFailure(TransportError),
}

/// Serializes records and submits drained batches over a [`Transport`].
pub struct FlushExecutor {
    transport: Arc<dyn Transport>,
    serializer: RowSerializer,
    options: BTreeMap<String, String>,
    two_phase_commit: bool,
}

impl FlushExecutor {
    pub fn new(transport: Arc<dyn Transport>, config: &SinkConfig) -> Self {
        FlushExecutor {
            transport,
            serializer: RowSerializer::new(config.format, config.column_separator.clone()),
            options: config.stream_load_props.clone(),
            two_phase_commit: config.two_phase_commit,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Serialize one record into its row form; the length is the byte
    /// size accounted in the buffer.
    pub fn serialize(&self, record: &Record) -> Result<Vec<u8>, SinkError> {
        self.serializer.serialize_row(record)
    }

    /// Build an attempt from rows drained out of a buffer.
    pub fn prepare(
        &self,
        destination: Destination,
        label: String,
        rows: Vec<Vec<u8>>,
        bytes: u64,
        trigger: FlushTrigger,
        checkpoint: Option<u64>,
    ) -> FlushAttempt {
        let payload = RowSerializer::encode_rows(&rows);
        FlushAttempt {
            destination,
            label,
            payload: payload.into(),
            rows: rows.len(),
            bytes,
            trigger,
            checkpoint,
            attempts: 0,
        }
    }

    /// Submit the attempt once and classify the result.
    pub async fn execute(&self, attempt: &FlushAttempt) -> FlushOutcome {
        let request = LoadRequest {
            destination: &attempt.destination,
            label: &attempt.label,
            format: self.serializer.format(),
            column_separator: self.serializer.column_separator(),
            payload: &attempt.payload,
            rows: attempt.rows,
            options: &self.options,
            two_phase_commit: self.two_phase_commit,
        };

        match self.transport.submit(&request).await {
            Ok(resp) => {
                if self.two_phase_commit && resp.txn_id.is_none() && !resp.deduplicated {
                    return FlushOutcome::FatalFailure(TransportError::malformed(
                        "prepared load returned no transaction id",
                    ));
                }
                FlushOutcome::Success {
                    rows_written: resp.loaded_rows.unwrap_or(attempt.rows as u64),
                    txn_id: resp.txn_id,
                    deduplicated: resp.deduplicated,
                }
            }
            Err(e) if e.is_retryable() => FlushOutcome::RetryableFailure(e),
            Err(e) => FlushOutcome::FatalFailure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadFormat;
    use crate::error::TransportErrorKind;
    use crate::transport::LoadResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        result: Result<LoadResponse, TransportError>,
        seen: Mutex<Vec<(String, Vec<u8>, BTreeMap<String, String>)>>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn submit(&self, request: &LoadRequest<'_>) -> Result<LoadResponse, TransportError> {
            self.seen.lock().unwrap().push((
                request.label.to_string(),
                request.payload.to_vec(),
                request.options.clone(),
            ));
            self.result.clone()
        }
    }

    fn executor(result: Result<LoadResponse, TransportError>, config: &SinkConfig) -> (FlushExecutor, Arc<Scripted>) {
        let transport = Arc::new(Scripted {
            result,
            seen: Mutex::new(Vec::new()),
        });
        (FlushExecutor::new(transport.clone(), config), transport)
    }

    fn config() -> SinkConfig {
        SinkConfig::new(vec!["fe:8030".into()], "db", "t").with_prop("strict_mode", "true")
    }

    fn attempt(exec: &FlushExecutor) -> FlushAttempt {
        let rows = vec![
            exec.serialize(&Record::new().with("id", 1).with("v", "a")).unwrap(),
            exec.serialize(&Record::new().with("id", 2).with("v", "b")).unwrap(),
        ];
        exec.prepare(Destination::new("db", "t"), "l_0".into(), rows, 6, FlushTrigger::Rows, None)
    }

    #[tokio::test]
    async fn test_success_submits_payload_label_and_options() {
        let (exec, transport) = executor(Ok(LoadResponse::default()), &config());
        let attempt = attempt(&exec);
        let outcome = exec.execute(&attempt).await;
        assert_eq!(
            outcome,
            FlushOutcome::Success {
                rows_written: 2,
                txn_id: None,
                deduplicated: false
            }
        );

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "l_0");
        assert_eq!(seen[0].1, b"1,a\n2,b".to_vec());
        assert_eq!(seen[0].2.get("strict_mode").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_json_payload() {
        let (exec, transport) = executor(Ok(LoadResponse::default()), &config().with_format(LoadFormat::Json));
        exec.execute(&attempt(&exec)).await;
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].1, br#"{"id":1,"v":"a"}
{"id":2,"v":"b"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let (exec, _) = executor(Err(TransportError::server_busy("503")), &config());
        assert!(matches!(exec.execute(&attempt(&exec)).await, FlushOutcome::RetryableFailure(_)));

        let (exec, _) = executor(Err(TransportError::authentication("401")), &config());
        match exec.execute(&attempt(&exec)).await {
            FlushOutcome::FatalFailure(e) => assert_eq!(e.kind, TransportErrorKind::Authentication),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_two_phase_requires_txn_id() {
        let (exec, _) = executor(Ok(LoadResponse::default()), &config().with_two_phase_commit(true));
        assert!(matches!(exec.execute(&attempt(&exec)).await, FlushOutcome::FatalFailure(_)));
    }
}
