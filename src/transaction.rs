use crate::error::SinkError;
use crate::transport::PreparedLoad;

/// Phase of the two-phase commit cycle for one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Open { checkpoint: u64 },
    PreCommitted { checkpoint: u64 },
}

/// Tracks loads prepared during a checkpoint and enforces
/// `begin -> pre_commit -> commit | abort`.
///
/// `commit` and `abort` are also accepted from `Idle` so the engine can
/// resolve loads restored from an earlier checkpoint after a restart.
#[derive(Debug)]
pub struct TransactionCoordinator {
    state: TransactionState,
    prepared: Vec<PreparedLoad>,
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        TransactionCoordinator {
            state: TransactionState::Idle,
            prepared: Vec::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn begin(&mut self, checkpoint: u64) -> Result<(), SinkError> {
        match self.state {
            TransactionState::Idle => {
                self.state = TransactionState::Open { checkpoint };
                self.prepared.clear();
                Ok(())
            }
            other => Err(invalid("begin", other)),
        }
    }

    /// Checkpoint of the open transaction, if loads may be prepared now.
    pub fn open_checkpoint(&self) -> Option<u64> {
        match self.state {
            TransactionState::Open { checkpoint } => Some(checkpoint),
            _ => None,
        }
    }

    pub fn record(&mut self, load: PreparedLoad) -> Result<(), SinkError> {
        match self.state {
            TransactionState::Open { .. } => {
                self.prepared.push(load);
                Ok(())
            }
            other => Err(SinkError::Transaction(format!(
                "load {} (txn {}) prepared while transaction is {:?}",
                load.label, load.txn_id, other
            ))),
        }
    }

    pub fn prepared(&self) -> &[PreparedLoad] {
        &self.prepared
    }

    /// Close the transaction for new loads and hand out what was prepared.
    pub fn pre_commit(&mut self) -> Result<Vec<PreparedLoad>, SinkError> {
        match self.state {
            TransactionState::Open { checkpoint } => {
                self.state = TransactionState::PreCommitted { checkpoint };
                Ok(self.prepared.clone())
            }
            other => Err(invalid("pre_commit", other)),
        }
    }

    /// Check that a commit may proceed; returns the checkpoint being committed.
    pub fn begin_commit(&self) -> Result<Option<u64>, SinkError> {
        match self.state {
            TransactionState::PreCommitted { checkpoint } => Ok(Some(checkpoint)),
            TransactionState::Idle => Ok(None),
            other => Err(invalid("commit", other)),
        }
    }

    /// Take every load that must be aborted. Allowed in any state.
    pub fn begin_abort(&mut self) -> Vec<PreparedLoad> {
        std::mem::take(&mut self.prepared)
    }

    /// Return to `Idle` after a commit or abort.
    pub fn finish(&mut self) {
        self.state = TransactionState::Idle;
        self.prepared.clear();
    }
}

fn invalid(operation: &str, state: TransactionState) -> SinkError {
    SinkError::Transaction(format!("cannot {} while transaction is {:?}", operation, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Destination;

    fn load(txn_id: i64) -> PreparedLoad {
        PreparedLoad {
            destination: Destination::new("db", "t"),
            label: format!("l_{}", txn_id),
            txn_id,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut txn = TransactionCoordinator::new();
        txn.begin(5).unwrap();
        assert_eq!(txn.open_checkpoint(), Some(5));
        txn.record(load(1)).unwrap();
        txn.record(load(2)).unwrap();

        let prepared = txn.pre_commit().unwrap();
        assert_eq!(prepared, vec![load(1), load(2)]);
        assert_eq!(txn.state(), TransactionState::PreCommitted { checkpoint: 5 });
        assert_eq!(txn.open_checkpoint(), None);
        assert_eq!(txn.begin_commit().unwrap(), Some(5));

        txn.finish();
        assert_eq!(txn.state(), TransactionState::Idle);
        assert!(txn.prepared().is_empty());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut txn = TransactionCoordinator::new();
        assert!(txn.pre_commit().is_err());
        assert!(txn.record(load(1)).is_err());

        txn.begin(1).unwrap();
        assert!(txn.begin(2).is_err());
        assert!(txn.begin_commit().is_err());

        txn.pre_commit().unwrap();
        assert!(txn.record(load(3)).is_err());
        assert!(txn.pre_commit().is_err());
    }

    #[test]
    fn test_abort_from_open_returns_prepared() {
        let mut txn = TransactionCoordinator::new();
        txn.begin(9).unwrap();
        txn.record(load(4)).unwrap();
        assert_eq!(txn.begin_abort(), vec![load(4)]);
        txn.finish();
        assert_eq!(txn.state(), TransactionState::Idle);
    }

    #[test]
    fn test_recovery_commit_from_idle() {
        let txn = TransactionCoordinator::new();
        assert_eq!(txn.begin_commit().unwrap(), None);
    }
}
