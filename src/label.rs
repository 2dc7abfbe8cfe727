use crate::record::Destination;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Generates idempotency labels for flush attempts.
///
/// Labels look like `{prefix}_{database}_{table}_{session}_{writer}_{seq}`,
/// with the checkpoint id inserted before `seq` inside a transaction.
/// `session` is the generator's creation time so a restarted writer does
/// not collide with labels of a previous run; `writer` separates parallel
/// writers of one job that start in the same millisecond.
#[derive(Debug)]
pub struct LabelGenerator {
    prefix: String,
    writer_id: u32,
    session: i64,
    sequence: AtomicU64,
}

impl LabelGenerator {
    pub fn new(prefix: impl Into<String>, writer_id: u32) -> Self {
        Self::with_session(prefix, writer_id, Utc::now().timestamp_millis())
    }

    pub fn with_session(prefix: impl Into<String>, writer_id: u32, session: i64) -> Self {
        LabelGenerator {
            prefix: prefix.into(),
            writer_id,
            session,
            sequence: AtomicU64::new(0),
        }
    }

    /// Produce a label never returned before by this generator.
    pub fn next(&self, destination: &Destination, checkpoint: Option<u64>) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let raw = match checkpoint {
            Some(checkpoint) => format!(
                "{}_{}_{}_{}_{}_{}_{}",
                self.prefix, destination.database, destination.table, self.session, self.writer_id, checkpoint, seq
            ),
            None => format!(
                "{}_{}_{}_{}_{}_{}",
                self.prefix, destination.database, destination.table, self.session, self.writer_id, seq
            ),
        };
        sanitize(&raw)
    }
}

// Stream load labels only allow `[-_A-Za-z0-9]`.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
