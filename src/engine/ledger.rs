use serde::{Deserialize, Serialize};

use crate::model::*;

/// Append-only log of compensations, oldest first. Entries hold ids and
/// payload snapshots only; they are resolved against live state when inverted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    /// Append an entry and return its sequence number.
    pub fn record(&mut self, request_id: RequestId, compensation: Compensation, at: Ms) -> u64 {
        let seq = self.entries.len() as u64 + 1;
        self.entries.push(LedgerEntry {
            seq,
            request_id,
            recorded_at: at,
            compensation,
        });
        seq
    }

    /// The `k` most recent entries, most recent first. Fewer if the ledger is shorter.
    pub fn latest(&self, k: usize) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter().rev().take(k)
    }

    /// Drop the `k` most recent entries.
    pub fn truncate_latest(&mut self, k: usize) {
        let keep = self.entries.len().saturating_sub(k);
        self.entries.truncate(keep);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
