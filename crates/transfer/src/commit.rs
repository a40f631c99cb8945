use std::collections::HashMap;

/// Staged block ids of an upload, keyed to their partition sequence.
///
/// Blocks complete in any order; the commit list is always sorted by
/// sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitLedger {
    blocks: HashMap<String, u32>,
}

impl CommitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a ledger from `(block_id, sequence)` pairs of completed chunks.
    pub fn from_completed<I, S>(completed: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            blocks: completed
                .into_iter()
                .map(|(id, seq)| (id.into(), seq))
                .collect(),
        }
    }

    /// Records a staged block. Re-recording the same id is a no-op.
    pub fn record(&mut self, block_id: impl Into<String>, sequence: u32) {
        self.blocks.insert(block_id.into(), sequence);
    }

    pub fn contains(&self, block_id: &str) -> bool {
        self.blocks.contains_key(block_id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block ids in commit order.
    pub fn ordered_block_ids(&self) -> Vec<String> {
        let mut entries: Vec<(&String, &u32)> = self.blocks.iter().collect();
        entries.sort_by_key(|(_, seq)| **seq);
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commits_in_sequence_order_not_completion_order() {
        let mut ledger = CommitLedger::new();
        ledger.record("C", 2);
        ledger.record("A", 0);
        ledger.record("B", 1);
        assert_eq!(ledger.ordered_block_ids(), vec!["A", "B", "C"]);
    }

    #[test]
    fn duplicate_record_is_idempotent() {
        let mut ledger = CommitLedger::new();
        ledger.record("A", 0);
        ledger.record("A", 0);
        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains("A"));
        assert!(!ledger.contains("B"));
    }

    #[test]
    fn rebuild_from_completed_rows() {
        let ledger = CommitLedger::from_completed([("B", 1), ("A", 0)]);
        assert_eq!(ledger.ordered_block_ids(), vec!["A", "B"]);
        assert!(CommitLedger::from_completed(Vec::<(String, u32)>::new()).is_empty());
    }
}
