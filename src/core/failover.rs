use rand::Rng;
use serde::{Deserialize, Serialize};

/// One lineage entry: the vbucket uuid and the seqno at which that lineage
/// began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub vb_uuid: u64,
    pub by_seqno: u64,
}

/// Ordered list of `(vb_uuid, seqno)` entries, newest first. Clients
/// reconnecting after a crash match their remembered pair against this
/// table to decide whether to roll back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
}

const MAX_ENTRIES: usize = 25;

impl FailoverTable {
    pub fn new(high_seqno: u64) -> Self {
        let mut table = Self {
            entries: Vec::new(),
        };
        table.create_entry(high_seqno);
        table
    }

    pub fn from_entries(entries: Vec<FailoverEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push a new lineage starting at `high_seqno` with a random uuid.
    pub fn create_entry(&mut self, high_seqno: u64) -> u64 {
        let vb_uuid = rand::rng().random::<u64>();
        self.entries.insert(
            0,
            FailoverEntry {
                vb_uuid,
                by_seqno: high_seqno,
            },
        );
        self.entries.truncate(MAX_ENTRIES);
        vb_uuid
    }

    /// The uuid of the current lineage.
    pub fn current_uuid(&self) -> u64 {
        self.entries.first().map_or(0, |e| e.vb_uuid)
    }

    pub fn latest_entry(&self) -> Option<FailoverEntry> {
        self.entries.first().copied()
    }

    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    /// Whether a client holding `vb_uuid` is on a stale lineage, and if so
    /// the seqno it must roll back to (the seqno at which the successor
    /// lineage began).
    pub fn needs_rollback(&self, vb_uuid: u64) -> Option<u64> {
        if self.current_uuid() == vb_uuid {
            return None;
        }
        match self.entries.iter().position(|e| e.vb_uuid == vb_uuid) {
            // the entry created after the client's lineage bounds its validity
            Some(idx) => Some(self.entries[idx - 1].by_seqno),
            // lineage truncated out of the table entirely
            None => Some(0),
        }
    }

    /// Whether `vb_uuid` appears anywhere in the table.
    pub fn contains(&self, vb_uuid: u64) -> bool {
        self.entries.iter().any(|e| e.vb_uuid == vb_uuid)
    }
}
