use chrono::Utc;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::core::types::{Seqno, VbUuid, MAX_SEQNO};

/// One branch point in a vbucket's history
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    pub vb_uuid: VbUuid,
    pub by_seqno: Seqno,
    created_at: i64,
}

impl FailoverEntry {
    fn new(vb_uuid: VbUuid, by_seqno: Seqno) -> FailoverEntry {
        FailoverEntry {
            vb_uuid,
            by_seqno,
            created_at: Utc::now().timestamp(),
        }
    }
}

/// Ordered log of `(vb_uuid, seqno)` branch points, newest first.
///
/// The table is never empty: a vbucket starts its life with a single
/// entry at seqno 0.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
}

impl FailoverTable {
    pub fn new(vb_uuid: VbUuid) -> FailoverTable {
        FailoverTable {
            entries: vec![FailoverEntry::new(vb_uuid, 0)],
        }
    }

    pub fn latest(&self) -> FailoverEntry {
        self.entries[0]
    }

    pub fn entries(&self) -> impl Iterator<Item = &FailoverEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open a new branch at `by_seqno`. Newer entries that claim seqnos
    /// past the branch point are history that never happened, so they
    /// are pruned first.
    pub fn add_entry(&mut self, vb_uuid: VbUuid, by_seqno: Seqno) {
        self.entries.retain(|entry| entry.by_seqno <= by_seqno);
        self.entries.insert(0, FailoverEntry::new(vb_uuid, by_seqno));
    }

    /// Adopt the peer's log wholesale, as received in a stream accept
    /// body. Empty input keeps the current table.
    pub fn replace_from_pairs(&mut self, pairs: &[(VbUuid, Seqno)]) {
        if pairs.is_empty() {
            return;
        }

        self.entries = pairs
            .iter()
            .map(|(vb_uuid, by_seqno)| FailoverEntry::new(*vb_uuid, *by_seqno))
            .collect();
        self.sanitize();
    }

    /// Newest-first `(uuid, seqno)` pairs for the wire
    pub fn to_pairs(&self) -> Vec<(VbUuid, Seqno)> {
        self.entries
            .iter()
            .map(|entry| (entry.vb_uuid, entry.by_seqno))
            .collect()
    }

    /// Decide whether a client positioned at `(vb_uuid, start_seqno)`
    /// inside snapshot `[snap_start, snap_end]` can resume from our
    /// history. `None` means the histories agree; otherwise the client
    /// must truncate to the returned seqno.
    pub fn find_rollback_seqno(
        &self,
        vb_uuid: VbUuid,
        start_seqno: Seqno,
        snap_start: Seqno,
        snap_end: Seqno,
    ) -> Option<Seqno> {
        // A client starting from scratch shares every history.
        if start_seqno == 0 {
            return None;
        }

        let pos = match self
            .entries
            .iter()
            .position(|entry| entry.vb_uuid == vb_uuid)
        {
            Some(pos) => pos,
            // The claimed branch never existed here.
            None => return Some(0),
        };

        // The branch is valid up to where its successor forked off.
        let branch_end = if pos == 0 {
            MAX_SEQNO
        } else {
            self.entries[pos - 1].by_seqno
        };

        if snap_start == snap_end {
            // Client sits on a snapshot boundary.
            if start_seqno <= branch_end {
                None
            } else {
                Some(branch_end)
            }
        } else if snap_end <= branch_end {
            None
        } else {
            Some(snap_start.min(branch_end))
        }
    }

    /// Restore the table invariants: unique uuids, seqnos non-increasing
    /// from newest to oldest, timestamps not newer than their successor.
    pub fn sanitize(&mut self) {
        let entries = std::mem::take(&mut self.entries);

        self.entries = entries
            .into_iter()
            .unique_by(|entry| entry.vb_uuid)
            .collect();

        let mut floor = 0;
        for entry in self.entries.iter_mut().rev() {
            if entry.by_seqno < floor {
                entry.by_seqno = floor;
            }
            floor = entry.by_seqno;
        }

        if self.entries.is_empty() {
            self.entries.push(FailoverEntry::new(0, 0));
        }
    }
}
