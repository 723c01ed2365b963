use serde::{Deserialize, Serialize};

/// Logical partition id
pub type Vbid = u16;

/// Per-vbucket sequence number. 0 is reserved invalid.
pub type Seqno = u64;

/// Failover branch identifier
pub type VbUuid = u64;

/// Per-request correlation token
pub type Opaque = u32;

/// Highest seqno a stream may ever ask for
pub const MAX_SEQNO: Seqno = u64::MAX;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VbState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VbState {
    pub fn from_wire(byte: u8) -> Option<VbState> {
        match byte {
            1 => Some(VbState::Active),
            2 => Some(VbState::Replica),
            3 => Some(VbState::Pending),
            4 => Some(VbState::Dead),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            VbState::Active => 1,
            VbState::Replica => 2,
            VbState::Pending => 3,
            VbState::Dead => 4,
        }
    }
}

/// Closed seqno interval a peer must apply atomically
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRange {
    pub start: Seqno,
    pub end: Seqno,
}

impl SnapshotRange {
    pub fn new(start: Seqno, end: Seqno) -> SnapshotRange {
        SnapshotRange { start, end }
    }

    pub fn contains(&self, seqno: Seqno) -> bool {
        self.start <= seqno && seqno <= self.end
    }
}

/// Current persisted seqno and the snapshot it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub start: Seqno,
    pub range: SnapshotRange,
}

impl SnapshotInfo {
    /// A resume point never lands inside a partially received snapshot,
    /// so a snapshot that ends at the persisted seqno collapses to it.
    pub fn normalized(mut self) -> SnapshotInfo {
        if self.range.end == self.start {
            self.range.start = self.start;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{SnapshotInfo, SnapshotRange, VbState};

    #[test]
    fn test_vb_state_wire() {
        for state in &[
            VbState::Active,
            VbState::Replica,
            VbState::Pending,
            VbState::Dead,
        ] {
            assert_eq!(VbState::from_wire(state.to_wire()), Some(*state));
        }
        assert_eq!(VbState::from_wire(0), None);
        assert_eq!(VbState::from_wire(5), None);
    }

    #[test]
    fn test_range_contains() {
        let range = SnapshotRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(9));
        assert!(!range.contains(21));
    }

    #[test]
    fn test_snapshot_info_normalized() {
        let info = SnapshotInfo {
            start: 7,
            range: SnapshotRange::new(3, 7),
        }
        .normalized();

        assert_eq!(info.range.start, 7);

        let partial = SnapshotInfo {
            start: 5,
            range: SnapshotRange::new(3, 7),
        }
        .normalized();

        assert_eq!(partial.range.start, 3);
    }
}
