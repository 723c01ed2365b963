use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound::{Excluded, Unbounded},
    sync::atomic::{AtomicU32, Ordering},
    sync::Mutex,
};

use thiserror::Error;

use crate::core::{
    failover::{FailoverEntry, FailoverTable},
    item::Item,
    types::{Seqno, SnapshotInfo, SnapshotRange, VbState, Vbid, VbUuid},
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("Vbucket is not hosted here")]
    NotMyVbucket,
    #[error("Temporary failure, retry later")]
    TmpFail,
    #[error("Allocation failed")]
    OutOfMemory,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Where an in-memory cursor actually landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorReg {
    /// Seqno the in-memory structures can serve from. May be later than
    /// requested when older seqnos have been evicted to disk.
    pub cursor_seqno: Seqno,
    /// Whether this registration created the cursor
    pub first_snapshot: bool,
}

/// One in-memory snapshot worth of ordered items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBatch {
    pub items: Vec<Item>,
    /// The batch opens a new checkpoint
    pub checkpoint: bool,
}

/// Producer-side storage collaborator: seqno-ordered reads from memory
/// and disk, plus failover history.
pub trait StreamSource: Send + Sync {
    fn vbucket_state(&self, vb: Vbid) -> Option<VbState>;

    fn high_seqno(&self, vb: Vbid) -> StoreResult<Seqno>;

    fn failover_table(&self, vb: Vbid) -> StoreResult<FailoverTable>;

    /// Register a named cursor at `seqno`
    fn register_cursor(&self, vb: Vbid, name: &str, seqno: Seqno) -> StoreResult<CursorReg>;

    fn remove_cursor(&self, vb: Vbid, name: &str);

    /// Drain the ordered items currently queued past the cursor, at most
    /// one snapshot per call. `None` when the cursor is caught up.
    fn next_snapshot(&self, vb: Vbid, name: &str) -> StoreResult<Option<SnapshotBatch>>;

    /// Ordered disk scan over the closed seqno range
    fn scan(&self, vb: Vbid, start: Seqno, end: Seqno) -> StoreResult<Vec<Item>>;

    fn set_vbucket_state(&self, vb: Vbid, state: VbState) -> StoreResult<()>;
}

/// Consumer-side storage collaborator: in-order application of
/// replicated events, snapshot bookkeeping and rollback.
pub trait MutationSink: Send + Sync {
    fn vbucket_state(&self, vb: Vbid) -> Option<VbState>;

    fn high_seqno(&self, vb: Vbid) -> StoreResult<Seqno>;

    fn snapshot_info(&self, vb: Vbid) -> StoreResult<SnapshotInfo>;

    fn latest_failover(&self, vb: Vbid) -> StoreResult<FailoverEntry>;

    fn replace_failover(&self, vb: Vbid, pairs: &[(VbUuid, Seqno)]) -> StoreResult<()>;

    fn begin_snapshot(&self, vb: Vbid, range: SnapshotRange, disk: bool) -> StoreResult<()>;

    fn apply_mutation(&self, item: &Item) -> StoreResult<()>;

    fn apply_deletion(&self, item: &Item) -> StoreResult<()>;

    fn set_vbucket_state(&self, vb: Vbid, state: VbState) -> StoreResult<()>;

    /// Truncate everything past `seqno`
    fn rollback(&self, vb: Vbid, seqno: Seqno) -> StoreResult<()>;

    /// Backpressure signal from the write path
    fn should_throttle(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct Cursor {
    seqno: Seqno,
    fresh: bool,
}

#[derive(Debug)]
struct VbEntry {
    state: VbState,
    items: BTreeMap<Seqno, Item>,
    keys: HashMap<Box<[u8]>, Seqno>,
    high_seqno: Seqno,
    /// Lowest seqno still resident in checkpoint memory
    memory_floor: Seqno,
    failover: FailoverTable,
    cursors: HashMap<String, Cursor>,
    snapshot: SnapshotRange,
}

impl VbEntry {
    fn new(state: VbState, vb_uuid: VbUuid) -> VbEntry {
        VbEntry {
            state,
            items: BTreeMap::new(),
            keys: HashMap::new(),
            high_seqno: 0,
            memory_floor: 1,
            failover: FailoverTable::new(vb_uuid),
            cursors: HashMap::new(),
            snapshot: SnapshotRange::new(0, 0),
        }
    }

    fn upsert(&mut self, item: Item) {
        if let Some(stale) = self.keys.insert(item.key.clone(), item.by_seqno) {
            self.items.remove(&stale);
        }
        self.high_seqno = self.high_seqno.max(item.by_seqno);
        self.items.insert(item.by_seqno, item);
    }
}

/// Hash-map backed store hosting both collaborator traits. The engine's
/// tests run against it; embedders bring their own persistence.
#[derive(Default)]
pub struct MemoryStore {
    vbuckets: Mutex<HashMap<Vbid, VbEntry>>,
    tmp_fails: AtomicU32,
}

impl MemoryStore {
    pub fn add_vbucket(&self, vb: Vbid, state: VbState, vb_uuid: VbUuid) {
        self.vbuckets
            .lock()
            .unwrap()
            .insert(vb, VbEntry::new(state, vb_uuid));
    }

    /// Append a write at the next seqno, producer fixture style
    pub fn seed(&self, vb: Vbid, key: &[u8], value: &[u8]) -> Seqno {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get_mut(&vb).expect("vbucket is not hosted");
        let by_seqno = entry.high_seqno + 1;

        entry.upsert(Item {
            vbucket: vb,
            key: key.into(),
            value: Some(value.into()),
            flags: 0,
            expiry: 0,
            cas: by_seqno,
            by_seqno,
            rev_seqno: 1,
            nru: 0,
            deleted: false,
            ext_meta: None,
        });
        entry.snapshot = SnapshotRange::new(by_seqno, by_seqno);
        by_seqno
    }

    /// Pretend seqnos below `floor` were evicted from checkpoint memory
    pub fn set_memory_floor(&self, vb: Vbid, floor: Seqno) {
        if let Some(entry) = self.vbuckets.lock().unwrap().get_mut(&vb) {
            entry.memory_floor = floor;
        }
    }

    pub fn add_failover_entry(&self, vb: Vbid, vb_uuid: VbUuid) {
        if let Some(entry) = self.vbuckets.lock().unwrap().get_mut(&vb) {
            entry.failover.add_entry(vb_uuid, entry.high_seqno);
        }
    }

    /// Make the next `count` write applications fail temporarily
    pub fn inject_tmp_fails(&self, count: u32) {
        self.tmp_fails.store(count, Ordering::Relaxed);
    }

    pub fn get(&self, vb: Vbid, key: &[u8]) -> Option<Item> {
        let vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get(&vb)?;
        entry
            .keys
            .get(key)
            .and_then(|seqno| entry.items.get(seqno))
            .cloned()
    }

    pub fn item_count(&self, vb: Vbid) -> usize {
        self.vbuckets
            .lock()
            .unwrap()
            .get(&vb)
            .map_or(0, |entry| entry.items.len())
    }

    fn take_tmp_fail(&self) -> bool {
        self.tmp_fails
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                left.checked_sub(1)
            })
            .is_ok()
    }

    fn apply(&self, item: &Item) -> StoreResult<()> {
        if self.take_tmp_fail() {
            return Err(StoreError::TmpFail);
        }

        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets
            .get_mut(&item.vbucket)
            .ok_or(StoreError::NotMyVbucket)?;
        entry.upsert(item.clone());
        Ok(())
    }
}

impl StreamSource for MemoryStore {
    fn vbucket_state(&self, vb: Vbid) -> Option<VbState> {
        self.vbuckets.lock().unwrap().get(&vb).map(|e| e.state)
    }

    fn high_seqno(&self, vb: Vbid) -> StoreResult<Seqno> {
        self.vbuckets
            .lock()
            .unwrap()
            .get(&vb)
            .map(|entry| entry.high_seqno)
            .ok_or(StoreError::NotMyVbucket)
    }

    fn failover_table(&self, vb: Vbid) -> StoreResult<FailoverTable> {
        self.vbuckets
            .lock()
            .unwrap()
            .get(&vb)
            .map(|entry| entry.failover.clone())
            .ok_or(StoreError::NotMyVbucket)
    }

    fn register_cursor(&self, vb: Vbid, name: &str, seqno: Seqno) -> StoreResult<CursorReg> {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get_mut(&vb).ok_or(StoreError::NotMyVbucket)?;

        // A cursor at `s` serves `s + 1` onward, which must still be
        // resident in memory.
        let cursor_seqno = seqno.max(entry.memory_floor.saturating_sub(1));
        let first_snapshot = !entry.cursors.contains_key(name);

        entry.cursors.insert(
            name.to_string(),
            Cursor {
                seqno: cursor_seqno,
                fresh: true,
            },
        );

        Ok(CursorReg {
            cursor_seqno,
            first_snapshot,
        })
    }

    fn remove_cursor(&self, vb: Vbid, name: &str) {
        if let Some(entry) = self.vbuckets.lock().unwrap().get_mut(&vb) {
            entry.cursors.remove(name);
        }
    }

    fn next_snapshot(&self, vb: Vbid, name: &str) -> StoreResult<Option<SnapshotBatch>> {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get_mut(&vb).ok_or(StoreError::NotMyVbucket)?;

        let cursor = match entry.cursors.get(name) {
            Some(cursor) => cursor.seqno,
            None => return Ok(None),
        };

        let items: Vec<Item> = entry
            .items
            .range((Excluded(cursor), Unbounded))
            .map(|(_, item)| item.clone())
            .collect();

        if items.is_empty() {
            return Ok(None);
        }

        let last = items.last().map(|item| item.by_seqno).unwrap_or(cursor);
        let cursor = entry.cursors.get_mut(name).unwrap();
        cursor.seqno = last;
        let checkpoint = std::mem::replace(&mut cursor.fresh, false);

        Ok(Some(SnapshotBatch { items, checkpoint }))
    }

    fn scan(&self, vb: Vbid, start: Seqno, end: Seqno) -> StoreResult<Vec<Item>> {
        self.vbuckets
            .lock()
            .unwrap()
            .get(&vb)
            .map(|entry| {
                entry
                    .items
                    .range(start..=end)
                    .map(|(_, item)| item.clone())
                    .collect()
            })
            .ok_or(StoreError::NotMyVbucket)
    }

    fn set_vbucket_state(&self, vb: Vbid, state: VbState) -> StoreResult<()> {
        MutationSink::set_vbucket_state(self, vb, state)
    }
}

impl MutationSink for MemoryStore {
    fn vbucket_state(&self, vb: Vbid) -> Option<VbState> {
        StreamSource::vbucket_state(self, vb)
    }

    fn high_seqno(&self, vb: Vbid) -> StoreResult<Seqno> {
        StreamSource::high_seqno(self, vb)
    }

    fn snapshot_info(&self, vb: Vbid) -> StoreResult<SnapshotInfo> {
        self.vbuckets
            .lock()
            .unwrap()
            .get(&vb)
            .map(|entry| {
                SnapshotInfo {
                    start: entry.high_seqno,
                    range: entry.snapshot,
                }
                .normalized()
            })
            .ok_or(StoreError::NotMyVbucket)
    }

    fn latest_failover(&self, vb: Vbid) -> StoreResult<FailoverEntry> {
        self.vbuckets
            .lock()
            .unwrap()
            .get(&vb)
            .map(|entry| entry.failover.latest())
            .ok_or(StoreError::NotMyVbucket)
    }

    fn replace_failover(&self, vb: Vbid, pairs: &[(VbUuid, Seqno)]) -> StoreResult<()> {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get_mut(&vb).ok_or(StoreError::NotMyVbucket)?;
        entry.failover.replace_from_pairs(pairs);
        Ok(())
    }

    fn begin_snapshot(&self, vb: Vbid, range: SnapshotRange, _disk: bool) -> StoreResult<()> {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get_mut(&vb).ok_or(StoreError::NotMyVbucket)?;
        entry.snapshot = range;
        Ok(())
    }

    fn apply_mutation(&self, item: &Item) -> StoreResult<()> {
        self.apply(item)
    }

    fn apply_deletion(&self, item: &Item) -> StoreResult<()> {
        self.apply(item)
    }

    fn set_vbucket_state(&self, vb: Vbid, state: VbState) -> StoreResult<()> {
        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get_mut(&vb).ok_or(StoreError::NotMyVbucket)?;
        entry.state = state;
        Ok(())
    }

    fn rollback(&self, vb: Vbid, seqno: Seqno) -> StoreResult<()> {
        if self.take_tmp_fail() {
            return Err(StoreError::TmpFail);
        }

        let mut vbuckets = self.vbuckets.lock().unwrap();
        let entry = vbuckets.get_mut(&vb).ok_or(StoreError::NotMyVbucket)?;

        entry.items.split_off(&(seqno + 1));
        entry.keys.retain(|_, pos| *pos <= seqno);
        entry.high_seqno = entry.high_seqno.min(seqno);
        entry.snapshot = SnapshotRange::new(seqno, seqno);
        for cursor in entry.cursors.values_mut() {
            cursor.seqno = cursor.seqno.min(seqno);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryStore, MutationSink, StoreError, StreamSource};
    use crate::core::{
        item::ItemBuilder,
        types::{SnapshotRange, VbState},
    };

    fn store() -> MemoryStore {
        let store = MemoryStore::default();
        store.add_vbucket(0, VbState::Active, 100);
        store
    }

    #[test]
    fn test_seed_and_scan() {
        let store = store();
        store.seed(0, b"a", b"1");
        store.seed(0, b"b", b"2");
        store.seed(0, b"a", b"3");

        // Key "a" was rewritten at seqno 3; only the winner survives.
        let items = store.scan(0, 1, 10).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].by_seqno, 2);
        assert_eq!(items[1].by_seqno, 3);
        assert_eq!(StreamSource::high_seqno(&store, 0).unwrap(), 3);
    }

    #[test]
    fn test_unknown_vbucket() {
        let store = store();
        assert_eq!(
            store.scan(9, 1, 10).unwrap_err(),
            StoreError::NotMyVbucket
        );
        assert_eq!(StreamSource::vbucket_state(&store, 9), None);
    }

    #[test]
    fn test_cursor_respects_memory_floor() {
        let store = store();
        for n in 0..10 {
            store.seed(0, format!("key{}", n).as_bytes(), b"x");
        }
        store.set_memory_floor(0, 7);

        let reg = store.register_cursor(0, "conn", 0).unwrap();
        assert_eq!(reg.cursor_seqno, 6);
        assert!(reg.first_snapshot);

        let batch = store.next_snapshot(0, "conn").unwrap().unwrap();
        assert_eq!(batch.items.first().unwrap().by_seqno, 7);
        assert_eq!(batch.items.last().unwrap().by_seqno, 10);
        assert!(batch.checkpoint);

        assert!(store.next_snapshot(0, "conn").unwrap().is_none());

        store.seed(0, b"late", b"x");
        let batch = store.next_snapshot(0, "conn").unwrap().unwrap();
        assert_eq!(batch.items.len(), 1);
        assert!(!batch.checkpoint);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let store = store();
        let item = ItemBuilder::default()
            .vbucket(0)
            .key(b"key")
            .value(b"value")
            .by_seqno(4)
            .compose()
            .unwrap();

        store.apply_mutation(&item).unwrap();
        store.apply_mutation(&item).unwrap();

        assert_eq!(store.item_count(0), 1);
        assert_eq!(store.get(0, b"key").unwrap().by_seqno, 4);
        assert_eq!(MutationSink::high_seqno(&store, 0).unwrap(), 4);
    }

    #[test]
    fn test_tmp_fail_injection() {
        let store = store();
        store.inject_tmp_fails(1);

        let item = ItemBuilder::default()
            .vbucket(0)
            .key(b"key")
            .value(b"value")
            .by_seqno(1)
            .compose()
            .unwrap();

        assert_eq!(store.apply_mutation(&item).unwrap_err(), StoreError::TmpFail);
        store.apply_mutation(&item).unwrap();
    }

    #[test]
    fn test_rollback_truncates() {
        let store = store();
        for n in 0..5 {
            store.seed(0, format!("key{}", n).as_bytes(), b"x");
        }

        store.rollback(0, 2).unwrap();

        assert_eq!(store.item_count(0), 2);
        assert_eq!(MutationSink::high_seqno(&store, 0).unwrap(), 2);
        assert!(store.get(0, b"key4").is_none());

        let info = store.snapshot_info(0).unwrap();
        assert_eq!(info.range, SnapshotRange::new(2, 2));
    }

    #[test]
    fn test_snapshot_bookkeeping() {
        let store = store();
        store
            .begin_snapshot(0, SnapshotRange::new(1, 8), false)
            .unwrap();

        let item = ItemBuilder::default()
            .vbucket(0)
            .key(b"key")
            .value(b"value")
            .by_seqno(5)
            .compose()
            .unwrap();
        store.apply_mutation(&item).unwrap();

        // Mid-snapshot: resume point is the snapshot start.
        let info = store.snapshot_info(0).unwrap();
        assert_eq!(info.start, 5);
        assert_eq!(info.range.start, 1);
        assert_eq!(info.range.end, 8);
    }
}
