use std::{
    collections::VecDeque,
    sync::Mutex,
};

use riptide_lib::core::{
    item::Item,
    types::{Seqno, Vbid},
};
use tokio::sync::Notify;

use crate::config::ConnectionConfig;

/// One scheduled disk scan
pub struct Backfill {
    pub vbucket: Vbid,
    pub start: Seqno,
    pub end: Seqno,
    /// Items read off disk but not yet fed to the stream
    pub items: Option<VecDeque<Item>>,
    pub snapshot_marked: bool,
}

impl Backfill {
    fn new(vbucket: Vbid, start: Seqno, end: Seqno) -> Backfill {
        Backfill {
            vbucket,
            start,
            end,
            items: None,
            snapshot_marked: false,
        }
    }
}

struct ManagerInner {
    active: VecDeque<Backfill>,
    pending: VecDeque<Backfill>,
    /// Scans currently held by the scan task
    checked_out: usize,
    buffer_bytes: u64,
    next_read_size: u64,
    full: bool,
}

/// Shared budget for the disk scans feeding a connection's streams:
/// a bounded number of live scans, and a bounded number of scanned
/// bytes outstanding (fed to streams but not yet sent).
pub struct BackfillManager {
    inner: Mutex<ManagerInner>,
    notify: Notify,
    max_bytes: u64,
    scan_budget: usize,
}

impl BackfillManager {
    pub fn new(config: &ConnectionConfig) -> BackfillManager {
        BackfillManager {
            inner: Mutex::new(ManagerInner {
                active: VecDeque::new(),
                pending: VecDeque::new(),
                checked_out: 0,
                buffer_bytes: 0,
                next_read_size: 0,
                full: false,
            }),
            notify: Notify::new(),
            max_bytes: config.backfill_byte_budget,
            scan_budget: config.backfill_scan_budget,
        }
    }

    pub fn schedule(&self, vbucket: Vbid, start: Seqno, end: Seqno) {
        let mut inner = self.inner.lock().unwrap();
        let scan = Backfill::new(vbucket, start, end);

        if inner.active.len() + inner.checked_out < self.scan_budget {
            inner.active.push_back(scan);
        } else {
            inner.pending.push_back(scan);
        }

        debug!(
            "(vb {}) Backfill scheduled for [{}, {}]",
            vbucket, start, end
        );
        self.notify.notify_one();
    }

    /// Check out the next scan to service, round-robin
    pub fn next_scan(&self) -> Option<Backfill> {
        let mut inner = self.inner.lock().unwrap();
        let scan = inner.active.pop_front()?;
        inner.checked_out += 1;
        Some(scan)
    }

    /// Put a partially serviced scan back at the head of the queue
    pub fn requeue(&self, scan: Backfill) {
        let mut inner = self.inner.lock().unwrap();
        inner.checked_out -= 1;
        inner.active.push_front(scan);
    }

    /// Retire a checked-out scan and admit a waiting one in its place
    pub fn complete_scan(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.checked_out -= 1;
        self.promote(&mut inner);
        if !inner.active.is_empty() {
            self.notify.notify_one();
        }
    }

    /// Drop queued scans for a vbucket whose stream died
    pub fn cancel(&self, vbucket: Vbid) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.retain(|scan| scan.vbucket != vbucket);
        inner.pending.retain(|scan| scan.vbucket != vbucket);
        self.promote(&mut inner);
    }

    fn promote(&self, inner: &mut ManagerInner) {
        while inner.active.len() + inner.checked_out < self.scan_budget {
            match inner.pending.pop_front() {
                Some(scan) => inner.active.push_back(scan),
                None => break,
            }
        }
    }

    /// Admit `bytes` of freshly scanned data into the outstanding-bytes
    /// budget. A single read larger than the whole budget is admitted
    /// alone; anything else waits for the streams to drain.
    pub fn bytes_read(&self, bytes: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.buffer_bytes > 0 && inner.buffer_bytes + bytes > self.max_bytes {
            inner.full = true;
            inner.next_read_size = bytes;
            return false;
        }

        inner.buffer_bytes += bytes;
        true
    }

    /// Return budget for scanned bytes that made it to the wire or were
    /// discarded with their stream
    pub fn bytes_sent(&self, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.buffer_bytes = inner.buffer_bytes.saturating_sub(bytes);

        if inner.full
            && (inner.buffer_bytes == 0
                || inner.buffer_bytes + inner.next_read_size <= self.max_bytes)
        {
            inner.full = false;
            inner.next_read_size = 0;
            self.notify.notify_one();
        }
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().unwrap().full
    }

    pub fn bytes_outstanding(&self) -> u64 {
        self.inner.lock().unwrap().buffer_bytes
    }

    pub fn has_work(&self) -> bool {
        !self.inner.lock().unwrap().active.is_empty()
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::BackfillManager;
    use crate::config::ConnectionConfig;

    fn manager(byte_budget: u64, scan_budget: usize) -> BackfillManager {
        let config = ConnectionConfig {
            backfill_byte_budget: byte_budget,
            backfill_scan_budget: scan_budget,
            ..ConnectionConfig::default()
        };
        BackfillManager::new(&config)
    }

    #[test]
    fn test_scan_budget_queues_excess() {
        let manager = manager(1024, 2);
        manager.schedule(0, 1, 10);
        manager.schedule(1, 1, 10);
        manager.schedule(2, 1, 10);

        let first = manager.next_scan().unwrap();
        let second = manager.next_scan().unwrap();
        assert_eq!((first.vbucket, second.vbucket), (0, 1));

        // The third scan waits for a slot.
        assert!(manager.next_scan().is_none());

        manager.complete_scan();
        assert_eq!(manager.next_scan().unwrap().vbucket, 2);
    }

    #[test]
    fn test_requeue_keeps_position() {
        let manager = manager(1024, 2);
        manager.schedule(0, 1, 10);
        manager.schedule(1, 1, 10);

        let scan = manager.next_scan().unwrap();
        manager.requeue(scan);
        assert_eq!(manager.next_scan().unwrap().vbucket, 0);
    }

    #[test]
    fn test_byte_budget_fills_and_drains() {
        let manager = manager(100, 2);

        assert!(manager.bytes_read(60));
        assert!(!manager.bytes_read(50));
        assert!(manager.is_full());

        manager.bytes_sent(40);
        assert!(!manager.is_full());
        assert!(manager.bytes_read(50));
        assert_eq!(manager.bytes_outstanding(), 70);
    }

    #[test]
    fn test_oversized_read_admitted_alone() {
        let manager = manager(100, 2);
        assert!(manager.bytes_read(500));
        assert!(!manager.bytes_read(1));
    }

    #[test]
    fn test_cancel_drops_scans() {
        let manager = manager(1024, 1);
        manager.schedule(0, 1, 10);
        manager.schedule(1, 1, 10);

        manager.cancel(0);
        assert_eq!(manager.next_scan().unwrap().vbucket, 1);
        assert!(manager.next_scan().is_none());
    }
}
