use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Producer-side accounting of bytes in flight to the peer.
///
/// A window of 0 disables flow control entirely.
#[derive(Debug)]
pub struct BufferLog {
    max_bytes: AtomicU64,
    bytes_sent: AtomicU64,
    acked_bytes: AtomicU64,
}

impl BufferLog {
    pub fn new(max_bytes: u64) -> BufferLog {
        BufferLog {
            max_bytes: AtomicU64::new(max_bytes),
            bytes_sent: AtomicU64::new(0),
            acked_bytes: AtomicU64::new(0),
        }
    }

    pub fn buffer_size(&self) -> u64 {
        self.max_bytes.load(Ordering::Relaxed)
    }

    /// Resizing never cancels in-flight bytes; a shrunken window simply
    /// stays full for longer.
    pub fn set_buffer_size(&self, max_bytes: u64) {
        self.max_bytes.store(max_bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn acked_bytes(&self) -> u64 {
        self.acked_bytes.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.buffer_size() > 0
    }

    pub fn is_full(&self) -> bool {
        self.is_enabled() && self.bytes_sent() >= self.buffer_size()
    }

    /// Bill `bytes` to the window. Fails without billing when the send
    /// would overrun the window; an event larger than the whole window
    /// is admitted alone once the window is empty.
    pub fn insert(&self, bytes: u64) -> bool {
        let max = self.buffer_size();

        self.bytes_sent
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |sent| {
                if max > 0 && sent > 0 && sent + bytes > max {
                    None
                } else {
                    Some(sent + bytes)
                }
            })
            .is_ok()
    }

    /// Credit bytes acknowledged by the peer, flooring at zero.
    pub fn free(&self, bytes: u64) {
        self.bytes_sent
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |sent| {
                Some(sent.saturating_sub(bytes))
            })
            .ok();
        self.acked_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Consumer-side accounting of received bytes pending acknowledgement.
///
/// Acks are batched: one BUFFER_ACK per `window / 5` bytes drained.
#[derive(Debug)]
pub struct FlowControl {
    window: AtomicU64,
    freed: AtomicU64,
    pending_control: AtomicBool,
}

impl FlowControl {
    pub fn new(window: u64) -> FlowControl {
        FlowControl {
            window: AtomicU64::new(window),
            freed: AtomicU64::new(0),
            pending_control: AtomicBool::new(window > 0),
        }
    }

    pub fn window(&self) -> u64 {
        self.window.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.window() > 0
    }

    /// Change the advertised window. The peer learns about it through a
    /// fresh `connection_buffer_size` control message.
    pub fn set_window(&self, window: u64) {
        self.window.store(window, Ordering::Relaxed);
        self.pending_control.store(window > 0, Ordering::Relaxed);
    }

    pub fn freed_bytes(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }

    pub fn add_freed(&self, bytes: u64) {
        if self.is_enabled() {
            self.freed.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn ack_threshold(&self) -> u64 {
        (self.window() / 5).max(1)
    }

    pub fn is_sufficiently_drained(&self) -> bool {
        self.is_enabled() && self.freed_bytes() >= self.ack_threshold()
    }

    /// The freed-byte delta to acknowledge, if the batching threshold
    /// has been crossed. Resets the counter.
    pub fn take_ack(&self) -> Option<u64> {
        if !self.is_sufficiently_drained() {
            return None;
        }

        self.freed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |freed| {
                if freed >= self.ack_threshold() {
                    Some(0)
                } else {
                    None
                }
            })
            .ok()
            .filter(|freed| *freed > 0)
    }

    /// The window announcement to send, once per (re)negotiation
    pub fn take_pending_control(&self) -> Option<u64> {
        if self
            .pending_control
            .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            Some(self.window())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferLog, FlowControl};

    #[test]
    fn test_buffer_log_fills_and_drains() {
        let log = BufferLog::new(1024);

        assert!(log.insert(1020));
        assert!(!log.is_full());

        // A send that would overrun the window is refused outright.
        assert!(!log.insert(100));
        assert_eq!(log.bytes_sent(), 1020);

        log.free(96);
        assert!(log.insert(100));
        assert_eq!(log.bytes_sent(), 1024);
        assert!(log.is_full());
    }

    #[test]
    fn test_buffer_log_free_floors_at_zero() {
        let log = BufferLog::new(100);
        assert!(log.insert(10));

        log.free(50);
        assert_eq!(log.bytes_sent(), 0);
        assert_eq!(log.acked_bytes(), 50);
    }

    #[test]
    fn test_buffer_log_admits_oversized_event_alone() {
        let log = BufferLog::new(100);

        assert!(log.insert(500));
        assert!(log.is_full());
        assert!(!log.insert(1));

        log.free(500);
        assert!(log.insert(10));
    }

    #[test]
    fn test_buffer_log_unbounded() {
        let log = BufferLog::new(0);

        assert!(!log.is_enabled());
        assert!(log.insert(u64::MAX / 2));
        assert!(!log.is_full());
    }

    #[test]
    fn test_buffer_log_shrink_keeps_inflight_bytes() {
        let log = BufferLog::new(1000);
        assert!(log.insert(800));

        log.set_buffer_size(500);
        assert!(log.is_full());
        assert_eq!(log.bytes_sent(), 800);
    }

    #[test]
    fn test_flow_control_ack_batches() {
        let flow = FlowControl::new(1000);
        assert_eq!(flow.ack_threshold(), 200);

        flow.add_freed(150);
        assert_eq!(flow.take_ack(), None);

        flow.add_freed(60);
        assert_eq!(flow.take_ack(), Some(210));
        assert_eq!(flow.freed_bytes(), 0);
    }

    #[test]
    fn test_flow_control_disabled() {
        let flow = FlowControl::new(0);

        flow.add_freed(10_000);
        assert_eq!(flow.take_ack(), None);
        assert_eq!(flow.take_pending_control(), None);
    }

    #[test]
    fn test_flow_control_announces_window_once() {
        let flow = FlowControl::new(512);

        assert_eq!(flow.take_pending_control(), Some(512));
        assert_eq!(flow.take_pending_control(), None);

        flow.set_window(1024);
        assert_eq!(flow.take_pending_control(), Some(1024));
    }
}
