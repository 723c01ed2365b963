/// Passive stream state machine
pub mod stream;

pub use stream::{Drained, IngestOutcome, PassiveState, PassiveStream};

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use riptide_lib::core::{
    store::{MutationSink, StoreError},
    types::{Opaque, Seqno, VbState, Vbid},
    window::FlowControl,
};
use tokio::sync::Notify;

use crate::{
    config::ConnectionConfig,
    node::error::{DcpError, DcpResult},
    proto::event::{control_keys, DcpEvent, EndStreamReason, Status, StreamReqBody},
};

/// Verdict of one processor visit over the buffered streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// New events arrived while draining, go again immediately
    MoreToProcess,
    /// Every buffer is empty
    AllProcessed,
    /// The write path pushed back, retry after a long snooze
    CannotProcess,
}

/// Verdict of one rollback attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    Done,
    /// Storage returned a temporary failure, reschedule
    Retry,
    /// The vbucket is gone, abandon the stream
    Dropped,
}

/// A rollback the producer demanded, pending execution on the writer
/// task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackReq {
    pub opaque: Opaque,
    pub vbucket: Vbid,
    pub seqno: Seqno,
}

struct PendingControls {
    enable_noop: AtomicBool,
    noop_interval: AtomicBool,
    priority: AtomicBool,
    ext_metadata: AtomicBool,
    value_compression: AtomicBool,
    cursor_dropping: AtomicBool,
}

struct ConsumerInner {
    streams: HashMap<Vbid, PassiveStream>,
    ready: VecDeque<Vbid>,
    /// stream opaque -> (peer opaque, vbucket) for outstanding requests
    opaque_map: HashMap<Opaque, (Opaque, Vbid)>,
}

impl ConsumerInner {
    fn push_ready(&mut self, vbucket: Vbid) {
        if !self.ready.contains(&vbucket) {
            self.ready.push_back(vbucket);
        }
    }
}

/// Consumer endpoint: multiplexes passive streams, owns the inbound
/// flow-control window and feeds the background processor task.
pub struct DcpConsumer<S> {
    name: String,
    store: Arc<S>,
    config: ConnectionConfig,
    flow: FlowControl,
    pending: PendingControls,
    last_noop_rx: Mutex<Instant>,
    opaque_counter: AtomicU32,
    disconnect: AtomicBool,
    items_to_process: AtomicBool,
    processor_cancelled: AtomicBool,
    backoffs: AtomicU64,
    rollbacks: Mutex<VecDeque<RollbackReq>>,
    inner: Mutex<ConsumerInner>,
    processor_notify: Notify,
    rollback_notify: Notify,
    ready_notify: Notify,
}

impl<S: MutationSink> DcpConsumer<S> {
    pub fn new(name: &str, store: Arc<S>, config: &ConnectionConfig) -> DcpConsumer<S> {
        DcpConsumer {
            name: name.to_string(),
            store,
            flow: FlowControl::new(config.connection_buffer_size),
            pending: PendingControls {
                enable_noop: AtomicBool::new(config.enable_noop),
                noop_interval: AtomicBool::new(config.enable_noop),
                priority: AtomicBool::new(true),
                ext_metadata: AtomicBool::new(config.enable_ext_metadata),
                value_compression: AtomicBool::new(config.enable_value_compression),
                cursor_dropping: AtomicBool::new(config.supports_cursor_dropping),
            },
            last_noop_rx: Mutex::new(Instant::now()),
            opaque_counter: AtomicU32::new(0),
            disconnect: AtomicBool::new(false),
            items_to_process: AtomicBool::new(false),
            processor_cancelled: AtomicBool::new(false),
            backoffs: AtomicU64::new(0),
            rollbacks: Mutex::new(VecDeque::new()),
            inner: Mutex::new(ConsumerInner {
                streams: HashMap::new(),
                ready: VecDeque::new(),
                opaque_map: HashMap::new(),
            }),
            processor_notify: Notify::new(),
            rollback_notify: Notify::new(),
            ready_notify: Notify::new(),
            config: config.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flow_control(&self) -> &FlowControl {
        &self.flow
    }

    pub fn backoffs(&self) -> u64 {
        self.backoffs.load(Ordering::Relaxed)
    }

    pub fn disconnected(&self) -> bool {
        self.disconnect.load(Ordering::Relaxed)
    }

    pub fn processor_cancelled(&self) -> bool {
        self.processor_cancelled.load(Ordering::Relaxed)
    }

    pub fn processor_snooze(&self) -> (u64, u64) {
        (
            self.config.processor_idle_timer,
            self.config.processor_throttle_timer,
        )
    }

    pub fn rollback_retry_timer(&self) -> u64 {
        self.config.rollback_retry_timer
    }

    pub fn is_stream_present(&self, vbucket: Vbid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(&vbucket)
            .map_or(false, PassiveStream::is_active)
    }

    /// Resolves when the stepper may have output again
    pub async fn wait_ready(&self) {
        self.ready_notify.notified().await
    }

    pub async fn processor_notified(&self) {
        self.processor_notify.notified().await
    }

    pub async fn rollback_notified(&self) {
        self.rollback_notify.notified().await
    }

    /// Allocate a stream opaque, skipping tokens still in flight
    fn next_opaque(&self, inner: &ConsumerInner) -> Opaque {
        loop {
            let candidate = self
                .opaque_counter
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if !inner.opaque_map.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Open a passive stream for a vbucket on behalf of `opaque`
    pub fn add_stream(&self, opaque: Opaque, vbucket: Vbid, flags: u32) -> DcpResult<()> {
        if self.disconnected() {
            return Err(DcpError::Disconnect);
        }

        match self.store.vbucket_state(vbucket) {
            None => {
                warn!(
                    "(vb {}) Add stream failed because this vbucket doesn't exist",
                    vbucket
                );
                return Err(DcpError::NotMyVbucket);
            }
            Some(VbState::Active) => {
                warn!(
                    "(vb {}) Add stream failed because this vbucket is in active state",
                    vbucket
                );
                return Err(DcpError::NotMyVbucket);
            }
            Some(_) => {}
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(stream) = inner.streams.get(&vbucket) {
            if stream.is_active() {
                warn!(
                    "(vb {}) Cannot add stream because one already exists",
                    vbucket
                );
                return Err(DcpError::KeyExists);
            }
        }

        let high_seqno = self.store.high_seqno(vbucket)?;
        let info = self.store.snapshot_info(vbucket)?.normalized();
        let entry = self.store.latest_failover(vbucket)?;

        let stream_opaque = self.next_opaque(&inner);
        let stream = PassiveStream::new(
            flags,
            stream_opaque,
            vbucket,
            info.start,
            entry.vb_uuid,
            info.range.start,
            info.range.end,
            high_seqno,
        );

        inner.streams.insert(vbucket, stream);
        inner.opaque_map.insert(stream_opaque, (opaque, vbucket));
        inner.push_ready(vbucket);
        drop(inner);

        self.ready_notify.notify_one();
        Ok(())
    }

    /// Close a stream previously opened with `add_stream`
    pub fn close_stream(&self, opaque: Opaque, vbucket: Vbid) -> DcpResult<()> {
        if self.disconnected() {
            return Err(DcpError::Disconnect);
        }

        let mut inner = self.inner.lock().unwrap();
        inner.opaque_map.remove(&opaque);

        let stream = inner
            .streams
            .get_mut(&vbucket)
            .ok_or(DcpError::KeyEnoent)?;
        let unacked = stream.set_dead(EndStreamReason::Closed);
        drop(inner);

        self.flow.add_freed(unacked);
        Ok(())
    }

    /// Route one inbound event. A returned event is the immediate reply
    /// the transport must write.
    pub fn dispatch(&self, event: DcpEvent) -> DcpResult<Option<DcpEvent>> {
        if self.disconnected() {
            return Err(DcpError::Disconnect);
        }

        // Seqno 0 is reserved invalid and poisons the connection.
        if event.by_seqno() == Some(0) {
            warn!(
                "(vb {}) Invalid sequence number 0 for mutation",
                event.vbucket()
            );
            return Err(DcpError::Invalid);
        }

        if let DcpEvent::SnapshotMarker(marker) = &event {
            if marker.start > marker.end {
                warn!(
                    "(vb {}) Invalid snapshot marker [{}, {}]",
                    marker.vbucket, marker.start, marker.end
                );
                return Err(DcpError::Invalid);
            }
        }

        match event {
            DcpEvent::AddStream {
                opaque,
                vbucket,
                flags,
            } => self.add_stream(opaque, vbucket, flags).map(|_| None),
            DcpEvent::Noop { opaque } => {
                *self.last_noop_rx.lock().unwrap() = Instant::now();
                Ok(Some(DcpEvent::NoopRsp { opaque }))
            }
            DcpEvent::StreamReqRsp { opaque, body } => self.stream_req_response(opaque, body),
            DcpEvent::ControlRsp { .. } => Ok(None),
            DcpEvent::Mutation { .. }
            | DcpEvent::Deletion { .. }
            | DcpEvent::Expiration { .. }
            | DcpEvent::SnapshotMarker(_)
            | DcpEvent::SetVbState { .. }
            | DcpEvent::StreamEnd { .. } => self.route_to_stream(event),
            other => {
                warn!(
                    "Consumer received unexpected event {:?}, disconnecting",
                    other.opcode()
                );
                Err(DcpError::Invalid)
            }
        }
    }

    fn route_to_stream(&self, event: DcpEvent) -> DcpResult<Option<DcpEvent>> {
        let vbucket = event.vbucket();
        let opaque = event.opaque();
        let wire_len = event.wire_len() as u64;

        let mut inner = self.inner.lock().unwrap();
        let stream = match inner.streams.get_mut(&vbucket) {
            Some(stream) if stream.opaque() == opaque && stream.is_active() => stream,
            _ => {
                drop(inner);
                // The stream is gone; its bytes still count against the
                // window the producer sees.
                self.flow.add_freed(wire_len);
                return Err(DcpError::KeyEnoent);
            }
        };

        let outcome = match stream.ingest(event, &*self.store, self.store.should_throttle()) {
            Ok(outcome) => outcome,
            Err(error) => {
                drop(inner);
                self.flow.add_freed(wire_len);
                return Err(error);
            }
        };

        let mut woke = outcome.woke;
        if outcome.reconnect {
            woke |= self.reconnect_stream(&mut inner, vbucket)?;
        }
        if woke {
            inner.push_ready(vbucket);
        }
        drop(inner);

        self.flow.add_freed(outcome.freed);
        if woke {
            self.ready_notify.notify_one();
        }
        if outcome.buffered {
            self.wake_processor();
        }

        Ok(None)
    }

    fn reconnect_stream(&self, inner: &mut ConsumerInner, vbucket: Vbid) -> DcpResult<bool> {
        let stream = inner
            .streams
            .get_mut(&vbucket)
            .ok_or(DcpError::KeyEnoent)?;

        let woke = stream.reconnect(&*self.store)?;
        let stream_opaque = stream.opaque();
        inner
            .opaque_map
            .insert(stream_opaque, (stream_opaque, vbucket));
        inner.push_ready(vbucket);
        Ok(woke)
    }

    fn stream_req_response(
        &self,
        opaque: Opaque,
        body: StreamReqBody,
    ) -> DcpResult<Option<DcpEvent>> {
        let mut inner = self.inner.lock().unwrap();

        let (add_opaque, vbucket) = match inner.opaque_map.get(&opaque) {
            Some(entry) => *entry,
            None => {
                warn!(
                    "Received stream response with opaque {} but no request is outstanding",
                    opaque
                );
                return Err(DcpError::KeyEnoent);
            }
        };

        let valid = inner
            .streams
            .get(&vbucket)
            .map_or(false, |stream| stream.opaque() == opaque);
        if !valid {
            warn!(
                "(vb {}) Stream response with opaque {} but that stream no longer exists",
                vbucket, opaque
            );
            inner.opaque_map.remove(&opaque);
            return Err(DcpError::KeyEnoent);
        }

        match body {
            StreamReqBody::Rollback(seqno) => {
                info!(
                    "(vb {}) Received rollback request to roll back to seqno {}",
                    vbucket, seqno
                );
                drop(inner);
                self.rollbacks.lock().unwrap().push_back(RollbackReq {
                    opaque,
                    vbucket,
                    seqno,
                });
                self.rollback_notify.notify_one();
                Ok(None)
            }
            StreamReqBody::Accepted(entries) => {
                self.store.replace_failover(vbucket, &entries)?;

                let stream = inner.streams.get_mut(&vbucket).unwrap();
                let woke = stream.accept_stream(Status::Ok, add_opaque);
                inner.opaque_map.remove(&opaque);
                info!("(vb {}) Stream accepted with opaque {}", vbucket, opaque);

                if woke {
                    inner.push_ready(vbucket);
                }
                drop(inner);
                if woke {
                    self.ready_notify.notify_one();
                }
                Ok(None)
            }
        }
    }

    /// Pop the next pending rollback request, if any
    pub fn next_rollback(&self) -> Option<RollbackReq> {
        self.rollbacks.lock().unwrap().pop_front()
    }

    /// Execute one rollback attempt against storage
    pub fn do_rollback(&self, request: RollbackReq) -> RollbackOutcome {
        match self.store.rollback(request.vbucket, request.seqno) {
            Err(StoreError::TmpFail) | Err(StoreError::OutOfMemory) => {
                self.backoffs.fetch_add(1, Ordering::Relaxed);
                RollbackOutcome::Retry
            }
            Err(StoreError::NotMyVbucket) => {
                warn!(
                    "(vb {}) Rollback failed because the vbucket was not found",
                    request.vbucket
                );
                let mut inner = self.inner.lock().unwrap();
                inner.opaque_map.remove(&request.opaque);
                RollbackOutcome::Dropped
            }
            Ok(()) => {
                let mut inner = self.inner.lock().unwrap();
                match self.reconnect_stream(&mut inner, request.vbucket) {
                    Ok(_) => {
                        drop(inner);
                        self.ready_notify.notify_one();
                        RollbackOutcome::Done
                    }
                    Err(_) => RollbackOutcome::Dropped,
                }
            }
        }
    }

    fn wake_processor(&self) {
        if self
            .items_to_process
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.processor_notify.notify_one();
        }
    }

    /// Drain buffered events across all vbuckets, one batch at a time.
    /// Runs on the processor task.
    pub fn process_buffered_items(&self) -> ProcessResult {
        self.items_to_process.store(false, Ordering::SeqCst);
        let mut result = ProcessResult::AllProcessed;

        let vbuckets: Vec<Vbid> = {
            let inner = self.inner.lock().unwrap();
            inner.streams.keys().copied().collect()
        };

        for vbucket in vbuckets {
            loop {
                if self.store.should_throttle() {
                    self.backoffs.fetch_add(1, Ordering::Relaxed);
                    return ProcessResult::CannotProcess;
                }

                let mut inner = self.inner.lock().unwrap();
                let stream = match inner.streams.get_mut(&vbucket) {
                    Some(stream) => stream,
                    None => break,
                };

                let drained = stream.process_buffered(&*self.store, self.config.processor_batch);
                let mut woke = drained.woke;
                if drained.reconnect {
                    woke |= self.reconnect_stream(&mut inner, vbucket).unwrap_or(false);
                }
                if woke {
                    inner.push_ready(vbucket);
                }
                drop(inner);

                self.flow.add_freed(drained.freed);
                if woke {
                    self.ready_notify.notify_one();
                }

                if drained.failed {
                    result = ProcessResult::CannotProcess;
                    break;
                }
                if drained.freed == 0 {
                    break;
                }
            }
        }

        if self.flow.is_sufficiently_drained() {
            // Nudge the stepper so the buffer ack goes out promptly.
            self.ready_notify.notify_one();
        }

        if result == ProcessResult::AllProcessed && self.items_to_process.load(Ordering::SeqCst) {
            return ProcessResult::MoreToProcess;
        }
        result
    }

    /// Drive one unit of output. `Ok(Some(event))` means write it and
    /// call again; `Ok(None)` means nothing to send right now.
    pub fn step(&self) -> DcpResult<Option<DcpEvent>> {
        if self.disconnected() {
            return Err(DcpError::Disconnect);
        }

        if let Some(window) = self.flow.take_pending_control() {
            return Ok(Some(self.control_message(
                control_keys::CONNECTION_BUFFER_SIZE,
                window.to_string(),
            )));
        }

        if take_flag(&self.pending.enable_noop) {
            return Ok(Some(
                self.control_message(control_keys::ENABLE_NOOP, "true".to_string()),
            ));
        }

        if take_flag(&self.pending.noop_interval) {
            return Ok(Some(self.control_message(
                control_keys::SET_NOOP_INTERVAL,
                self.config.noop_interval.to_string(),
            )));
        }

        if self.config.enable_noop {
            let idle = self.last_noop_rx.lock().unwrap().elapsed().as_secs();
            if idle > self.config.noop_interval.saturating_mul(2) {
                warn!(
                    "Disconnecting because no noop was received for {} seconds",
                    idle
                );
                self.set_disconnect();
                return Err(DcpError::Disconnect);
            }
        }

        if take_flag(&self.pending.priority) {
            return Ok(Some(self.control_message(
                control_keys::SET_PRIORITY,
                self.config.priority.as_str().to_string(),
            )));
        }

        if take_flag(&self.pending.ext_metadata) {
            return Ok(Some(self.control_message(
                control_keys::ENABLE_EXT_METADATA,
                "true".to_string(),
            )));
        }

        if take_flag(&self.pending.value_compression) {
            return Ok(Some(self.control_message(
                control_keys::ENABLE_VALUE_COMPRESSION,
                "true".to_string(),
            )));
        }

        if take_flag(&self.pending.cursor_dropping) {
            return Ok(Some(self.control_message(
                control_keys::SUPPORTS_CURSOR_DROPPING,
                "true".to_string(),
            )));
        }

        if let Some(bytes) = self.flow.take_ack() {
            let inner = self.inner.lock().unwrap();
            let opaque = self.next_opaque(&inner);
            drop(inner);
            return Ok(Some(DcpEvent::BufferAck {
                opaque,
                bytes: bytes as u32,
            }));
        }

        let mut inner = self.inner.lock().unwrap();
        while let Some(vbucket) = inner.ready.pop_front() {
            let stream = match inner.streams.get_mut(&vbucket) {
                Some(stream) => stream,
                None => continue,
            };

            let event = match stream.next() {
                Some(event) => event,
                None => continue,
            };

            debug_assert!(matches!(
                event,
                DcpEvent::StreamReq(_)
                    | DcpEvent::AddStreamRsp { .. }
                    | DcpEvent::SetVbStateRsp { .. }
                    | DcpEvent::SnapshotMarkerRsp { .. }
            ));

            inner.ready.push_back(vbucket);
            return Ok(Some(event));
        }

        Ok(None)
    }

    fn control_message(&self, key: &str, value: String) -> DcpEvent {
        let inner = self.inner.lock().unwrap();
        let opaque = self.next_opaque(&inner);
        drop(inner);

        DcpEvent::Control {
            opaque,
            key: key.to_string(),
            value,
        }
    }

    /// Idempotent teardown: every stream dies with reason
    /// `disconnected`, the processor and rollback tasks are released.
    pub fn set_disconnect(&self) {
        if self.disconnect.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Consumer {} disconnecting, closing all streams", self.name);

        let mut inner = self.inner.lock().unwrap();
        for stream in inner.streams.values_mut() {
            stream.set_dead(EndStreamReason::Disconnected);
        }
        inner.ready.clear();
        inner.opaque_map.clear();
        drop(inner);

        self.cancel_processor();
        self.rollback_notify.notify_one();
        self.ready_notify.notify_one();
    }

    /// Single-shot cancellation of the processor task
    pub fn cancel_processor(&self) {
        if self
            .processor_cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.processor_notify.notify_one();
        }
    }
}

fn take_flag(flag: &AtomicBool) -> bool {
    flag.compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use riptide_lib::core::{store::MemoryStore, types::VbState};

    use super::DcpConsumer;
    use crate::{
        node::error::DcpError,
        proto::event::{control_keys, DcpEvent},
        utils::testing::{memory_marker, mutation, replica_store, CONFIG},
    };

    fn consumer() -> (Arc<MemoryStore>, Arc<DcpConsumer<MemoryStore>>) {
        let store = replica_store(0);
        let consumer = Arc::new(DcpConsumer::new("test", store.clone(), &CONFIG));
        (store, consumer)
    }

    #[test]
    fn test_add_stream_validates_vbucket() {
        let (store, consumer) = consumer();

        assert_eq!(
            consumer.add_stream(1, 9, 0).unwrap_err(),
            DcpError::NotMyVbucket
        );

        store.add_vbucket(2, VbState::Active, 100);
        assert_eq!(
            consumer.add_stream(1, 2, 0).unwrap_err(),
            DcpError::NotMyVbucket
        );

        consumer.add_stream(1, 0, 0).unwrap();
        assert!(consumer.is_stream_present(0));
    }

    #[test]
    fn test_negotiation_precedes_the_stream_request() {
        let (_, consumer) = consumer();
        consumer.add_stream(1, 0, 0).unwrap();

        let mut controls = Vec::new();
        let mut saw_request = false;
        while let Some(event) = consumer.step().unwrap() {
            match event {
                DcpEvent::Control { key, .. } => {
                    assert!(!saw_request, "control after stream request");
                    controls.push(key);
                }
                DcpEvent::StreamReq(_) => saw_request = true,
                other => panic!("unexpected event {:?}", other),
            }
        }

        assert!(saw_request);
        // The window is announced before anything else.
        assert_eq!(controls[0], control_keys::CONNECTION_BUFFER_SIZE);
        assert!(controls
            .iter()
            .any(|key| key == control_keys::ENABLE_NOOP));
        assert!(controls
            .iter()
            .any(|key| key == control_keys::SET_PRIORITY));
    }

    #[test]
    fn test_noop_resets_the_watchdog_and_answers() {
        let (_, consumer) = consumer();

        match consumer.dispatch(DcpEvent::Noop { opaque: 42 }).unwrap() {
            Some(DcpEvent::NoopRsp { opaque }) => assert_eq!(opaque, 42),
            other => panic!("expected noop response, got {:?}", other),
        }
    }

    #[test]
    fn test_close_stream_credits_buffered_bytes() {
        let (store, consumer) = consumer();
        consumer.add_stream(1, 0, 0).unwrap();
        consumer
            .dispatch(DcpEvent::StreamReqRsp {
                opaque: 1,
                body: crate::proto::event::StreamReqBody::Accepted(vec![(100, 0)]),
            })
            .unwrap();
        consumer.dispatch(memory_marker(1, 0, 1, 1)).unwrap();

        // A temporary failure parks the mutation in the stream buffer.
        store.inject_tmp_fails(1);
        consumer.dispatch(mutation(1, 0, 1)).unwrap();

        let before = consumer.flow_control().freed_bytes();
        consumer.close_stream(1, 0).unwrap();
        assert!(consumer.flow_control().freed_bytes() > before);
        assert!(!consumer.is_stream_present(0));

        assert_eq!(
            consumer.close_stream(1, 9).unwrap_err(),
            DcpError::KeyEnoent
        );
    }

    #[test]
    fn test_disconnect_is_idempotent_and_final() {
        let (_, consumer) = consumer();
        consumer.add_stream(1, 0, 0).unwrap();

        consumer.set_disconnect();
        consumer.set_disconnect();

        assert!(!consumer.is_stream_present(0));
        assert_eq!(consumer.step().unwrap_err(), DcpError::Disconnect);
        assert_eq!(
            consumer.add_stream(2, 0, 0).unwrap_err(),
            DcpError::Disconnect
        );
    }
}
