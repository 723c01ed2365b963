/// Backfill scheduling and budgets
pub mod backfill;

/// Active stream state machine
pub mod stream;

pub use backfill::BackfillManager;
pub use stream::{ActiveState, ActiveStream, BackfillFeed};

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use riptide_lib::core::{
    store::StreamSource,
    types::{Opaque, Seqno, Vbid},
    window::BufferLog,
};
use tokio::sync::Notify;

use crate::{
    config::ConnectionConfig,
    node::{
        error::{DcpError, DcpResult},
        ConnPriority,
    },
    proto::event::{
        control_keys, DcpEvent, EndStreamReason, Status, StreamReq, StreamReqBody,
    },
};

/// Outcome of servicing one backfill scan slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillStatus {
    /// A slice was serviced, call again
    Success,
    /// The byte budget is exhausted, retry after streams drain
    Snooze,
    /// Nothing scheduled
    Idle,
}

/// Takeover progress for one vbucket, kept answerable even after a
/// cursor-dropped stream is waiting for its reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeoverStats {
    pub status: &'static str,
    pub estimate: u64,
    pub last_sent_seqno: Seqno,
}

struct NoopCtx {
    enabled: AtomicBool,
    interval: AtomicU64,
    send_time: Mutex<Instant>,
    pending_recv: AtomicBool,
}

struct ProducerInner {
    streams: HashMap<Vbid, ActiveStream>,
    ready: VecDeque<Vbid>,
    /// Single-slot stash for an event refused by the flow-control
    /// window; re-offered before any stream is polled
    reject: Option<DcpEvent>,
    pending_controls: VecDeque<DcpEvent>,
    /// last-sent seqno of streams evicted by cursor dropping, until the
    /// consumer reconnects them
    temp_dropped: HashMap<Vbid, Seqno>,
}

impl ProducerInner {
    fn push_ready(&mut self, vbucket: Vbid) {
        if !self.ready.contains(&vbucket) {
            self.ready.push_back(vbucket);
        }
    }
}

/// Producer endpoint: multiplexes active streams over one connection,
/// owns the outbound flow-control window, answers negotiation and keeps
/// the peer alive with noops.
pub struct DcpProducer<S> {
    name: String,
    store: Arc<S>,
    log: BufferLog,
    backfills: BackfillManager,
    noop: NoopCtx,
    priority: Mutex<ConnPriority>,
    enable_ext_metadata: AtomicBool,
    enable_value_compression: AtomicBool,
    supports_cursor_dropping: AtomicBool,
    opaque_counter: AtomicU32,
    disconnect: AtomicBool,
    paused: AtomicBool,
    items_sent: AtomicU64,
    total_bytes_sent: AtomicU64,
    inner: Mutex<ProducerInner>,
    ready_notify: Notify,
}

impl<S: StreamSource> DcpProducer<S> {
    pub fn new(name: &str, store: Arc<S>, config: &ConnectionConfig) -> DcpProducer<S> {
        DcpProducer {
            name: name.to_string(),
            store,
            // Unbounded until the consumer advertises a window.
            log: BufferLog::new(0),
            backfills: BackfillManager::new(config),
            noop: NoopCtx {
                enabled: AtomicBool::new(false),
                interval: AtomicU64::new(config.noop_interval),
                send_time: Mutex::new(Instant::now()),
                pending_recv: AtomicBool::new(false),
            },
            priority: Mutex::new(ConnPriority::Medium),
            enable_ext_metadata: AtomicBool::new(false),
            enable_value_compression: AtomicBool::new(false),
            supports_cursor_dropping: AtomicBool::new(false),
            opaque_counter: AtomicU32::new(0),
            disconnect: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            items_sent: AtomicU64::new(0),
            total_bytes_sent: AtomicU64::new(0),
            inner: Mutex::new(ProducerInner {
                streams: HashMap::new(),
                ready: VecDeque::new(),
                reject: None,
                pending_controls: VecDeque::new(),
                temp_dropped: HashMap::new(),
            }),
            ready_notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer_log(&self) -> &BufferLog {
        &self.log
    }

    pub fn backfills(&self) -> &BackfillManager {
        &self.backfills
    }

    pub fn priority(&self) -> ConnPriority {
        *self.priority.lock().unwrap()
    }

    pub fn is_ext_metadata_enabled(&self) -> bool {
        self.enable_ext_metadata.load(Ordering::Relaxed)
    }

    pub fn is_value_compression_enabled(&self) -> bool {
        self.enable_value_compression.load(Ordering::Relaxed)
    }

    pub fn items_sent(&self) -> u64 {
        self.items_sent.load(Ordering::Relaxed)
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn disconnected(&self) -> bool {
        self.disconnect.load(Ordering::Relaxed)
    }

    /// Resolves when the stepper may have work again
    pub async fn wait_ready(&self) {
        self.ready_notify.notified().await
    }

    fn next_opaque(&self) -> Opaque {
        self.opaque_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Route one inbound event. A returned event is the immediate reply
    /// the transport must write.
    pub fn dispatch(&self, event: DcpEvent) -> DcpResult<Option<DcpEvent>> {
        if self.disconnected() {
            return Err(DcpError::Disconnect);
        }

        match event {
            DcpEvent::StreamReq(request) => self.stream_request(request).map(Some),
            DcpEvent::BufferAck { bytes, .. } => {
                self.buffer_ack(bytes as u64);
                Ok(None)
            }
            DcpEvent::Control { opaque, key, value } => {
                self.control(opaque, &key, &value).map(|_| None)
            }
            DcpEvent::NoopRsp { .. } => {
                self.noop.pending_recv.store(false, Ordering::Relaxed);
                Ok(None)
            }
            DcpEvent::SetVbStateRsp { opaque, .. } => {
                self.vbucket_state_ack(opaque);
                Ok(None)
            }
            DcpEvent::SnapshotMarkerRsp { opaque, .. } => {
                self.snapshot_marker_ack(opaque);
                Ok(None)
            }
            other => {
                warn!("Producer received unexpected event {:?}", other.opcode());
                Err(DcpError::Invalid)
            }
        }
    }

    /// Admit a stream request and build the response to write
    pub fn stream_request(&self, request: StreamReq) -> DcpResult<DcpEvent> {
        if self.disconnected() {
            return Err(DcpError::Disconnect);
        }

        let vbucket = request.vbucket;
        if !(request.snap_start <= request.start_seqno
            && request.start_seqno <= request.snap_end)
        {
            warn!(
                "(vb {}) Stream request claims start seqno {} outside its snapshot [{}, {}]",
                vbucket, request.start_seqno, request.snap_start, request.snap_end
            );
            return Err(DcpError::Invalid);
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.streams.get(&vbucket) {
            if existing.is_active() {
                warn!("(vb {}) Cannot open stream because one already exists", vbucket);
                return Err(DcpError::KeyExists);
            }
        }

        let table = self.store.failover_table(vbucket)?;
        let high_seqno = self.store.high_seqno(vbucket)?;

        if let Some(rollback_seqno) = table.find_rollback_seqno(
            request.vb_uuid,
            request.start_seqno,
            request.snap_start,
            request.snap_end,
        ) {
            info!(
                "(vb {}) Stream request requires rollback to seqno {}",
                vbucket, rollback_seqno
            );
            return Ok(DcpEvent::StreamReqRsp {
                opaque: request.opaque,
                body: StreamReqBody::Rollback(rollback_seqno),
            });
        }

        if request.start_seqno > high_seqno {
            // The client claims a seqno this vbucket never issued.
            info!(
                "(vb {}) Stream request for start seqno {} ahead of high seqno {}, \
                 rolling the client back to zero",
                vbucket, request.start_seqno, high_seqno
            );
            return Ok(DcpEvent::StreamReqRsp {
                opaque: request.opaque,
                body: StreamReqBody::Rollback(0),
            });
        }

        let mut stream = ActiveStream::new(&self.name, &request);
        let ready = stream.activate(&*self.store, &self.backfills);
        inner.streams.insert(vbucket, stream);
        inner.temp_dropped.remove(&vbucket);
        if ready {
            inner.push_ready(vbucket);
            drop(inner);
            self.ready_notify.notify_one();
        }

        Ok(DcpEvent::StreamReqRsp {
            opaque: request.opaque,
            body: StreamReqBody::Accepted(table.to_pairs()),
        })
    }

    /// Apply a control negotiation and queue its acknowledgement
    pub fn control(&self, opaque: Opaque, key: &str, value: &str) -> DcpResult<()> {
        match key {
            control_keys::ENABLE_NOOP => {
                self.noop.enabled.store(parse_bool(value)?, Ordering::Relaxed);
                *self.noop.send_time.lock().unwrap() = Instant::now();
            }
            control_keys::SET_NOOP_INTERVAL => {
                let interval = value.parse().map_err(|_| DcpError::Invalid)?;
                self.noop.interval.store(interval, Ordering::Relaxed);
            }
            control_keys::CONNECTION_BUFFER_SIZE => {
                let window = value.parse().map_err(|_| DcpError::Invalid)?;
                self.log.set_buffer_size(window);
            }
            control_keys::SET_PRIORITY => {
                let priority = ConnPriority::parse(value).ok_or(DcpError::Invalid)?;
                *self.priority.lock().unwrap() = priority;
            }
            control_keys::ENABLE_EXT_METADATA => {
                self.enable_ext_metadata
                    .store(parse_bool(value)?, Ordering::Relaxed);
            }
            control_keys::ENABLE_VALUE_COMPRESSION => {
                self.enable_value_compression
                    .store(parse_bool(value)?, Ordering::Relaxed);
            }
            control_keys::SUPPORTS_CURSOR_DROPPING => {
                self.supports_cursor_dropping
                    .store(parse_bool(value)?, Ordering::Relaxed);
            }
            _ => {
                warn!("Unknown control key \"{}\"", key);
                return Err(DcpError::Invalid);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        inner.pending_controls.push_back(DcpEvent::ControlRsp {
            opaque,
            status: Status::Ok,
        });
        drop(inner);
        self.ready_notify.notify_one();
        Ok(())
    }

    /// The peer credited bytes back into the window
    pub fn buffer_ack(&self, bytes: u64) {
        self.log.free(bytes);
        if self.is_paused() && !self.log.is_full() {
            self.ready_notify.notify_one();
        }
    }

    /// Drive one unit of output. `Ok(Some(event))` means the event must
    /// be written and `step` called again; `Ok(None)` means the
    /// producer paused until new work or credit arrives.
    pub fn step(&self) -> DcpResult<Option<DcpEvent>> {
        if self.disconnected() {
            return Err(DcpError::Disconnect);
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(event) = inner.reject.take() {
            if self.log.insert(event.wire_len() as u64) {
                return Ok(Some(self.note_sent(event)));
            }
            inner.reject = Some(event);
            self.paused.store(true, Ordering::Relaxed);
            return Ok(None);
        }

        if let Some(event) = inner.pending_controls.pop_front() {
            self.paused.store(false, Ordering::Relaxed);
            return Ok(Some(event));
        }

        match self.maybe_send_noop() {
            Ok(Some(event)) => {
                self.paused.store(false, Ordering::Relaxed);
                return Ok(Some(event));
            }
            Ok(None) => {}
            Err(error) => {
                drop(inner);
                self.set_disconnect();
                return Err(error);
            }
        }

        if self.log.is_full() {
            self.paused.store(true, Ordering::Relaxed);
            return Ok(None);
        }

        while let Some(vbucket) = inner.ready.pop_front() {
            let stream = match inner.streams.get_mut(&vbucket) {
                Some(stream) => stream,
                None => continue,
            };

            let mut event = match stream.next(&*self.store, &self.backfills) {
                Some(event) => event,
                None => continue,
            };

            if !self.is_ext_metadata_enabled() {
                strip_ext_meta(&mut event);
            }

            inner.ready.push_back(vbucket);

            if self.log.insert(event.wire_len() as u64) {
                return Ok(Some(self.note_sent(event)));
            }

            inner.reject = Some(event);
            self.paused.store(true, Ordering::Relaxed);
            return Ok(None);
        }

        self.paused.store(true, Ordering::Relaxed);
        Ok(None)
    }

    fn note_sent(&self, event: DcpEvent) -> DcpEvent {
        self.paused.store(false, Ordering::Relaxed);
        if event.is_data() {
            self.items_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.total_bytes_sent
            .fetch_add(event.wire_len() as u64, Ordering::Relaxed);
        event
    }

    fn maybe_send_noop(&self) -> DcpResult<Option<DcpEvent>> {
        if !self.noop.enabled.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let interval = self.noop.interval.load(Ordering::Relaxed);
        let elapsed = self.noop.send_time.lock().unwrap().elapsed().as_secs();

        if self.noop.pending_recv.load(Ordering::Relaxed) {
            if elapsed >= interval.saturating_mul(2) {
                warn!(
                    "Disconnecting because the noop sent {} seconds ago was never answered",
                    elapsed
                );
                return Err(DcpError::Disconnect);
            }
            return Ok(None);
        }

        if elapsed >= interval {
            *self.noop.send_time.lock().unwrap() = Instant::now();
            self.noop.pending_recv.store(true, Ordering::Relaxed);
            return Ok(Some(DcpEvent::Noop {
                opaque: self.next_opaque(),
            }));
        }

        Ok(None)
    }

    /// New seqnos were persisted for a vbucket: wake its stream
    pub fn notify_seqno_available(&self, vbucket: Vbid, seqno: Seqno) {
        let mut inner = self.inner.lock().unwrap();
        let woke = inner
            .streams
            .get_mut(&vbucket)
            .map_or(false, ActiveStream::notify_seqno_available);
        if woke {
            inner.push_ready(vbucket);
            drop(inner);
            debug!("(vb {}) Stream woken for seqno {}", vbucket, seqno);
            self.ready_notify.notify_one();
        }
    }

    /// Close a stream on behalf of the peer
    pub fn close_stream(&self, vbucket: Vbid) -> DcpResult<()> {
        self.end_stream(vbucket, EndStreamReason::Closed).map(|_| ())
    }

    /// The vbucket left this node (promotion, deletion)
    pub fn vbucket_state_changed(&self, vbucket: Vbid) {
        self.end_stream(vbucket, EndStreamReason::StateChanged)
            .ok();
    }

    /// Evict a stream whose checkpoint cursor was dropped under memory
    /// pressure. The consumer is expected to reconnect.
    pub fn close_slow_stream(&self, vbucket: Vbid) -> bool {
        if !self.supports_cursor_dropping.load(Ordering::Relaxed) {
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        let stream = match inner.streams.get_mut(&vbucket) {
            Some(stream) if stream.is_active() => stream,
            _ => return false,
        };

        let last_sent = stream.last_sent_seqno();
        let woke = stream.set_dead(EndStreamReason::Slow, &*self.store, &self.backfills);
        inner.temp_dropped.insert(vbucket, last_sent);
        info!(
            "(vb {}) Stream evicted by cursor dropping at seqno {}",
            vbucket, last_sent
        );

        inner.push_ready(vbucket);
        drop(inner);
        if woke {
            self.ready_notify.notify_one();
        }
        true
    }

    fn end_stream(&self, vbucket: Vbid, reason: EndStreamReason) -> DcpResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let stream = match inner.streams.get_mut(&vbucket) {
            Some(stream) if stream.is_active() => stream,
            _ => return Err(DcpError::KeyEnoent),
        };

        let woke = stream.set_dead(reason, &*self.store, &self.backfills);
        inner.push_ready(vbucket);
        drop(inner);
        if woke {
            self.ready_notify.notify_one();
        }
        Ok(woke)
    }

    fn vbucket_state_ack(&self, opaque: Opaque) {
        let mut inner = self.inner.lock().unwrap();
        let acked = inner
            .streams
            .values_mut()
            .find(|stream| stream.opaque() == opaque)
            .map(|stream| (stream.vbucket(), stream.vbucket_state_ack(&*self.store)));

        match acked {
            Some((vbucket, woke)) => {
                inner.push_ready(vbucket);
                drop(inner);
                if woke {
                    self.ready_notify.notify_one();
                }
            }
            None => warn!("Set-vbucket-state ack for unknown opaque {}", opaque),
        }
    }

    fn snapshot_marker_ack(&self, opaque: Opaque) {
        let mut inner = self.inner.lock().unwrap();
        let woke = inner
            .streams
            .values_mut()
            .find(|stream| stream.opaque() == opaque)
            .map(|stream| (stream.vbucket(), stream.snapshot_marker_ack()));

        if let Some((vbucket, woke)) = woke {
            if woke {
                inner.push_ready(vbucket);
                drop(inner);
                self.ready_notify.notify_one();
            }
        }
    }

    /// Takeover progress, surviving cursor-drop eviction until the
    /// consumer reconnects
    pub fn takeover_stats(&self, vbucket: Vbid) -> Option<TakeoverStats> {
        let inner = self.inner.lock().unwrap();
        let high_seqno = self.store.high_seqno(vbucket).unwrap_or(0);

        if let Some(stream) = inner.streams.get(&vbucket) {
            if stream.is_active() {
                let status = match stream.state() {
                    ActiveState::Backfilling => "backfilling",
                    _ => "in-memory",
                };
                return Some(TakeoverStats {
                    status,
                    estimate: high_seqno.saturating_sub(stream.last_sent_seqno()),
                    last_sent_seqno: stream.last_sent_seqno(),
                });
            }
        }

        inner
            .temp_dropped
            .get(&vbucket)
            .map(|last_sent| TakeoverStats {
                status: "temporarily-disconnected",
                estimate: high_seqno.saturating_sub(*last_sent),
                last_sent_seqno: *last_sent,
            })
    }

    /// Idempotent teardown: every stream dies with reason
    /// `disconnected` and no further work is produced.
    pub fn set_disconnect(&self) {
        if self.disconnect.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Producer {} disconnecting, closing all streams", self.name);

        let mut inner = self.inner.lock().unwrap();
        for stream in inner.streams.values_mut() {
            stream.set_dead(
                EndStreamReason::Disconnected,
                &*self.store,
                &self.backfills,
            );
        }
        inner.ready.clear();
        inner.reject = None;
        inner.pending_controls.clear();
        drop(inner);

        self.ready_notify.notify_one();
    }

    /// Service one slice of the next scheduled backfill scan. Runs on
    /// the disk-reader task.
    pub fn run_backfill(&self) -> DcpResult<BackfillStatus> {
        if self.disconnected() {
            return Err(DcpError::Disconnect);
        }

        let mut scan = match self.backfills.next_scan() {
            Some(scan) => scan,
            None => return Ok(BackfillStatus::Idle),
        };

        if scan.items.is_none() {
            match self.store.scan(scan.vbucket, scan.start, scan.end) {
                Ok(items) => scan.items = Some(items.into()),
                Err(_) => {
                    self.backfills.complete_scan();
                    self.end_stream(scan.vbucket, EndStreamReason::StateChanged)
                        .ok();
                    return Ok(BackfillStatus::Success);
                }
            }
        }

        let mut inner = self.inner.lock().unwrap();
        let stream = match inner.streams.get_mut(&scan.vbucket) {
            Some(stream) if stream.state() == ActiveState::Backfilling => stream,
            _ => {
                drop(inner);
                self.backfills.complete_scan();
                return Ok(BackfillStatus::Success);
            }
        };

        let mut items = scan.items.take().unwrap_or_default();
        let mut woke = false;

        if !scan.snapshot_marked {
            match items.back().map(|item| item.by_seqno) {
                Some(snapshot_end) => {
                    woke |= stream.mark_disk_snapshot(scan.start, snapshot_end, &*self.store);
                    scan.snapshot_marked = true;
                }
                None => {
                    // The range turned out empty on disk.
                    woke |= stream.complete_backfill();
                    let vbucket = scan.vbucket;
                    if woke {
                        inner.push_ready(vbucket);
                    }
                    drop(inner);
                    self.backfills.complete_scan();
                    if woke {
                        self.ready_notify.notify_one();
                    }
                    return Ok(BackfillStatus::Success);
                }
            }
        }

        let status = loop {
            let item = match items.pop_front() {
                Some(item) => item,
                None => {
                    woke |= stream.complete_backfill();
                    break BackfillStatus::Success;
                }
            };

            match stream.backfill_received(item, &self.backfills) {
                BackfillFeed::Accepted(ready) => woke |= ready,
                BackfillFeed::BudgetFull(item) => {
                    items.push_front(item);
                    break BackfillStatus::Snooze;
                }
                BackfillFeed::Dropped => break BackfillStatus::Success,
            }
        };

        let vbucket = scan.vbucket;
        if woke {
            inner.push_ready(vbucket);
        }
        drop(inner);

        match status {
            BackfillStatus::Snooze => {
                scan.items = Some(items);
                self.backfills.requeue(scan);
            }
            _ => self.backfills.complete_scan(),
        }

        if woke {
            self.ready_notify.notify_one();
        }
        Ok(status)
    }
}

/// Extended metadata only goes out once the peer negotiated for it
fn strip_ext_meta(event: &mut DcpEvent) {
    if let DcpEvent::Mutation { item, .. }
    | DcpEvent::Deletion { item, .. }
    | DcpEvent::Expiration { item, .. } = event
    {
        item.ext_meta = None;
    }
}

fn parse_bool(value: &str) -> DcpResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DcpError::Invalid),
    }
}
