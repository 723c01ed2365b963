use std::collections::VecDeque;

use riptide_lib::core::{
    item::Item,
    store::StreamSource,
    types::{Opaque, Seqno, VbState, Vbid, VbUuid, MAX_SEQNO},
};

use crate::{
    node::producer::backfill::BackfillManager,
    proto::event::{
        marker_flags, stream_flags, DcpEvent, EndStreamReason, SnapshotMarker, StreamReq,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    Pending,
    Backfilling,
    InMemory,
    TakeoverSend,
    TakeoverWait,
    Dead,
}

impl ActiveState {
    fn name(self) -> &'static str {
        match self {
            ActiveState::Pending => "pending",
            ActiveState::Backfilling => "backfilling",
            ActiveState::InMemory => "in-memory",
            ActiveState::TakeoverSend => "takeover-send",
            ActiveState::TakeoverWait => "takeover-wait",
            ActiveState::Dead => "dead",
        }
    }
}

/// What happened to an item offered to the stream by a backfill scan
#[derive(Debug, PartialEq, Eq)]
pub enum BackfillFeed {
    /// Item queued; true when the stream just became ready
    Accepted(bool),
    /// The scan byte budget is exhausted, retry the item later
    BudgetFull(Item),
    /// The stream no longer wants the scan
    Dropped,
}

/// Producer-side state machine for one vbucket stream.
///
/// The owning connection drives it and forwards its readiness to the
/// round-robin list; the stream itself never reaches back.
pub struct ActiveStream {
    name: String,
    flags: u32,
    opaque: Opaque,
    vbucket: Vbid,
    start_seqno: Seqno,
    end_seqno: Seqno,
    vb_uuid: VbUuid,
    snap_start: Seqno,
    snap_end: Seqno,

    state: ActiveState,
    ready_q: VecDeque<DcpEvent>,
    ready_q_bytes: u64,
    items_ready: bool,

    last_read_seqno: Seqno,
    last_sent_seqno: Seqno,
    cur_chk_seqno: Seqno,

    first_marker_sent: bool,
    wait_for_snapshot: u32,
    backfill_task_running: bool,
    buffered_backfill_bytes: u64,

    backfill_items_sent: u64,
    memory_items_sent: u64,
}

impl ActiveStream {
    pub fn new(name: &str, request: &StreamReq) -> ActiveStream {
        let mut end_seqno = request.end_seqno;
        let takeover = request.flags & stream_flags::TAKEOVER != 0;
        if takeover {
            end_seqno = MAX_SEQNO;
        }

        let mut stream = ActiveStream {
            name: name.to_string(),
            flags: request.flags,
            opaque: request.opaque,
            vbucket: request.vbucket,
            start_seqno: request.start_seqno,
            end_seqno,
            vb_uuid: request.vb_uuid,
            snap_start: request.snap_start,
            snap_end: request.snap_end,
            state: ActiveState::Pending,
            ready_q: VecDeque::new(),
            ready_q_bytes: 0,
            items_ready: false,
            last_read_seqno: request.start_seqno,
            last_sent_seqno: request.start_seqno,
            cur_chk_seqno: request.start_seqno,
            first_marker_sent: false,
            wait_for_snapshot: 0,
            backfill_task_running: false,
            buffered_backfill_bytes: 0,
            backfill_items_sent: 0,
            memory_items_sent: 0,
        };

        info!(
            "(vb {}) {}stream created with start seqno {} and end seqno {}",
            stream.vbucket,
            if takeover { "takeover " } else { "" },
            stream.start_seqno,
            stream.end_seqno
        );

        if stream.start_seqno >= stream.end_seqno {
            stream.end_stream(EndStreamReason::Ok);
            stream.items_ready = true;
        }

        stream
    }

    pub fn state(&self) -> ActiveState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != ActiveState::Dead
    }

    pub fn vbucket(&self) -> Vbid {
        self.vbucket
    }

    pub fn opaque(&self) -> Opaque {
        self.opaque
    }

    pub fn vb_uuid(&self) -> VbUuid {
        self.vb_uuid
    }

    pub fn start_seqno(&self) -> Seqno {
        self.start_seqno
    }

    /// Snapshot the peer claimed to sit in when it asked for the stream
    pub fn requested_snapshot(&self) -> (Seqno, Seqno) {
        (self.snap_start, self.snap_end)
    }

    pub fn last_sent_seqno(&self) -> Seqno {
        self.last_sent_seqno
    }

    pub fn items_ready(&self) -> bool {
        self.items_ready
    }

    pub fn has_queued_items(&self) -> bool {
        !self.ready_q.is_empty()
    }

    pub fn ready_queue_bytes(&self) -> u64 {
        self.ready_q_bytes
    }

    fn is_takeover(&self) -> bool {
        self.flags & stream_flags::TAKEOVER != 0
    }

    fn is_diskonly(&self) -> bool {
        self.flags & stream_flags::DISKONLY != 0
    }

    /// Bring a freshly admitted stream out of `Pending`. Returns true
    /// when the stream has something to emit.
    pub fn activate<S: StreamSource>(
        &mut self,
        store: &S,
        backfills: &BackfillManager,
    ) -> bool {
        if self.state != ActiveState::Pending {
            return self.items_ready;
        }

        let registration = match store.register_cursor(self.vbucket, &self.name, self.last_read_seqno)
        {
            Ok(registration) => registration,
            Err(_) => {
                self.shutdown(EndStreamReason::StateChanged, store);
                return self.wake();
            }
        };

        self.cur_chk_seqno = registration.cursor_seqno;
        let backfill_start = self.last_read_seqno + 1;

        // Everything below the in-memory cursor has to come off disk;
        // the scan always covers its end seqno.
        let backfill_end = if self.is_diskonly() {
            self.end_seqno
        } else if backfill_start < self.cur_chk_seqno {
            self.cur_chk_seqno.min(self.end_seqno)
        } else {
            0
        };

        let try_backfill = registration.first_snapshot || self.is_diskonly();

        // Every stream leaves `Pending` through the backfill phase,
        // even when there is nothing to read off disk.
        self.transition(ActiveState::Backfilling);

        if backfill_start <= backfill_end && try_backfill {
            self.backfill_task_running = true;
            backfills.schedule(self.vbucket, backfill_start, backfill_end);
            self.items_ready
        } else {
            // The first poll finds a dry queue and cascades the stream
            // onward.
            self.wake()
        }
    }

    /// Produce the next wire event, if any. Clears the readiness flag
    /// when the stream runs dry.
    pub fn next<S: StreamSource>(
        &mut self,
        store: &S,
        backfills: &BackfillManager,
    ) -> Option<DcpEvent> {
        let entered = self.state;
        let response = match self.state {
            ActiveState::Pending => None,
            ActiveState::Backfilling => self.backfill_phase(store, backfills),
            ActiveState::InMemory => self.in_memory_phase(store),
            ActiveState::TakeoverSend => self.takeover_send_phase(store),
            ActiveState::TakeoverWait | ActiveState::Dead => self.next_queued(),
        };

        // A phase that advanced the state without yielding anything
        // hands straight over to the next phase.
        if response.is_none() && self.state != entered && self.state != ActiveState::Dead {
            return self.next(store, backfills);
        }

        self.items_ready = response.is_some();
        response
    }

    fn backfill_phase<S: StreamSource>(
        &mut self,
        store: &S,
        backfills: &BackfillManager,
    ) -> Option<DcpEvent> {
        let mut response = self.next_queued();

        if let Some(event) = response.as_ref() {
            if event.is_data() {
                let size = event_item(event).map_or(0, Item::size) as u64;
                backfills.bytes_sent(size);
                self.buffered_backfill_bytes = self.buffered_backfill_bytes.saturating_sub(size);
            }
        }

        if !self.backfill_task_running && self.ready_q.is_empty() {
            if self.last_read_seqno >= self.end_seqno {
                self.shutdown(EndStreamReason::Ok, store);
            } else if self.is_takeover() {
                // Takeover wins over a disk-only request.
                self.transition(ActiveState::TakeoverSend);
            } else if self.is_diskonly() {
                self.shutdown(EndStreamReason::Ok, store);
            } else {
                self.transition(ActiveState::InMemory);
            }

            if response.is_none() {
                response = self.next_queued();
            }
        }

        response
    }

    fn in_memory_phase<S: StreamSource>(&mut self, store: &S) -> Option<DcpEvent> {
        if self.ready_q.is_empty() {
            if self.last_sent_seqno >= self.end_seqno {
                self.shutdown(EndStreamReason::Ok, store);
            } else {
                self.next_checkpoint_batch(store);
            }
        }

        self.next_queued()
    }

    fn takeover_send_phase<S: StreamSource>(&mut self, store: &S) -> Option<DcpEvent> {
        if self.ready_q.is_empty() {
            self.next_checkpoint_batch(store);
        }

        if let Some(event) = self.next_queued() {
            return Some(event);
        }

        if self.wait_for_snapshot != 0 {
            return None;
        }

        // Everything is drained and acknowledged: hand the vbucket
        // over and retire it locally.
        store.set_vbucket_state(self.vbucket, VbState::Dead).ok();
        let event = DcpEvent::SetVbState {
            vbucket: self.vbucket,
            opaque: self.opaque,
            state: VbState::Dead,
        };
        self.transition(ActiveState::TakeoverWait);
        Some(event)
    }

    fn next_queued(&mut self) -> Option<DcpEvent> {
        let event = self.ready_q.pop_front()?;
        self.ready_q_bytes = self.ready_q_bytes.saturating_sub(event.wire_len() as u64);

        if let Some(seqno) = event.by_seqno() {
            self.last_sent_seqno = seqno;
            if self.state == ActiveState::Backfilling {
                self.backfill_items_sent += 1;
            } else {
                self.memory_items_sent += 1;
            }
        }

        Some(event)
    }

    fn push_to_ready_q(&mut self, event: DcpEvent) {
        self.ready_q_bytes += event.wire_len() as u64;
        self.ready_q.push_back(event);
    }

    /// Pull the next in-memory snapshot from the checkpoint cursor and
    /// frame it with a marker.
    fn next_checkpoint_batch<S: StreamSource>(&mut self, store: &S) {
        let batch = match store.next_snapshot(self.vbucket, &self.name) {
            Ok(Some(batch)) => batch,
            Ok(None) => return,
            Err(_) => {
                self.shutdown(EndStreamReason::StateChanged, store);
                return;
            }
        };

        let items: Vec<Item> = batch
            .items
            .into_iter()
            .filter(|item| item.by_seqno <= self.end_seqno)
            .collect();

        if items.is_empty() {
            // Every remaining seqno lies past the requested end.
            self.shutdown(EndStreamReason::Ok, store);
            return;
        }

        let mut flags = marker_flags::MEMORY;
        if batch.checkpoint {
            flags |= marker_flags::CHK;
        }
        if self.state == ActiveState::TakeoverSend {
            flags |= marker_flags::ACK;
            self.wait_for_snapshot += 1;
        }

        let mut snap_start = items[0].by_seqno;
        let snap_end = items[items.len() - 1].by_seqno;
        if !self.first_marker_sent {
            snap_start = snap_start.min(self.snap_start);
            self.first_marker_sent = true;
        }

        self.cur_chk_seqno = snap_end;
        self.last_read_seqno = snap_end;

        self.push_to_ready_q(DcpEvent::SnapshotMarker(SnapshotMarker {
            vbucket: self.vbucket,
            opaque: self.opaque,
            start: snap_start,
            end: snap_end,
            flags,
        }));

        for item in items {
            self.push_to_ready_q(mutation_event(self.opaque, item));
        }
    }

    /// A backfill scan is about to deliver `[start, end]` off disk
    pub fn mark_disk_snapshot<S: StreamSource>(
        &mut self,
        start: Seqno,
        end: Seqno,
        store: &S,
    ) -> bool {
        if self.state != ActiveState::Backfilling {
            return false;
        }

        let start = start.min(self.snap_start);
        self.first_marker_sent = true;

        info!(
            "(vb {}) Sending disk snapshot with start seqno {} and end seqno {}",
            self.vbucket, start, end
        );

        self.push_to_ready_q(DcpEvent::SnapshotMarker(SnapshotMarker {
            vbucket: self.vbucket,
            opaque: self.opaque,
            start,
            end,
            flags: marker_flags::DISK,
        }));

        // Plant the memory cursor where the disk snapshot will end, so
        // the in-memory phase picks up seamlessly.
        let resume = end.min(self.end_seqno);
        match store.register_cursor(self.vbucket, &self.name, resume) {
            Ok(registration) => self.cur_chk_seqno = registration.cursor_seqno,
            Err(_) => self.shutdown(EndStreamReason::StateChanged, store),
        }

        self.wake()
    }

    /// Offer one scanned item to the stream
    pub fn backfill_received(&mut self, item: Item, backfills: &BackfillManager) -> BackfillFeed {
        if self.state != ActiveState::Backfilling {
            return BackfillFeed::Dropped;
        }

        let size = item.size() as u64;
        if !backfills.bytes_read(size) {
            return BackfillFeed::BudgetFull(item);
        }

        self.buffered_backfill_bytes += size;
        self.last_read_seqno = item.by_seqno;
        self.push_to_ready_q(mutation_event(self.opaque, item));

        BackfillFeed::Accepted(self.wake())
    }

    pub fn complete_backfill(&mut self) -> bool {
        if self.state != ActiveState::Backfilling {
            return false;
        }

        self.backfill_task_running = false;
        info!(
            "(vb {}) Backfill complete, last seqno read: {}",
            self.vbucket, self.last_read_seqno
        );
        self.wake()
    }

    /// The peer acknowledged applying a marked snapshot
    pub fn snapshot_marker_ack(&mut self) -> bool {
        self.wait_for_snapshot = self.wait_for_snapshot.saturating_sub(1);
        if self.wait_for_snapshot == 0 {
            self.wake()
        } else {
            false
        }
    }

    /// The peer acknowledged the vbucket state flip that ends a takeover
    pub fn vbucket_state_ack<S: StreamSource>(&mut self, store: &S) -> bool {
        if self.state == ActiveState::TakeoverWait {
            self.shutdown(EndStreamReason::Ok, store);
            self.wake()
        } else {
            warn!(
                "(vb {}) Unexpected ack for set vbucket state in state '{}'",
                self.vbucket,
                self.state.name()
            );
            false
        }
    }

    /// New seqnos exist for this vbucket; re-arm the stream
    pub fn notify_seqno_available(&mut self) -> bool {
        if self.state != ActiveState::Dead {
            self.wake()
        } else {
            false
        }
    }

    /// Terminate the stream. Returns true when a STREAM_END is queued
    /// and the connection should emit it.
    pub fn set_dead<S: StreamSource>(
        &mut self,
        reason: EndStreamReason,
        store: &S,
        backfills: &BackfillManager,
    ) -> bool {
        if self.state == ActiveState::Dead {
            return false;
        }

        if self.state == ActiveState::Backfilling {
            // Scanned items that never made it to the wire give their
            // budget back.
            self.ready_q.clear();
            self.ready_q_bytes = 0;
            backfills.bytes_sent(self.buffered_backfill_bytes);
            backfills.cancel(self.vbucket);
            self.buffered_backfill_bytes = 0;
        }

        self.shutdown(reason, store);

        if reason != EndStreamReason::Disconnected {
            self.wake()
        } else {
            false
        }
    }

    /// Terminate the stream and drop its checkpoint cursor
    fn shutdown<S: StreamSource>(&mut self, reason: EndStreamReason, store: &S) {
        if self.state == ActiveState::Dead {
            return;
        }
        self.end_stream(reason);
        store.remove_cursor(self.vbucket, &self.name);
    }

    fn end_stream(&mut self, reason: EndStreamReason) {
        if self.state == ActiveState::Dead {
            return;
        }

        if reason != EndStreamReason::Disconnected {
            self.push_to_ready_q(DcpEvent::StreamEnd {
                vbucket: self.vbucket,
                opaque: self.opaque,
                reason,
            });
        }

        info!(
            "(vb {}) Stream closing, {} items sent from backfill, {} from memory, \
             last seqno sent {}, reason: {:?}",
            self.vbucket, self.backfill_items_sent, self.memory_items_sent, self.last_sent_seqno,
            reason
        );

        debug!(
            "(vb {}) Transitioning from {} to dead",
            self.vbucket,
            self.state.name()
        );
        self.state = ActiveState::Dead;
    }

    fn transition(&mut self, to: ActiveState) {
        if self.state == to {
            return;
        }

        let valid = match self.state {
            ActiveState::Pending => matches!(to, ActiveState::Backfilling),
            ActiveState::Backfilling => {
                matches!(to, ActiveState::InMemory | ActiveState::TakeoverSend)
            }
            ActiveState::InMemory => matches!(to, ActiveState::TakeoverSend),
            ActiveState::TakeoverSend => matches!(to, ActiveState::TakeoverWait),
            ActiveState::TakeoverWait => matches!(to, ActiveState::TakeoverSend),
            ActiveState::Dead => false,
        };

        if !valid {
            panic!(
                "(vb {}) invalid stream transition from {} to {}",
                self.vbucket,
                self.state.name(),
                to.name()
            );
        }

        debug!(
            "(vb {}) Transitioning from {} to {}",
            self.vbucket,
            self.state.name(),
            to.name()
        );
        self.state = to;
    }

    fn wake(&mut self) -> bool {
        if self.items_ready {
            false
        } else {
            self.items_ready = true;
            true
        }
    }
}

fn mutation_event(opaque: Opaque, item: Item) -> DcpEvent {
    if item.is_deleted() {
        DcpEvent::Deletion { opaque, item }
    } else {
        DcpEvent::Mutation { opaque, item }
    }
}

fn event_item(event: &DcpEvent) -> Option<&Item> {
    match event {
        DcpEvent::Mutation { item, .. }
        | DcpEvent::Deletion { item, .. }
        | DcpEvent::Expiration { item, .. } => Some(item),
        _ => None,
    }
}
