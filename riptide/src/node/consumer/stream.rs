use std::collections::VecDeque;

use riptide_lib::core::{
    item::Item,
    store::{MutationSink, StoreError},
    types::{Opaque, Seqno, SnapshotRange, VbUuid, Vbid, MAX_SEQNO},
};

use crate::{
    node::error::{DcpError, DcpResult},
    proto::event::{
        marker_flags, DcpEvent, EndStreamReason, SnapshotMarker, Status, StreamReq,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveState {
    Pending,
    Reading,
    Dead,
}

impl PassiveState {
    fn name(self) -> &'static str {
        match self {
            PassiveState::Pending => "pending",
            PassiveState::Reading => "reading",
            PassiveState::Dead => "dead",
        }
    }
}

/// What a wire event turned into when offered to the stream
#[derive(Debug, Default)]
pub struct IngestOutcome {
    /// The event sits in the stream buffer; wake the processor
    pub buffered: bool,
    /// Bytes applied or rejected, to credit to flow control
    pub freed: u64,
    /// A response was queued; wake the stepper
    pub woke: bool,
    /// The producer evicted us as slow; reconnect the stream
    pub reconnect: bool,
}

/// Result of one buffered-drain visit
#[derive(Debug, Default)]
pub struct Drained {
    pub freed: u64,
    pub woke: bool,
    pub reconnect: bool,
    /// An event hit a temporary failure and stays buffered
    pub failed: bool,
}

struct Processed {
    freed: u64,
    woke: bool,
    reconnect: bool,
}

enum Verdict {
    /// Event consumed; true when a response was queued
    Done(bool),
    /// A data event landed at this seqno
    Applied(Seqno),
    /// The producer evicted us; re-request the stream
    Reconnect,
    /// Retryable storage failure, keep the event buffered
    Retry(DcpError),
}

struct CurrentSnapshot {
    range: SnapshotRange,
    ack: bool,
}

/// Consumer-side state machine for one vbucket stream: requests the
/// stream, buffers inbound events under the flow-control window and
/// applies them to storage in order.
pub struct PassiveStream {
    flags: u32,
    opaque: Opaque,
    vbucket: Vbid,
    start_seqno: Seqno,
    end_seqno: Seqno,
    vb_uuid: VbUuid,
    snap_start: Seqno,
    snap_end: Seqno,

    state: PassiveState,
    ready_q: VecDeque<DcpEvent>,
    items_ready: bool,

    buffer: VecDeque<DcpEvent>,
    buffer_bytes: u64,

    last_seqno: Seqno,
    cur_snapshot: Option<CurrentSnapshot>,
}

impl PassiveStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flags: u32,
        opaque: Opaque,
        vbucket: Vbid,
        start_seqno: Seqno,
        vb_uuid: VbUuid,
        snap_start: Seqno,
        snap_end: Seqno,
        high_seqno: Seqno,
    ) -> PassiveStream {
        let mut stream = PassiveStream {
            flags,
            opaque,
            vbucket,
            start_seqno,
            end_seqno: MAX_SEQNO,
            vb_uuid,
            snap_start,
            snap_end,
            state: PassiveState::Pending,
            ready_q: VecDeque::new(),
            items_ready: false,
            buffer: VecDeque::new(),
            buffer_bytes: 0,
            last_seqno: high_seqno,
            cur_snapshot: None,
        };

        info!(
            "(vb {}) Attempting to add stream with start seqno {}, vbucket uuid {}, \
             snapshot [{}, {}] and high seqno {}",
            vbucket, start_seqno, vb_uuid, snap_start, snap_end, high_seqno
        );

        stream.push_stream_request();
        stream.items_ready = true;
        stream
    }

    pub fn state(&self) -> PassiveState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != PassiveState::Dead
    }

    pub fn opaque(&self) -> Opaque {
        self.opaque
    }

    pub fn vbucket(&self) -> Vbid {
        self.vbucket
    }

    pub fn last_seqno(&self) -> Seqno {
        self.last_seqno
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffer_bytes
    }

    pub fn has_buffered_items(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn push_stream_request(&mut self) {
        self.ready_q.push_back(DcpEvent::StreamReq(StreamReq {
            vbucket: self.vbucket,
            opaque: self.opaque,
            flags: self.flags,
            start_seqno: self.start_seqno,
            end_seqno: self.end_seqno,
            vb_uuid: self.vb_uuid,
            snap_start: self.snap_start,
            snap_end: self.snap_end,
        }));
    }

    /// The producer answered our stream request
    pub fn accept_stream(&mut self, status: Status, add_opaque: Opaque) -> bool {
        if self.state != PassiveState::Pending {
            warn!(
                "(vb {}) Stream accept in unexpected state '{}'",
                self.vbucket,
                self.state.name()
            );
            return false;
        }

        match status {
            Status::Ok => self.transition(PassiveState::Reading),
            _ => self.transition(PassiveState::Dead),
        }

        self.ready_q.push_back(DcpEvent::AddStreamRsp {
            opaque: add_opaque,
            stream_opaque: self.opaque,
            status,
        });
        self.wake()
    }

    /// Re-issue the stream request from the current storage position,
    /// after a rollback completed or the producer evicted us as slow.
    pub fn reconnect<S: MutationSink>(&mut self, store: &S) -> DcpResult<bool> {
        let entry = store.latest_failover(self.vbucket)?;
        let info = store.snapshot_info(self.vbucket)?.normalized();

        self.vb_uuid = entry.vb_uuid;
        self.start_seqno = info.start;
        self.snap_start = info.range.start;
        self.snap_end = info.range.end;
        self.last_seqno = info.start;

        info!(
            "(vb {}) Attempting to reconnect stream with opaque {}, start seqno {}, \
             snapshot [{}, {}]",
            self.vbucket, self.opaque, self.start_seqno, self.snap_start, self.snap_end
        );

        if self.state == PassiveState::Reading {
            self.transition(PassiveState::Pending);
        }
        self.push_stream_request();
        Ok(self.wake())
    }

    /// Offer one inbound wire event to the stream. Events apply
    /// immediately when the write path is idle, otherwise they queue
    /// for the processor task.
    pub fn ingest<S: MutationSink>(
        &mut self,
        event: DcpEvent,
        store: &S,
        throttled: bool,
    ) -> DcpResult<IngestOutcome> {
        if self.state == PassiveState::Dead {
            return Err(DcpError::KeyEnoent);
        }

        let wire_len = event.wire_len() as u64;

        match &event {
            DcpEvent::Mutation { item, .. }
            | DcpEvent::Deletion { item, .. }
            | DcpEvent::Expiration { item, .. } => {
                if item.by_seqno <= self.last_seqno {
                    warn!(
                        "(vb {}) Out of sequence mutation: seqno {} is not greater than \
                         last received seqno {}; dropping",
                        self.vbucket, item.by_seqno, self.last_seqno
                    );
                    return Ok(IngestOutcome {
                        freed: wire_len,
                        ..IngestOutcome::default()
                    });
                }
                self.last_seqno = item.by_seqno;
            }
            DcpEvent::SnapshotMarker(marker) => {
                if marker.start < self.last_seqno && marker.end <= self.last_seqno {
                    warn!(
                        "(vb {}) Stale snapshot marker [{}, {}] behind last received \
                         seqno {}; dropping",
                        self.vbucket, marker.start, marker.end, self.last_seqno
                    );
                    return Ok(IngestOutcome {
                        freed: wire_len,
                        ..IngestOutcome::default()
                    });
                }
            }
            _ => {}
        }

        if !throttled && self.buffer.is_empty() {
            match self.process_event(event, store) {
                Ok(processed) => {
                    return Ok(IngestOutcome {
                        buffered: false,
                        freed: processed.freed,
                        woke: processed.woke,
                        reconnect: processed.reconnect,
                    })
                }
                Err((event, _)) => {
                    self.buffer_event(event);
                    return Ok(IngestOutcome {
                        buffered: true,
                        ..IngestOutcome::default()
                    });
                }
            }
        }

        self.buffer_event(event);
        Ok(IngestOutcome {
            buffered: true,
            ..IngestOutcome::default()
        })
    }

    fn buffer_event(&mut self, event: DcpEvent) {
        self.buffer_bytes += event.wire_len() as u64;
        self.buffer.push_back(event);
    }

    /// Apply up to `batch` buffered events in order
    pub fn process_buffered<S: MutationSink>(&mut self, store: &S, batch: usize) -> Drained {
        let mut drained = Drained::default();
        let mut count = 0;

        while count < batch {
            let event = match self.buffer.pop_front() {
                Some(event) => event,
                None => break,
            };
            let wire_len = event.wire_len() as u64;

            match self.process_event(event, store) {
                Ok(processed) => {
                    self.buffer_bytes = self.buffer_bytes.saturating_sub(wire_len);
                    drained.freed += processed.freed;
                    drained.woke |= processed.woke;
                    drained.reconnect |= processed.reconnect;
                    count += 1;
                }
                Err((event, _)) => {
                    self.buffer.push_front(event);
                    drained.failed = true;
                    break;
                }
            }
        }

        drained
    }

    /// Apply one event to storage. Retryable failures hand the event
    /// back so it can stay buffered.
    fn process_event<S: MutationSink>(
        &mut self,
        event: DcpEvent,
        store: &S,
    ) -> Result<Processed, (DcpEvent, DcpError)> {
        let freed = event.wire_len() as u64;

        // First pass over a borrow of the event; the verdict decides
        // whether the owned event is consumed or handed back.
        let verdict = match &event {
            DcpEvent::Mutation { item, .. }
            | DcpEvent::Deletion { item, .. }
            | DcpEvent::Expiration { item, .. } => self.apply_item(item, store),
            DcpEvent::SnapshotMarker(marker) => {
                self.process_marker(marker, store);
                Verdict::Done(false)
            }
            DcpEvent::SetVbState { state, .. } => match store.set_vbucket_state(self.vbucket, *state) {
                Ok(()) => {
                    self.ready_q.push_back(DcpEvent::SetVbStateRsp {
                        opaque: self.opaque,
                        status: Status::Ok,
                    });
                    let woke = self.wake();
                    Verdict::Done(woke)
                }
                Err(StoreError::TmpFail) => Verdict::Retry(DcpError::TmpFail),
                Err(_) => Verdict::Done(false),
            },
            DcpEvent::StreamEnd { reason, .. } => {
                if *reason == EndStreamReason::Slow {
                    info!(
                        "(vb {}) Stream ended with reason SLOW, attempting reconnect",
                        self.vbucket
                    );
                    Verdict::Reconnect
                } else {
                    info!(
                        "(vb {}) Stream ended with reason {:?}",
                        self.vbucket, reason
                    );
                    self.transition(PassiveState::Dead);
                    Verdict::Done(false)
                }
            }
            other => {
                warn!(
                    "(vb {}) Unexpected event {:?} in passive stream; dropping",
                    self.vbucket,
                    other.opcode()
                );
                Verdict::Done(false)
            }
        };

        match verdict {
            Verdict::Done(woke) => Ok(Processed {
                freed,
                woke,
                reconnect: false,
            }),
            Verdict::Applied(by_seqno) => {
                let woke = self.handle_snapshot_end(by_seqno);
                Ok(Processed {
                    freed,
                    woke,
                    reconnect: false,
                })
            }
            Verdict::Reconnect => Ok(Processed {
                freed,
                woke: false,
                reconnect: true,
            }),
            Verdict::Retry(error) => Err((event, error)),
        }
    }

    fn apply_item<S: MutationSink>(&self, item: &Item, store: &S) -> Verdict {
        let in_snapshot = self
            .cur_snapshot
            .as_ref()
            .map_or(false, |snapshot| snapshot.range.contains(item.by_seqno));

        if !in_snapshot {
            warn!(
                "(vb {}) Mutation seqno {} does not fall in the expected snapshot \
                 range; dropping",
                self.vbucket, item.by_seqno
            );
            return Verdict::Done(false);
        }

        let applied = if item.is_deleted() {
            store.apply_deletion(item)
        } else {
            store.apply_mutation(item)
        };

        match applied {
            Ok(()) => Verdict::Applied(item.by_seqno),
            Err(StoreError::TmpFail) => Verdict::Retry(DcpError::TmpFail),
            Err(StoreError::OutOfMemory) => Verdict::Retry(DcpError::OutOfMemory),
            Err(StoreError::NotMyVbucket) => {
                warn!(
                    "(vb {}) Dropping event for a vbucket that is no longer here",
                    self.vbucket
                );
                Verdict::Done(false)
            }
        }
    }

    fn process_marker<S: MutationSink>(&mut self, marker: &SnapshotMarker, store: &S) {
        let range = SnapshotRange::new(marker.start, marker.end);
        let disk = marker.flags & marker_flags::DISK != 0;

        self.cur_snapshot = Some(CurrentSnapshot {
            range,
            ack: marker.flags & marker_flags::ACK != 0,
        });

        if store.begin_snapshot(self.vbucket, range, disk).is_err() {
            warn!(
                "(vb {}) Could not record snapshot [{}, {}]",
                self.vbucket, marker.start, marker.end
            );
        }
    }

    fn handle_snapshot_end(&mut self, by_seqno: Seqno) -> bool {
        let snapshot = match self.cur_snapshot.as_ref() {
            Some(snapshot) if snapshot.range.end == by_seqno => snapshot,
            _ => return false,
        };

        let woke = if snapshot.ack {
            self.ready_q.push_back(DcpEvent::SnapshotMarkerRsp {
                opaque: self.opaque,
                status: Status::Ok,
            });
            self.wake()
        } else {
            false
        };

        self.cur_snapshot = None;
        woke
    }

    /// Terminate the stream, returning the buffered bytes that never
    /// made it to storage so they can be credited back.
    pub fn set_dead(&mut self, reason: EndStreamReason) -> u64 {
        if self.state == PassiveState::Dead {
            return 0;
        }

        self.transition(PassiveState::Dead);
        let unacked = self.buffer_bytes;
        self.buffer.clear();
        self.buffer_bytes = 0;

        info!(
            "(vb {}) Setting stream to dead state, last seqno is {}, unacked bytes {}, \
             reason {:?}",
            self.vbucket, self.last_seqno, unacked, reason
        );
        unacked
    }

    /// Pop the next queued response for the stepper
    pub fn next(&mut self) -> Option<DcpEvent> {
        match self.ready_q.pop_front() {
            Some(event) => Some(event),
            None => {
                self.items_ready = false;
                None
            }
        }
    }

    fn transition(&mut self, to: PassiveState) {
        if self.state == to {
            return;
        }

        let valid = match self.state {
            PassiveState::Pending => matches!(to, PassiveState::Reading | PassiveState::Dead),
            PassiveState::Reading => matches!(to, PassiveState::Pending | PassiveState::Dead),
            PassiveState::Dead => false,
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
