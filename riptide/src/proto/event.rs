use riptide_lib::core::{
    item::Item,
    types::{Opaque, Seqno, VbState, VbUuid, Vbid},
};

/// Fixed frame prefix: magic, opcode, status, vbucket, opaque, body
/// length.
pub const HEADER_BYTES: usize = 14;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Stream request flags
pub mod stream_flags {
    /// Hand the vbucket over to the peer when the stream drains
    pub const TAKEOVER: u32 = 0x01;
    /// Serve the disk snapshot only, then end the stream
    pub const DISKONLY: u32 = 0x02;
}

/// Snapshot marker flags
pub mod marker_flags {
    pub const MEMORY: u32 = 0x01;
    pub const DISK: u32 = 0x02;
    /// The snapshot opens a new checkpoint
    pub const CHK: u32 = 0x04;
    /// The peer must acknowledge applying the snapshot
    pub const ACK: u32 = 0x08;
}

/// Negotiation keys carried by CONTROL messages
pub mod control_keys {
    pub const ENABLE_NOOP: &str = "enable_noop";
    pub const SET_NOOP_INTERVAL: &str = "set_noop_interval";
    pub const CONNECTION_BUFFER_SIZE: &str = "connection_buffer_size";
    pub const SET_PRIORITY: &str = "set_priority";
    pub const ENABLE_EXT_METADATA: &str = "enable_ext_metadata";
    pub const ENABLE_VALUE_COMPRESSION: &str = "enable_value_compression";
    pub const SUPPORTS_CURSOR_DROPPING: &str = "supports_cursor_dropping";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    AddStream = 0x51,
    StreamReq = 0x53,
    StreamEnd = 0x55,
    SnapshotMarker = 0x56,
    Mutation = 0x57,
    Deletion = 0x58,
    Expiration = 0x59,
    SetVbState = 0x5b,
    Noop = 0x5c,
    BufferAck = 0x5d,
    Control = 0x5e,
}

impl Opcode {
    pub fn from_wire(byte: u8) -> Option<Opcode> {
        match byte {
            0x51 => Some(Opcode::AddStream),
            0x53 => Some(Opcode::StreamReq),
            0x55 => Some(Opcode::StreamEnd),
            0x56 => Some(Opcode::SnapshotMarker),
            0x57 => Some(Opcode::Mutation),
            0x58 => Some(Opcode::Deletion),
            0x59 => Some(Opcode::Expiration),
            0x5b => Some(Opcode::SetVbState),
            0x5c => Some(Opcode::Noop),
            0x5d => Some(Opcode::BufferAck),
            0x5e => Some(Opcode::Control),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 0x0000,
    Rollback = 0x0023,
}

impl Status {
    pub fn from_wire(raw: u16) -> Option<Status> {
        match raw {
            0x0000 => Some(Status::Ok),
            0x0023 => Some(Status::Rollback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EndStreamReason {
    /// Every requested seqno was streamed
    Ok = 0,
    /// The stream was closed by request
    Closed = 1,
    /// The vbucket changed state
    StateChanged = 2,
    /// The connection went away
    Disconnected = 3,
    /// The producer evicted the stream's cursor under memory pressure
    Slow = 4,
}

impl EndStreamReason {
    pub fn from_wire(raw: u32) -> Option<EndStreamReason> {
        match raw {
            0 => Some(EndStreamReason::Ok),
            1 => Some(EndStreamReason::Closed),
            2 => Some(EndStreamReason::StateChanged),
            3 => Some(EndStreamReason::Disconnected),
            4 => Some(EndStreamReason::Slow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReq {
    pub vbucket: Vbid,
    pub opaque: Opaque,
    pub flags: u32,
    pub start_seqno: Seqno,
    pub end_seqno: Seqno,
    pub vb_uuid: VbUuid,
    pub snap_start: Seqno,
    pub snap_end: Seqno,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub vbucket: Vbid,
    pub opaque: Opaque,
    pub start: Seqno,
    pub end: Seqno,
    pub flags: u32,
}

/// Body of a stream-request response: the failover log on accept, the
/// seqno to truncate to on rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamReqBody {
    Accepted(Vec<(VbUuid, Seqno)>),
    Rollback(Seqno),
}

/// Everything that can cross the wire, in either direction
#[derive(Debug, Clone, PartialEq)]
pub enum DcpEvent {
    StreamReq(StreamReq),
    StreamReqRsp {
        opaque: Opaque,
        body: StreamReqBody,
    },
    AddStream {
        opaque: Opaque,
        vbucket: Vbid,
        flags: u32,
    },
    AddStreamRsp {
        opaque: Opaque,
        stream_opaque: Opaque,
        status: Status,
    },
    SnapshotMarker(SnapshotMarker),
    SnapshotMarkerRsp {
        opaque: Opaque,
        status: Status,
    },
    Mutation {
        opaque: Opaque,
        item: Item,
    },
    Deletion {
        opaque: Opaque,
        item: Item,
    },
    Expiration {
        opaque: Opaque,
        item: Item,
    },
    SetVbState {
        vbucket: Vbid,
        opaque: Opaque,
        state: VbState,
    },
    SetVbStateRsp {
        opaque: Opaque,
        status: Status,
    },
    StreamEnd {
        vbucket: Vbid,
        opaque: Opaque,
        reason: EndStreamReason,
    },
    Noop {
        opaque: Opaque,
    },
    NoopRsp {
        opaque: Opaque,
    },
    BufferAck {
        opaque: Opaque,
        bytes: u32,
    },
    Control {
        opaque: Opaque,
        key: String,
        value: String,
    },
    ControlRsp {
        opaque: Opaque,
        status: Status,
    },
}

impl DcpEvent {
    pub fn opcode(&self) -> Opcode {
        match self {
            DcpEvent::StreamReq(_) | DcpEvent::StreamReqRsp { .. } => Opcode::StreamReq,
            DcpEvent::AddStream { .. } | DcpEvent::AddStreamRsp { .. } => Opcode::AddStream,
            DcpEvent::SnapshotMarker(_) | DcpEvent::SnapshotMarkerRsp { .. } => {
                Opcode::SnapshotMarker
            }
            DcpEvent::Mutation { .. } => Opcode::Mutation,
            DcpEvent::Deletion { .. } => Opcode::Deletion,
            DcpEvent::Expiration { .. } => Opcode::Expiration,
            DcpEvent::SetVbState { .. } | DcpEvent::SetVbStateRsp { .. } => Opcode::SetVbState,
            DcpEvent::StreamEnd { .. } => Opcode::StreamEnd,
            DcpEvent::Noop { .. } | DcpEvent::NoopRsp { .. } => Opcode::Noop,
            DcpEvent::BufferAck { .. } => Opcode::BufferAck,
            DcpEvent::Control { .. } | DcpEvent::ControlRsp { .. } => Opcode::Control,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            DcpEvent::StreamReqRsp { .. }
                | DcpEvent::AddStreamRsp { .. }
                | DcpEvent::SnapshotMarkerRsp { .. }
                | DcpEvent::SetVbStateRsp { .. }
                | DcpEvent::NoopRsp { .. }
                | DcpEvent::ControlRsp { .. }
        )
    }

    pub fn opaque(&self) -> Opaque {
        match self {
            DcpEvent::StreamReq(req) => req.opaque,
            DcpEvent::StreamReqRsp { opaque, .. }
            | DcpEvent::AddStream { opaque, .. }
            | DcpEvent::AddStreamRsp { opaque, .. }
            | DcpEvent::SnapshotMarkerRsp { opaque, .. }
            | DcpEvent::Mutation { opaque, .. }
            | DcpEvent::Deletion { opaque, .. }
            | DcpEvent::Expiration { opaque, .. }
            | DcpEvent::SetVbState { opaque, .. }
            | DcpEvent::SetVbStateRsp { opaque, .. }
            | DcpEvent::StreamEnd { opaque, .. }
            | DcpEvent::Noop { opaque }
            | DcpEvent::NoopRsp { opaque }
            | DcpEvent::BufferAck { opaque, .. }
            | DcpEvent::Control { opaque, .. }
            | DcpEvent::ControlRsp { opaque, .. } => *opaque,
            DcpEvent::SnapshotMarker(marker) => marker.opaque,
        }
    }

    pub fn vbucket(&self) -> Vbid {
        match self {
            DcpEvent::StreamReq(req) => req.vbucket,
            DcpEvent::SnapshotMarker(marker) => marker.vbucket,
            DcpEvent::AddStream { vbucket, .. }
            | DcpEvent::SetVbState { vbucket, .. }
            | DcpEvent::StreamEnd { vbucket, .. } => *vbucket,
            DcpEvent::Mutation { item, .. }
            | DcpEvent::Deletion { item, .. }
            | DcpEvent::Expiration { item, .. } => item.vbucket,
            _ => 0,
        }
    }

    /// Mutation-kind events carry a seqno and count against data budgets
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            DcpEvent::Mutation { .. } | DcpEvent::Deletion { .. } | DcpEvent::Expiration { .. }
        )
    }

    pub fn by_seqno(&self) -> Option<Seqno> {
        match self {
            DcpEvent::Mutation { item, .. }
            | DcpEvent::Deletion { item, .. }
            | DcpEvent::Expiration { item, .. } => Some(item.by_seqno),
            _ => None,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            DcpEvent::StreamReq(_) => 44,
            DcpEvent::StreamReqRsp { body, .. } => match body {
                StreamReqBody::Accepted(entries) => entries.len() * 16,
                StreamReqBody::Rollback(_) => 8,
            },
            DcpEvent::AddStream { .. } | DcpEvent::AddStreamRsp { .. } => 4,
            DcpEvent::SnapshotMarker(_) => 20,
            DcpEvent::Mutation { item, .. } => {
                37 + item.key.len()
                    + item.value.as_ref().map_or(0, |value| value.len())
                    + item.ext_meta.as_ref().map_or(0, |meta| meta.wire_len())
            }
            DcpEvent::Deletion { item, .. }
            | DcpEvent::Expiration { item, .. } => {
                28 + item.key.len() + item.ext_meta.as_ref().map_or(0, |meta| meta.wire_len())
            }
            DcpEvent::SetVbState { .. } => 1,
            DcpEvent::StreamEnd { .. } | DcpEvent::BufferAck { .. } => 4,
            DcpEvent::Control { key, value, .. } => 2 + key.len() + value.len(),
            DcpEvent::SnapshotMarkerRsp { .. }
            | DcpEvent::SetVbStateRsp { .. }
            | DcpEvent::Noop { .. }
            | DcpEvent::NoopRsp { .. }
            | DcpEvent::ControlRsp { .. } => 0,
        }
    }

    /// Total bytes this event occupies on the wire. Both flow-control
    /// windows account in these units.
    pub fn wire_len(&self) -> usize {
        HEADER_BYTES + self.body_len()
    }
}
