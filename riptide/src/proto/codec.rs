use bytes::{Buf, BufMut, BytesMut};
use riptide_lib::core::item::{ExtendedMeta, Item};
use riptide_lib::core::types::VbState;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::event::{
    DcpEvent, EndStreamReason, Opcode, SnapshotMarker, Status, StreamReq, StreamReqBody,
    HEADER_BYTES, MAGIC_REQUEST, MAGIC_RESPONSE,
};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Socket error")]
    SocketError(#[from] std::io::Error),
    #[error("Unknown magic byte {0:#04x}")]
    UnknownMagic(u8),
    #[error("Unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("Unknown status {0:#06x}")]
    UnknownStatus(u16),
    #[error("Malformed {0} body")]
    MalformedBody(&'static str),
}

/// Framed big-endian codec for [`DcpEvent`]s.
///
/// Frame layout: magic (1), opcode (1), status (2), vbucket (2),
/// opaque (4), body length (4), body.
#[derive(Default)]
pub struct DcpCodec;

impl DcpCodec {
    fn status(event: &DcpEvent) -> Status {
        match event {
            DcpEvent::StreamReqRsp {
                body: StreamReqBody::Rollback(_),
                ..
            } => Status::Rollback,
            DcpEvent::AddStreamRsp { status, .. }
            | DcpEvent::SnapshotMarkerRsp { status, .. }
            | DcpEvent::SetVbStateRsp { status, .. }
            | DcpEvent::ControlRsp { status, .. } => *status,
            _ => Status::Ok,
        }
    }

    fn encode_body(event: &DcpEvent, dst: &mut BytesMut) {
        match event {
            DcpEvent::StreamReq(req) => {
                dst.put_u32(req.flags);
                dst.put_u64(req.start_seqno);
                dst.put_u64(req.end_seqno);
                dst.put_u64(req.vb_uuid);
                dst.put_u64(req.snap_start);
                dst.put_u64(req.snap_end);
            }
            DcpEvent::StreamReqRsp { body, .. } => match body {
                StreamReqBody::Accepted(entries) => {
                    for (vb_uuid, by_seqno) in entries {
                        dst.put_u64(*vb_uuid);
                        dst.put_u64(*by_seqno);
                    }
                }
                StreamReqBody::Rollback(seqno) => dst.put_u64(*seqno),
            },
            DcpEvent::AddStream { flags, .. } => dst.put_u32(*flags),
            DcpEvent::AddStreamRsp { stream_opaque, .. } => dst.put_u32(*stream_opaque),
            DcpEvent::SnapshotMarker(marker) => {
                dst.put_u64(marker.start);
                dst.put_u64(marker.end);
                dst.put_u32(marker.flags);
            }
            DcpEvent::Mutation { item, .. } => {
                let meta = item.ext_meta.as_ref().map(ExtendedMeta::to_wire);
                dst.put_u32(item.flags);
                dst.put_u32(item.expiry);
                dst.put_u64(item.cas);
                dst.put_u64(item.by_seqno);
                dst.put_u64(item.rev_seqno);
                dst.put_u8(item.nru);
                dst.put_u16(item.key.len() as u16);
                dst.put_u16(meta.as_ref().map_or(0, |meta| meta.len()) as u16);
                dst.put_slice(&item.key);
                if let Some(meta) = meta {
                    dst.put_slice(&meta);
                }
                if let Some(value) = item.value.as_ref() {
                    dst.put_slice(value);
                }
            }
            DcpEvent::Deletion { item, .. } | DcpEvent::Expiration { item, .. } => {
                let meta = item.ext_meta.as_ref().map(ExtendedMeta::to_wire);
                dst.put_u64(item.cas);
                dst.put_u64(item.by_seqno);
                dst.put_u64(item.rev_seqno);
                dst.put_u16(item.key.len() as u16);
                dst.put_u16(meta.as_ref().map_or(0, |meta| meta.len()) as u16);
                dst.put_slice(&item.key);
                if let Some(meta) = meta {
                    dst.put_slice(&meta);
                }
            }
            DcpEvent::SetVbState { state, .. } => dst.put_u8(state.to_wire()),
            DcpEvent::StreamEnd { reason, .. } => dst.put_u32(*reason as u32),
            DcpEvent::BufferAck { bytes, .. } => dst.put_u32(*bytes),
            DcpEvent::Control { key, value, .. } => {
                dst.put_u16(key.len() as u16);
                dst.put_slice(key.as_bytes());
                dst.put_slice(value.as_bytes());
            }
            DcpEvent::SnapshotMarkerRsp { .. }
            | DcpEvent::SetVbStateRsp { .. }
            | DcpEvent::Noop { .. }
            | DcpEvent::NoopRsp { .. }
            | DcpEvent::ControlRsp { .. } => {}
        }
    }
}

impl Encoder<DcpEvent> for DcpCodec {
    type Error = CodecError;

    fn encode(&mut self, event: DcpEvent, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(event.wire_len());

        let magic = if event.is_response() {
            MAGIC_RESPONSE
        } else {
            MAGIC_REQUEST
        };

        dst.put_u8(magic);
        dst.put_u8(event.opcode() as u8);
        dst.put_u16(Self::status(&event) as u16);
        dst.put_u16(event.vbucket());
        dst.put_u32(event.opaque());

        let body_start = dst.len() + 4;
        dst.put_u32(0);
        Self::encode_body(&event, dst);

        let body_len = (dst.len() - body_start) as u32;
        dst[body_start - 4..body_start].copy_from_slice(&body_len.to_be_bytes());

        Ok(())
    }
}

fn decode_item(
    mut body: BytesMut,
    vbucket: u16,
    deletion: bool,
) -> Result<Item, CodecError> {
    let kind = if deletion { "deletion" } else { "mutation" };
    let fixed = if deletion { 28 } else { 37 };

    if body.len() < fixed {
        return Err(CodecError::MalformedBody(kind));
    }

    let (flags, expiry) = if deletion {
        (0, 0)
    } else {
        (body.get_u32(), body.get_u32())
    };
    let cas = body.get_u64();
    let by_seqno = body.get_u64();
    let rev_seqno = body.get_u64();
    let nru = if deletion { 0 } else { body.get_u8() };
    let key_len = body.get_u16() as usize;
    let meta_len = body.get_u16() as usize;

    if body.len() < key_len + meta_len {
        return Err(CodecError::MalformedBody(kind));
    }

    let key = body.split_to(key_len);
    let meta = body.split_to(meta_len);
    let ext_meta = if meta.is_empty() {
        None
    } else {
        Some(ExtendedMeta::from_wire(&meta).map_err(|_| CodecError::MalformedBody(kind))?)
    };

    Ok(Item {
        vbucket,
        key: key.as_ref().into(),
        value: if deletion {
            None
        } else {
            Some(body.as_ref().into())
        },
        flags,
        expiry,
        cas,
        by_seqno,
        rev_seqno,
        nru,
        deleted: deletion,
        ext_meta,
    })
}

impl Decoder for DcpCodec {
    type Item = DcpEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_BYTES {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([src[10], src[11], src[12], src[13]]) as usize;
        if src.len() < HEADER_BYTES + body_len {
            src.reserve(HEADER_BYTES + body_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(HEADER_BYTES + body_len);
        let magic = frame.get_u8();
        let opcode = frame.get_u8();
        let raw_status = frame.get_u16();
        let vbucket = frame.get_u16();
        let opaque = frame.get_u32();
        frame.advance(4);
        let mut body = frame;

        let response = match magic {
            MAGIC_REQUEST => false,
            MAGIC_RESPONSE => true,
            other => return Err(CodecError::UnknownMagic(other)),
        };

        let opcode = Opcode::from_wire(opcode).ok_or(CodecError::UnknownOpcode(opcode))?;
        let status = Status::from_wire(raw_status).ok_or(CodecError::UnknownStatus(raw_status))?;

        let event = match (opcode, response) {
            (Opcode::StreamReq, false) => {
                if body.len() != 44 {
                    return Err(CodecError::MalformedBody("stream request"));
                }
                DcpEvent::StreamReq(StreamReq {
                    vbucket,
                    opaque,
                    flags: body.get_u32(),
                    start_seqno: body.get_u64(),
                    end_seqno: body.get_u64(),
                    vb_uuid: body.get_u64(),
                    snap_start: body.get_u64(),
                    snap_end: body.get_u64(),
                })
            }
            (Opcode::StreamReq, true) => {
                let body = match status {
                    Status::Rollback => {
                        if body.len() != 8 {
                            return Err(CodecError::MalformedBody("rollback"));
                        }
                        StreamReqBody::Rollback(body.get_u64())
                    }
                    Status::Ok => {
                        if body.is_empty() || body.len() % 16 != 0 {
                            return Err(CodecError::MalformedBody("failover log"));
                        }
                        let mut entries = Vec::with_capacity(body.len() / 16);
                        while !body.is_empty() {
                            entries.push((body.get_u64(), body.get_u64()));
                        }
                        StreamReqBody::Accepted(entries)
                    }
                };
                DcpEvent::StreamReqRsp { opaque, body }
            }
            (Opcode::AddStream, false) => {
                if body.len() != 4 {
                    return Err(CodecError::MalformedBody("add stream"));
                }
                DcpEvent::AddStream {
                    opaque,
                    vbucket,
                    flags: body.get_u32(),
                }
            }
            (Opcode::AddStream, true) => {
                if body.len() != 4 {
                    return Err(CodecError::MalformedBody("add stream response"));
                }
                DcpEvent::AddStreamRsp {
                    opaque,
                    stream_opaque: body.get_u32(),
                    status,
                }
            }
            (Opcode::SnapshotMarker, false) => {
                if body.len() != 20 {
                    return Err(CodecError::MalformedBody("snapshot marker"));
                }
                DcpEvent::SnapshotMarker(SnapshotMarker {
                    vbucket,
                    opaque,
                    start: body.get_u64(),
                    end: body.get_u64(),
                    flags: body.get_u32(),
                })
            }
            (Opcode::SnapshotMarker, true) => DcpEvent::SnapshotMarkerRsp { opaque, status },
            (Opcode::Mutation, false) => DcpEvent::Mutation {
                opaque,
                item: decode_item(body, vbucket, false)?,
            },
            (Opcode::Deletion, false) => DcpEvent::Deletion {
                opaque,
                item: decode_item(body, vbucket, true)?,
            },
            (Opcode::Expiration, false) => DcpEvent::Expiration {
                opaque,
                item: decode_item(body, vbucket, true)?,
            },
            (Opcode::SetVbState, false) => {
                let state = body
                    .first()
                    .copied()
                    .and_then(VbState::from_wire)
                    .ok_or(CodecError::MalformedBody("vbucket state"))?;
                DcpEvent::SetVbState {
                    vbucket,
                    opaque,
                    state,
                }
            }
            (Opcode::SetVbState, true) => DcpEvent::SetVbStateRsp { opaque, status },
            (Opcode::StreamEnd, false) => {
                if body.len() != 4 {
                    return Err(CodecError::MalformedBody("stream end"));
                }
                let reason = EndStreamReason::from_wire(body.get_u32())
                    .ok_or(CodecError::MalformedBody("stream end"))?;
                DcpEvent::StreamEnd {
                    vbucket,
                    opaque,
                    reason,
                }
            }
            (Opcode::Noop, false) => DcpEvent::Noop { opaque },
            (Opcode::Noop, true) => DcpEvent::NoopRsp { opaque },
            (Opcode::BufferAck, false) => {
                if body.len() != 4 {
                    return Err(CodecError::MalformedBody("buffer ack"));
                }
                DcpEvent::BufferAck {
                    opaque,
                    bytes: body.get_u32(),
                }
            }
            (Opcode::Control, false) => {
                if body.len() < 2 {
                    return Err(CodecError::MalformedBody("control"));
                }
                let key_len = body.get_u16() as usize;
                if body.len() < key_len {
                    return Err(CodecError::MalformedBody("control"));
                }
                let key = body.split_to(key_len);
                let key = String::from_utf8(key.to_vec())
                    .map_err(|_| CodecError::MalformedBody("control"))?;
                let value = String::from_utf8(body.to_vec())
                    .map_err(|_| CodecError::MalformedBody("control"))?;
                DcpEvent::Control { opaque, key, value }
            }
            (Opcode::Control, true) => DcpEvent::ControlRsp { opaque, status },
            (Opcode::StreamEnd, true)
            | (Opcode::BufferAck, true)
            | (Opcode::Mutation, true)
            | (Opcode::Deletion, true)
            | (Opcode::Expiration, true) => {
                return Err(CodecError::UnknownOpcode(opcode as u8));
            }
        };

        Ok(Some(event))
    }
}
