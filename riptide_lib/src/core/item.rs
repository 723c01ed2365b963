use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{Seqno, Vbid};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ItemError {
    #[error("Item has no key")]
    MissingKey,
    #[error("Sequence number 0 is reserved")]
    ZeroSeqno,
    #[error("Malformed extended metadata")]
    MalformedMeta,
}

/// Extended metadata rider carried next to a mutation.
///
/// The only supported layout is a one-byte version tag followed by a
/// one-byte conflict resolution mode and an optional adjusted time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExtendedMeta {
    conflict_res_mode: u8,
    adjusted_time: Option<i64>,
}

const EXT_META_VERSION: u8 = 0x01;

impl ExtendedMeta {
    pub fn new(conflict_res_mode: u8, adjusted_time: Option<i64>) -> ExtendedMeta {
        ExtendedMeta {
            conflict_res_mode,
            adjusted_time,
        }
    }

    pub fn conflict_res_mode(&self) -> u8 {
        self.conflict_res_mode
    }

    pub fn adjusted_time(&self) -> Option<i64> {
        self.adjusted_time
    }

    pub fn from_wire(bytes: &[u8]) -> Result<ExtendedMeta, ItemError> {
        match bytes {
            [EXT_META_VERSION, mode] => Ok(ExtendedMeta::new(*mode, None)),
            [EXT_META_VERSION, mode, time @ ..] if time.len() == 8 => {
                let mut raw = [0; 8];
                raw.copy_from_slice(time);
                Ok(ExtendedMeta::new(*mode, Some(i64::from_be_bytes(raw))))
            }
            _ => Err(ItemError::MalformedMeta),
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = vec![EXT_META_VERSION, self.conflict_res_mode];
        if let Some(time) = self.adjusted_time {
            out.extend_from_slice(&time.to_be_bytes());
        }
        out
    }

    pub fn wire_len(&self) -> usize {
        2 + self.adjusted_time.map_or(0, |_| 8)
    }
}

/// A single replicated key/value change, positioned in a vbucket's
/// seqno space.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub vbucket: Vbid,
    pub key: Box<[u8]>,
    pub value: Option<Box<[u8]>>,
    pub flags: u32,
    pub expiry: u32,
    pub cas: u64,
    pub by_seqno: Seqno,
    pub rev_seqno: Seqno,
    pub nru: u8,
    pub deleted: bool,
    pub ext_meta: Option<ExtendedMeta>,
}

impl Item {
    pub fn size(&self) -> usize {
        self.key.len()
            + self.value.as_ref().map_or(0, |value| value.len())
            + self.ext_meta.as_ref().map_or(0, ExtendedMeta::wire_len)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Item builder
///
/// ```
/// use riptide_lib::core::item::ItemBuilder;
///
/// let item = ItemBuilder::default()
///     .vbucket(0)
///     .key(b"user::1000")
///     .value(b"{}")
///     .by_seqno(42)
///     .compose()
///     .unwrap();
///
/// assert_eq!(item.by_seqno, 42);
/// ```
#[derive(Default)]
pub struct ItemBuilder {
    vbucket: Vbid,
    key: Option<Box<[u8]>>,
    value: Option<Box<[u8]>>,
    flags: u32,
    expiry: u32,
    cas: u64,
    by_seqno: Seqno,
    rev_seqno: Seqno,
    nru: u8,
    deleted: bool,
    ext_meta: Option<ExtendedMeta>,
}

impl ItemBuilder {
    pub fn vbucket(mut self, vbucket: Vbid) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn key<K: AsRef<[u8]>>(mut self, key: K) -> Self {
        self.key = Some(key.as_ref().into());
        self
    }

    pub fn value<V: AsRef<[u8]>>(mut self, value: V) -> Self {
        self.value = Some(value.as_ref().into());
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn by_seqno(mut self, by_seqno: Seqno) -> Self {
        self.by_seqno = by_seqno;
        self
    }

    pub fn rev_seqno(mut self, rev_seqno: Seqno) -> Self {
        self.rev_seqno = rev_seqno;
        self
    }

    pub fn nru(mut self, nru: u8) -> Self {
        self.nru = nru;
        self
    }

    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self.value = None;
        self
    }

    pub fn ext_meta(mut self, meta: ExtendedMeta) -> Self {
        self.ext_meta = Some(meta);
        self
    }

    pub fn compose(self) -> Result<Item, ItemError> {
        if self.by_seqno == 0 {
            return Err(ItemError::ZeroSeqno);
        }

        Ok(Item {
            vbucket: self.vbucket,
            key: self.key.ok_or(ItemError::MissingKey)?,
            value: self.value,
            flags: self.flags,
            expiry: self.expiry,
            cas: self.cas,
            by_seqno: self.by_seqno,
            rev_seqno: self.rev_seqno,
            nru: self.nru,
            deleted: self.deleted,
            ext_meta: self.ext_meta,
        })
    }
}
