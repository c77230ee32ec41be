use bytes::Bytes;

use crate::constants::DATATYPE_RAW;

/// Cross-datacenter metadata carried by every document revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemMeta {
    pub cas: u64,
    pub rev_seqno: u64,
    pub flags: u32,
    /// Absolute unix seconds; 0 means the document never expires.
    pub exptime: u32,
}

impl ItemMeta {
    /// Conflict-resolution ordering: revSeqno, then CAS, then expiration,
    /// then flags. The larger tuple wins.
    pub fn wins_over(&self, other: &ItemMeta) -> bool {
        (self.rev_seqno, self.cas, self.exptime, self.flags)
            > (other.rev_seqno, other.cas, other.exptime, other.flags)
    }
}

/// One document revision as exchanged with clients, the checkpoint log and
/// the underlying KV store.
#[derive(Debug, Clone)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Bytes,
    pub meta: ItemMeta,
    pub by_seqno: u64,
    pub datatype: u8,
    pub deleted: bool,
}

impl Item {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            meta: ItemMeta::default(),
            by_seqno: 0,
            datatype: DATATYPE_RAW,
            deleted: false,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.meta.flags = flags;
        self
    }

    pub fn with_exptime(mut self, exptime: u32) -> Self {
        self.meta.exptime = exptime;
        self
    }

    pub fn with_datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_meta(mut self, meta: ItemMeta) -> Self {
        self.meta = meta;
        self
    }

    /// A tombstone revision for `key`.
    pub fn tombstone(key: impl Into<Vec<u8>>, meta: ItemMeta) -> Self {
        Self {
            key: key.into(),
            value: Bytes::new(),
            meta,
            by_seqno: 0,
            datatype: DATATYPE_RAW,
            deleted: true,
        }
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.meta.exptime != 0 && self.meta.exptime <= now
    }

    /// Approximate in-memory footprint, used for quota accounting.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.value.len()
    }
}
