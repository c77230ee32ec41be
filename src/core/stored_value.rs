use std::time::Instant;

use bytes::Bytes;

use crate::constants::{INITIAL_NRU, MAX_NRU};
use crate::core::item::{Item, ItemMeta};

/// The in-memory record of one key, chained into a hash bucket.
///
/// All fields are read and written under the owning hash-bucket lock; the
/// chain link is an owning pointer so the table can hand a value out by
/// detaching its box.
#[derive(Debug)]
pub struct StoredValue {
    pub key: Vec<u8>,
    /// `None` when the value has been ejected (non-resident) or the
    /// revision is a value-less tombstone.
    pub value: Option<Bytes>,
    pub cas: u64,
    pub rev_seqno: u64,
    pub by_seqno: u64,
    pub flags: u32,
    pub exptime: u32,
    pub datatype: u8,
    pub dirty: bool,
    pub deleted: bool,
    pub resident: bool,
    /// Placeholder created while a background fetch is in flight.
    pub temp: bool,
    /// Not-recently-used age; 0 = just touched, MAX_NRU = eviction candidate.
    pub nru: u8,
    /// Defragmenter age; bumped per sweep, reset when the blob is rewritten.
    pub value_age: u8,
    /// GETL lock; cleared lazily once the deadline passes.
    pub lock_expiry: Option<Instant>,
    pub next: Option<Box<StoredValue>>,
}

impl StoredValue {
    pub fn from_item(item: &Item) -> Box<StoredValue> {
        Box::new(StoredValue {
            key: item.key.clone(),
            value: if item.deleted && item.value.is_empty() {
                None
            } else {
                Some(item.value.clone())
            },
            cas: item.meta.cas,
            rev_seqno: item.meta.rev_seqno,
            by_seqno: item.by_seqno,
            flags: item.meta.flags,
            exptime: item.meta.exptime,
            datatype: item.datatype,
            dirty: false,
            deleted: item.deleted,
            resident: true,
            temp: false,
            nru: INITIAL_NRU,
            value_age: 0,
            lock_expiry: None,
            next: None,
        })
    }

    /// Placeholder with no meta, parked in the table while the real
    /// document is fetched from disk.
    pub fn new_temp(key: Vec<u8>) -> Box<StoredValue> {
        Box::new(StoredValue {
            key,
            value: None,
            cas: 0,
            rev_seqno: 0,
            by_seqno: 0,
            flags: 0,
            exptime: 0,
            datatype: 0,
            dirty: false,
            deleted: false,
            resident: false,
            temp: true,
            nru: MAX_NRU,
            value_age: 0,
            lock_expiry: None,
            next: None,
        })
    }

    pub fn meta(&self) -> ItemMeta {
        ItemMeta {
            cas: self.cas,
            rev_seqno: self.rev_seqno,
            flags: self.flags,
            exptime: self.exptime,
        }
    }

    pub fn is_locked(&self, now: Instant) -> bool {
        match self.lock_expiry {
            Some(deadline) => deadline > now,
            None => false,
        }
    }

    /// Clears an elapsed lock as a side effect.
    pub fn check_and_expire_lock(&mut self, now: Instant) -> bool {
        if let Some(deadline) = self.lock_expiry {
            if deadline > now {
                return true;
            }
            self.lock_expiry = None;
        }
        false
    }

    pub fn is_expired(&self, now: u32) -> bool {
        !self.deleted && self.exptime != 0 && self.exptime <= now
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    /// Replace the stored revision in place from a freshly accepted item.
    pub fn replace_from(&mut self, item: &Item) {
        self.value = if item.deleted && item.value.is_empty() {
            None
        } else {
            Some(item.value.clone())
        };
        self.cas = item.meta.cas;
        self.rev_seqno = item.meta.rev_seqno;
        self.by_seqno = item.by_seqno;
        self.flags = item.meta.flags;
        self.exptime = item.meta.exptime;
        self.datatype = item.datatype;
        self.deleted = item.deleted;
        self.resident = true;
        self.temp = false;
        self.nru = INITIAL_NRU;
        self.value_age = 0;
        self.lock_expiry = None;
    }

    /// Drop the value blob, keeping metadata (value eviction). Returns the
    /// number of bytes released.
    pub fn eject_value(&mut self) -> usize {
        let released = self.value.as_ref().map_or(0, Bytes::len);
        self.value = None;
        self.resident = false;
        released
    }

    /// Reattach a fetched value blob to a non-resident record.
    pub fn restore_value(&mut self, item: &Item) {
        self.value = Some(item.value.clone());
        self.datatype = item.datatype;
        self.resident = true;
        self.temp = false;
        self.nru = INITIAL_NRU;
    }

    /// Fill in metadata on a temp placeholder without making it resident.
    pub fn restore_meta(&mut self, item: &Item) {
        self.cas = item.meta.cas;
        self.rev_seqno = item.meta.rev_seqno;
        self.by_seqno = item.by_seqno;
        self.flags = item.meta.flags;
        self.exptime = item.meta.exptime;
        self.datatype = item.datatype;
        self.deleted = item.deleted;
        self.temp = false;
        self.resident = false;
    }

    pub fn to_item(&self) -> Item {
        Item {
            key: self.key.clone(),
            value: self.value.clone().unwrap_or_default(),
            meta: self.meta(),
            by_seqno: self.by_seqno,
            datatype: self.datatype,
            deleted: self.deleted,
        }
    }

    /// In-memory footprint of this record, chain link included.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.value.as_ref().map_or(0, Bytes::len)
    }
}
