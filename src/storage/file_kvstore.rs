use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::core::item::{Item, ItemMeta};
use crate::error::{EmberError, Result};
use crate::storage::kvstore::{
    CompactionCtx, CompactionResult, FetchCtx, KVStore, ScanControl, ValueFilter, VbStateRecord,
};

const RECORD_MARKER: u16 = 0xEDB7;
const RECORD_HEADER_SIZE: usize = 42;

/// Append-only file per vbucket with an in-memory key index and a
/// seqno-ordered index for range scans. Records are framed with a fixed
/// little-endian header; the newest record for a key wins. The
/// vbucket-state record lives in a JSON sidecar next to the data file.
pub struct FileKVStore {
    dir: PathBuf,
    vbs: HashMap<u16, VbFile>,
    txn: Option<Vec<PendingOp>>,
}

enum PendingOp {
    Set(u16, Item),
}

#[derive(Debug, Clone)]
struct IndexEntry {
    offset: u64,
    key_len: u16,
    value_len: u32,
    meta: ItemMeta,
    by_seqno: u64,
    datatype: u8,
    deleted: bool,
}

impl IndexEntry {
    fn record_len(&self) -> u64 {
        (RECORD_HEADER_SIZE + self.key_len as usize + self.value_len as usize) as u64
    }
}

struct VbFile {
    path: PathBuf,
    state_path: PathBuf,
    file: File,
    eof: u64,
    index: HashMap<Vec<u8>, IndexEntry>,
    seqno_index: SkipMap<u64, Vec<u8>>,
    high_seqno: u64,
    data_size: u64,
    state: Option<VbStateRecord>,
}

fn encode_record(item: &Item) -> Vec<u8> {
    let key_len = item.key.len() as u16;
    let value_len = item.value.len() as u32;
    let mut buf =
        Vec::with_capacity(RECORD_HEADER_SIZE + key_len as usize + value_len as usize);
    buf.extend_from_slice(&RECORD_MARKER.to_le_bytes());
    buf.push(u8::from(item.deleted));
    buf.push(item.datatype);
    buf.extend_from_slice(&key_len.to_le_bytes());
    buf.extend_from_slice(&item.meta.flags.to_le_bytes());
    buf.extend_from_slice(&item.meta.exptime.to_le_bytes());
    buf.extend_from_slice(&item.meta.cas.to_le_bytes());
    buf.extend_from_slice(&item.meta.rev_seqno.to_le_bytes());
    buf.extend_from_slice(&item.by_seqno.to_le_bytes());
    buf.extend_from_slice(&value_len.to_le_bytes());
    buf.extend_from_slice(&item.key);
    buf.extend_from_slice(&item.value);
    buf
}

struct DecodedHeader {
    deleted: bool,
    datatype: u8,
    key_len: u16,
    flags: u32,
    exptime: u32,
    cas: u64,
    rev_seqno: u64,
    by_seqno: u64,
    value_len: u32,
}

fn decode_header(buf: &[u8; RECORD_HEADER_SIZE]) -> Option<DecodedHeader> {
    let marker = u16::from_le_bytes([buf[0], buf[1]]);
    if marker != RECORD_MARKER {
        return None;
    }
    Some(DecodedHeader {
        deleted: buf[2] != 0,
        datatype: buf[3],
        key_len: u16::from_le_bytes([buf[4], buf[5]]),
        flags: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
        exptime: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
        cas: u64::from_le_bytes(buf[14..22].try_into().ok()?),
        rev_seqno: u64::from_le_bytes(buf[22..30].try_into().ok()?),
        by_seqno: u64::from_le_bytes(buf[30..38].try_into().ok()?),
        value_len: u32::from_le_bytes(buf[38..42].try_into().ok()?),
    })
}

impl VbFile {
    fn open(dir: &Path, vb: u16) -> Result<Self> {
        let path = dir.join(format!("{vb}.ember"));
        let state_path = dir.join(format!("{vb}.state.json"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let state = match fs::read(&state_path) {
            Ok(raw) => Some(
                serde_json::from_slice::<VbStateRecord>(&raw)
                    .map_err(|e| EmberError::Corrupted(e.to_string()))?,
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut vbf = Self {
            path,
            state_path,
            file,
            eof: 0,
            index: HashMap::new(),
            seqno_index: SkipMap::new(),
            high_seqno: 0,
            data_size: 0,
            state,
        };
        vbf.rebuild_index()?;
        Ok(vbf)
    }

    /// Sequentially walk the file, newest record per key winning. A
    /// truncated tail (torn final write) ends the walk without error.
    fn rebuild_index(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut offset = 0u64;
        while offset + RECORD_HEADER_SIZE as u64 <= file_len {
            let mut header = [0u8; RECORD_HEADER_SIZE];
            self.file.read_exact_at(&mut header, offset)?;
            let Some(h) = decode_header(&header) else {
                tracing::warn!(path = %self.path.display(), offset, "bad record marker, truncating scan");
                break;
            };
            let record_len =
                (RECORD_HEADER_SIZE + h.key_len as usize + h.value_len as usize) as u64;
            if offset + record_len > file_len {
                tracing::warn!(path = %self.path.display(), offset, "torn record at tail");
                break;
            }

            let mut key = vec![0u8; h.key_len as usize];
            self.file
                .read_exact_at(&mut key, offset + RECORD_HEADER_SIZE as u64)?;
            let entry = IndexEntry {
                offset,
                key_len: h.key_len,
                value_len: h.value_len,
                meta: ItemMeta {
                    cas: h.cas,
                    rev_seqno: h.rev_seqno,
                    flags: h.flags,
                    exptime: h.exptime,
                },
                by_seqno: h.by_seqno,
                datatype: h.datatype,
                deleted: h.deleted,
            };
            self.apply_index(key, entry);
            offset += record_len;
        }
        self.eof = offset;
        Ok(())
    }

    fn apply_index(&mut self, key: Vec<u8>, entry: IndexEntry) {
        self.high_seqno = self.high_seqno.max(entry.by_seqno);
        if let Some(old) = self.index.get(&key) {
            self.data_size = self.data_size.saturating_sub(old.record_len());
            self.seqno_index.remove(&old.by_seqno);
        }
        self.data_size += entry.record_len();
        self.seqno_index.insert(entry.by_seqno, key.clone());
        self.index.insert(key, entry);
    }

    fn append(&mut self, item: &Item) -> Result<()> {
        let buf = encode_record(item);
        self.file.write_all_at(&buf, self.eof)?;
        let entry = IndexEntry {
            offset: self.eof,
            key_len: item.key.len() as u16,
            value_len: item.value.len() as u32,
            meta: item.meta,
            by_seqno: item.by_seqno,
            datatype: item.datatype,
            deleted: item.deleted,
        };
        self.eof += buf.len() as u64;
        self.apply_index(item.key.clone(), entry);
        Ok(())
    }

    fn read_value(&self, entry: &IndexEntry) -> Result<Bytes> {
        let mut buf = vec![0u8; entry.value_len as usize];
        let value_offset =
            entry.offset + RECORD_HEADER_SIZE as u64 + entry.key_len as u64;
        self.file.read_exact_at(&mut buf, value_offset)?;
        Ok(Bytes::from(buf))
    }

    fn item_from_entry(&self, key: &[u8], entry: &IndexEntry, want_value: bool) -> Result<Item> {
        let value = if want_value && !entry.deleted {
            self.read_value(entry)?
        } else {
            Bytes::new()
        };
        Ok(Item {
            key: key.to_vec(),
            value,
            meta: entry.meta,
            by_seqno: entry.by_seqno,
            datatype: entry.datatype,
            deleted: entry.deleted,
        })
    }

    fn write_state(&mut self, record: &VbStateRecord) -> Result<()> {
        let raw = serde_json::to_vec_pretty(record)?;
        fs::write(&self.state_path, raw)?;
        self.state = Some(record.clone());
        Ok(())
    }
}

impl FileKVStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut vbs = HashMap::new();
        for dirent in fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".ember") else {
                continue;
            };
            let Ok(vb) = stem.parse::<u16>() else { continue };
            let vbf = VbFile::open(&dir, vb)?;
            vbs.insert(vb, vbf);
        }

        tracing::info!(dir = %dir.display(), vbuckets = vbs.len(), "opened kv store");
        Ok(Self {
            dir,
            vbs,
            txn: None,
        })
    }

    fn vb(&self, vb: u16) -> Result<&VbFile> {
        self.vbs.get(&vb).ok_or(EmberError::NotMyVbucket)
    }

    fn vb_mut_or_create(&mut self, vb: u16) -> Result<&mut VbFile> {
        if !self.vbs.contains_key(&vb) {
            let vbf = VbFile::open(&self.dir, vb)?;
            self.vbs.insert(vb, vbf);
        }
        Ok(self
            .vbs
            .get_mut(&vb)
            .expect("vbucket file just inserted"))
    }
}

impl KVStore for FileKVStore {
    fn get(&self, vb: u16, key: &[u8]) -> Result<Option<Item>> {
        let vbf = self.vb(vb)?;
        match vbf.index.get(key) {
            Some(entry) => Ok(Some(vbf.item_from_entry(key, entry, true)?)),
            None => Ok(None),
        }
    }

    fn get_multi(&self, vb: u16, fetches: &mut HashMap<Vec<u8>, FetchCtx>) -> Result<()> {
        let vbf = self.vb(vb)?;
        for (key, ctx) in fetches.iter_mut() {
            if let Some(entry) = vbf.index.get(key) {
                ctx.item = Some(vbf.item_from_entry(key, entry, !ctx.meta_only)?);
            }
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(EmberError::InvalidArgument);
        }
        self.txn = Some(Vec::new());
        Ok(())
    }

    fn set(&mut self, vb: u16, item: &Item) -> Result<()> {
        match self.txn.as_mut() {
            Some(ops) => {
                ops.push(PendingOp::Set(vb, item.clone()));
                Ok(())
            }
            None => Err(EmberError::InvalidArgument),
        }
    }

    fn del(&mut self, vb: u16, key: &[u8], seqno: u64, meta: &ItemMeta) -> Result<()> {
        let mut tombstone = Item::tombstone(key.to_vec(), *meta);
        tombstone.by_seqno = seqno;
        self.set(vb, &tombstone)
    }

    fn commit(&mut self) -> Result<()> {
        let ops = self.txn.take().ok_or(EmberError::InvalidArgument)?;
        let mut touched: Vec<u16> = Vec::new();
        for op in ops {
            match op {
                PendingOp::Set(vb, item) => {
                    let vbf = self.vb_mut_or_create(vb)?;
                    vbf.append(&item)?;
                    if !touched.contains(&vb) {
                        touched.push(vb);
                    }
                }
            }
        }
        for vb in touched {
            if let Some(vbf) = self.vbs.get(&vb) {
                vbf.file.sync_all()?;
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.txn = None;
        Ok(())
    }

    fn snapshot_vbucket(&mut self, vb: u16, record: &VbStateRecord) -> Result<()> {
        let vbf = self.vb_mut_or_create(vb)?;
        vbf.write_state(record)
    }

    fn compact_db(&mut self, vb: u16, ctx: &mut CompactionCtx<'_>) -> Result<CompactionResult> {
        let vbf = self
            .vbs
            .get_mut(&vb)
            .ok_or(EmberError::NotMyVbucket)?;
        let file_size_before = vbf.file.metadata()?.len();
        let highest = vbf.high_seqno;

        let mut result = CompactionResult {
            file_size_before,
            ..Default::default()
        };

        // partition the index into purged tombstones and survivors
        let mut survivors: Vec<(Vec<u8>, IndexEntry)> = Vec::new();
        for (key, entry) in vbf.index.iter() {
            let purgeable = entry.deleted
                && entry.by_seqno != highest
                && (ctx.drop_deletes || entry.by_seqno <= ctx.purge_before_seqno);
            if purgeable {
                result.purged_up_to = result.purged_up_to.max(entry.by_seqno);
                result.tombstones_purged += 1;
            } else {
                survivors.push((key.clone(), entry.clone()));
            }
        }
        survivors.sort_by_key(|(_, e)| e.by_seqno);

        // report callbacks before rewriting
        for (key, entry) in &survivors {
            if let Some(cb) = ctx.surviving_key.as_mut() {
                cb(key, entry.deleted);
            }
            if !entry.deleted && entry.meta.exptime != 0 && entry.meta.exptime <= ctx.now {
                if let Some(cb) = ctx.expired.as_mut() {
                    cb(vbf.item_from_entry(key, entry, false)?);
                }
            }
        }

        // rewrite the data file with only the survivors
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        let mut new_offset = 0u64;
        let mut new_entries: Vec<(Vec<u8>, IndexEntry)> = Vec::new();
        for (key, entry) in &survivors {
            let item = vbf.item_from_entry(key, entry, true)?;
            let buf = encode_record(&item);
            tmp.as_file().write_all_at(&buf, new_offset)?;
            let mut new_entry = entry.clone();
            new_entry.offset = new_offset;
            new_offset += buf.len() as u64;
            new_entries.push((key.clone(), new_entry));
        }
        tmp.as_file().sync_all()?;
        vbf.file = tmp
            .persist(&vbf.path)
            .map_err(|e| EmberError::Io(e.error))?;
        vbf.eof = new_offset;
        vbf.index.clear();
        vbf.seqno_index = SkipMap::new();
        vbf.data_size = 0;
        for (key, entry) in new_entries {
            vbf.apply_index(key, entry);
        }
        vbf.high_seqno = highest;

        result.file_size_after = vbf.file.metadata()?.len();
        tracing::debug!(
            vb,
            purged = result.tombstones_purged,
            purged_up_to = result.purged_up_to,
            "compacted vbucket file"
        );
        Ok(result)
    }

    fn list_persisted_vbuckets(&self) -> Result<Vec<(u16, VbStateRecord)>> {
        let mut out = Vec::new();
        for (vb, vbf) in self.vbs.iter() {
            let record = match &vbf.state {
                Some(state) => state.clone(),
                // legacy file without a state sidecar
                None => VbStateRecord {
                    state: crate::core::vbucket::VBucketState::Active,
                    checkpoint_id: 0,
                    max_deleted_seqno: 0,
                    failover_table: Vec::new(),
                    snap_start: 0,
                    snap_end: vbf.high_seqno,
                    max_cas: 0,
                    hlc_drift_ahead_us: 0,
                    hlc_drift_behind_us: 0,
                },
            };
            out.push((*vb, record));
        }
        out.sort_by_key(|(vb, _)| *vb);
        Ok(out)
    }

    fn scan(
        &self,
        vb: u16,
        start_seqno: u64,
        end_seqno: u64,
        filter: ValueFilter,
        callback: &mut dyn FnMut(Item) -> ScanControl,
    ) -> Result<()> {
        let vbf = self.vb(vb)?;
        for seqno_entry in vbf.seqno_index.range(start_seqno..=end_seqno) {
            let key = seqno_entry.value();
            let Some(entry) = vbf.index.get(key) else {
                continue;
            };
            if entry.by_seqno != *seqno_entry.key() {
                continue; // superseded since the seqno index was written
            }
            let want_value = filter == ValueFilter::Values;
            let item = vbf.item_from_entry(key, entry, want_value)?;
            if callback(item) == ScanControl::Stop {
                break;
            }
        }
        Ok(())
    }

    fn get_item_count(&self, vb: u16) -> Result<usize> {
        let vbf = self.vb(vb)?;
        Ok(vbf.index.values().filter(|e| !e.deleted).count())
    }

    fn get_db_file_size(&self, vb: u16) -> Result<u64> {
        Ok(self.vb(vb)?.file.metadata()?.len())
    }

    fn get_db_data_size(&self, vb: u16) -> Result<u64> {
        Ok(self.vb(vb)?.data_size)
    }

    fn high_seqno(&self, vb: u16) -> Result<u64> {
        Ok(self.vb(vb)?.high_seqno)
    }

    fn delete_vbucket(&mut self, vb: u16) -> Result<()> {
        if let Some(vbf) = self.vbs.remove(&vb) {
            match fs::remove_file(&vbf.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            match fs::remove_file(&vbf.state_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::info!(vb, "deleted vbucket file");
        }
        Ok(())
    }
}
