use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;

use crate::constants::MAX_KEY_SIZE;
use crate::core::hash_table::{HashTableVisitor, VisitAction};
use crate::core::store::EmberStore;
use crate::core::stored_value::StoredValue;
use crate::error::Result;
use crate::executor::task::{GlobalTask, TaskHandle, TaskKind, TaskType};

/// Path of a shard's access log under `base`.
pub fn shard_log_path(base: &Path, shard: usize) -> PathBuf {
    base.join(format!("access.log.{shard}"))
}

/// Entries are `(vbucket, key)` with a length-prefixed key so arbitrary
/// bytes round-trip.
pub fn write_access_log(path: &Path, entries: &[(u16, Vec<u8>)]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for (vb, key) in entries {
        let len = key.len().min(MAX_KEY_SIZE) as u16;
        writer.write_all(&vb.to_le_bytes())?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&key[..len as usize])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_access_log(path: &Path) -> Result<Vec<(u16, Vec<u8>)>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    loop {
        let mut vb_buf = [0u8; 2];
        match reader.read_exact(&mut vb_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf)?;
        let len = u16::from_le_bytes(len_buf) as usize;
        let mut key = vec![0u8; len];
        reader.read_exact(&mut key)?;
        entries.push((u16::from_le_bytes(vb_buf), key));
    }
    Ok(entries)
}

/// Collects keys of resident documents that have actually been referenced
/// since they were loaded.
struct AccessLogVisitor {
    vb: u16,
    entries: Vec<(u16, Vec<u8>)>,
}

impl HashTableVisitor for AccessLogVisitor {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitAction {
        if !sv.deleted && !sv.temp && sv.is_resident() && sv.nru == 0 {
            self.entries.push((self.vb, sv.key.clone()));
        }
        VisitAction::Keep
    }
}

/// AuxIO task that writes one access log per shard (rotating the previous
/// log to `.old`), used solely to prioritize future warmups. Skipped when
/// the bucket is mostly resident, since warmup would load everything
/// anyway.
pub struct AccessScannerTask {
    store: Weak<EmberStore>,
    base: PathBuf,
    sleep_time: Duration,
    residency_threshold: f64,
}

impl AccessScannerTask {
    pub fn new(
        store: Weak<EmberStore>,
        base: PathBuf,
        sleep_time: Duration,
        residency_threshold: f64,
    ) -> Self {
        Self {
            store,
            base,
            sleep_time,
            residency_threshold,
        }
    }
}

impl GlobalTask for AccessScannerTask {
    fn run(&self, handle: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };

        let (num_items, non_resident) = store.residency_counts();
        let resident_ratio = if num_items == 0 {
            1.0
        } else {
            (num_items - non_resident.min(num_items)) as f64 / num_items as f64
        };

        if resident_ratio >= self.residency_threshold {
            store
                .stats()
                .access_scanner_skips
                .fetch_add(1, Ordering::Relaxed);
            handle.snooze(self.sleep_time);
            return true;
        }

        store
            .stats()
            .access_scanner_runs
            .fetch_add(1, Ordering::Relaxed);

        for shard in store.shards() {
            let mut entries = Vec::new();
            for vbid in shard.vbucket_ids() {
                if let Some(vb) = shard.get_vbucket(vbid) {
                    let mut visitor = AccessLogVisitor {
                        vb: vbid,
                        entries: Vec::new(),
                    };
                    vb.ht.visit(&mut visitor);
                    entries.extend(visitor.entries);
                }
            }

            let path = shard_log_path(&self.base, shard.id);
            let old = PathBuf::from(format!("{}.old", path.display()));
            if path.exists() {
                let _ = fs::rename(&path, &old);
            }
            match write_access_log(&path, &entries) {
                Ok(()) => {
                    store
                        .stats()
                        .access_scanner_items
                        .fetch_add(entries.len() as u64, Ordering::Relaxed);
                    tracing::info!(shard = shard.id, keys = entries.len(), "wrote access log");
                }
                Err(e) => {
                    tracing::error!(shard = shard.id, error = %e, "access log write failed");
                }
            }
        }

        handle.snooze(self.sleep_time);
        true
    }

    fn description(&self) -> String {
        "Generating access log".to_string()
    }

    fn task_type(&self) -> TaskType {
        TaskType::AuxIO
    }

    fn kind(&self) -> TaskKind {
        TaskKind::AccessScanner
    }
}
