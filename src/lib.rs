//! # EmberKV - Eventually-Persistent Bucket Engine Core
//!
//! The in-memory core of a vbucket-partitioned document store: the
//! authoritative working set lives in per-vbucket hash tables, mutations
//! are stamped with monotonic sequence numbers and HLC-derived CAS
//! tokens, and persistence happens asynchronously through per-shard
//! flushers into an on-disk KV store. Non-resident documents are pulled
//! back by batching background fetchers, memory pressure is relieved by
//! an NRU item pager, and startup rebuilds the memory image via a warmup
//! state machine.
//!
//! ## Architecture
//!
//! - **HashTable** — lock-striped chained index of `StoredValue`s, one
//!   per vbucket, with pausable visitors and online resize.
//! - **VBucket** — the unit of ownership and ordering: state machine,
//!   checkpoint log, failover lineage, bloom filter and hybrid logical
//!   clock.
//! - **Shard** — a slice of vbuckets sharing one KV store handle, one
//!   flusher and one background fetcher (`vb % num_shards`).
//! - **ExecutorPool** — process-wide scheduler with Writer, Reader,
//!   AuxIO and NonIO worker groups.
//! - **Warmup** — startup state machine restoring vbuckets, metadata and
//!   values from disk up to configurable thresholds.
//!
//! ## Quick start
//!
//! ```no_run
//! use emberkv::{EmberStore, VBucketState};
//!
//! # fn main() -> emberkv::Result<()> {
//! let store = EmberStore::builder("/tmp/emberkv-data").build()?;
//! store.set_vbucket_state(0, VBucketState::Active, false)?;
//! store.enable_traffic();
//!
//! let cas = store.set(0, b"greeting", &b"hello"[..])?;
//! let item = store.get(0, b"greeting")?;
//! assert_eq!(&item.value[..], b"hello");
//! assert_eq!(item.meta.cas, cas);
//! # Ok(())
//! # }
//! ```
//!
//! Writes are acknowledged from memory; observe persistence through
//! `observe`/`observe_seqno` or drain it explicitly with `force_flush`.
//! A client that hits a non-resident document receives `WouldBlock` and
//! is resumed through the configured [`core::notifier::EngineNotifier`]
//! once the background fetch completes.

pub mod constants;
pub mod core;
pub mod error;
pub mod executor;
pub mod stats;
pub mod storage;
pub mod tasks;
pub mod utils;
pub mod warmup;

pub use crate::core::hash_table::EvictionPolicy;
pub use crate::core::item::{Item, ItemMeta};
pub use crate::core::notifier::{ChannelNotifier, Cookie, EngineNotifier, NotifyStatus};
pub use crate::core::store::{EmberStore, StoreBuilder, StoreConfig};
pub use crate::core::vbucket::{VBucketState, WithMetaOutcome};
pub use crate::error::{EmberError, Result};
pub use crate::stats::{Statistics, StatsSnapshot};

#[cfg(test)]
mod tests;
