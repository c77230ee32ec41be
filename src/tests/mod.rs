// Test modules for EmberKV

#[cfg(test)]
pub mod hash_table_tests;


#[cfg(test)]
pub mod vbucket_tests;


#[cfg(test)]
pub mod hlc_tests;

#[cfg(test)]
pub mod bloom_tests;





#[cfg(test)]
pub mod pager_tests;

#[cfg(test)]
pub mod warmup_tests;

#[cfg(test)]
pub mod store_tests;

#[cfg(test)]
pub mod support {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Instant;

    use crossbeam_channel::Receiver;

    use crate::core::notifier::{ChannelNotifier, Cookie, NotifyStatus};
    use crate::core::store::{EmberStore, StoreBuilder};
    use crate::executor::task::TaskHandle;
    use crate::storage::bgfetcher::BgFetcherTask;
    use crate::{EvictionPolicy, VBucketState};

    pub fn open_store(dir: &Path) -> Arc<EmberStore> {
        let store = StoreBuilder::new(dir)
            .max_num_shards(2)
            .max_vbuckets(16)
            .build()
            .unwrap();
        store.set_vbucket_state(0, VBucketState::Active, false).unwrap();
        store
    }

    pub fn open_store_with_notifier(
        dir: &Path,
        policy: EvictionPolicy,
    ) -> (Arc<EmberStore>, Receiver<(Cookie, NotifyStatus)>) {
        let (notifier, rx) = ChannelNotifier::new();
        let store = StoreBuilder::new(dir)
            .max_num_shards(2)
            .max_vbuckets(16)
            .eviction_policy(policy)
            .notifier(Arc::new(notifier))
            .build()
            .unwrap();
        store.set_vbucket_state(0, VBucketState::Active, false).unwrap();
        (store, rx)
    }

    /// Drive one background-fetch pass for the shard owning `vb`,
    /// synchronously, without waiting on the scheduled task.
    pub fn run_bgfetcher(store: &Arc<EmberStore>, vb: u16) {
        let shard = store.shard_for(vb);
        let fetcher = shard.bgfetcher().clone();
        let handle = TaskHandle::new(
            u64::MAX,
            Box::new(BgFetcherTask {
                fetcher: fetcher.clone(),
                shard_id: shard.id,
            }),
            Instant::now(),
        );
        fetcher.step(&handle);
    }
}
