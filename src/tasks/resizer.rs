use std::sync::Weak;
use std::time::Duration;

use crate::core::store::EmberStore;
use crate::executor::task::{GlobalTask, TaskHandle, TaskKind, TaskType};

const RESIZE_INTERVAL: Duration = Duration::from_secs(60);

/// NonIO task that nudges every vbucket's hash table back into its
/// load-factor band.
pub struct HashtableResizerTask {
    store: Weak<EmberStore>,
}

impl HashtableResizerTask {
    pub fn new(store: Weak<EmberStore>) -> Self {
        Self { store }
    }
}

impl GlobalTask for HashtableResizerTask {
    fn run(&self, handle: &TaskHandle) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };

        for vb in store.all_vbuckets() {
            if let Some(target) = vb.ht.needs_resize() {
                vb.ht.resize(Some(target));
            }
        }

        handle.snooze(RESIZE_INTERVAL);
        true
    }

    fn description(&self) -> String {
        "Adjusting hash table sizes".to_string()
    }

    fn task_type(&self) -> TaskType {
        TaskType::NonIO
    }

    fn kind(&self) -> TaskKind {
        TaskKind::HtResizer
    }
}
