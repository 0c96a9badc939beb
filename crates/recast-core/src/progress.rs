//! Per-job conversion progress, shared between the pipeline and the
//! progress endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, warn};

#[derive(Debug)]
struct Entry {
    percent: u8,
    /// Changes whenever the entry is created or rescheduled; a timer only
    /// evicts the generation it was armed for.
    generation: u64,
    eviction: Option<AbortHandle>,
}

/// Job id → percentage in `0..=100`. Percentages never go down, and an
/// unknown id reads as 0.
#[derive(Clone, Default)]
pub struct ProgressStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProgressStore({} jobs)", self.active_jobs())
    }
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `id` at 0%. Returns `false` if the id is already tracked.
    pub fn start(&self, id: &str) -> bool {
        let generation = self.bump();
        let mut entries = self.lock();
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(
            id.to_owned(),
            Entry {
                percent: 0,
                generation,
                eviction: None,
            },
        );
        true
    }

    /// Raise the job to `percent` (clamped to 100). Lower values and unknown
    /// ids are ignored; returns whether the stored value was set.
    pub fn advance(&self, id: &str, percent: u8) -> bool {
        let percent = percent.min(100);
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(entry) if percent >= entry.percent => {
                entry.percent = percent;
                true
            }
            Some(entry) => {
                debug!(job_id = id, current = entry.percent, percent, "ignoring progress regression");
                false
            }
            None => false,
        }
    }

    pub fn query(&self, id: &str) -> u8 {
        self.lock().get(id).map_or(0, |entry| entry.percent)
    }

    /// Remove `id` once `after` has elapsed. A later call replaces the
    /// pending schedule.
    pub fn expire(&self, id: &str, after: Duration) {
        let generation = self.bump();
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        if let Some(previous) = entry.eviction.take() {
            previous.abort();
        }
        entry.generation = generation;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(job_id = id, "no runtime to schedule eviction; evicting now");
            entries.remove(id);
            return;
        };

        let store = self.clone();
        let key = id.to_owned();
        let task = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let mut entries = store.lock();
            if entries.get(&key).is_some_and(|e| e.generation == generation) {
                entries.remove(&key);
                debug!(job_id = %key, "progress entry evicted");
            }
        });
        entry.eviction = Some(task.abort_handle());
    }

    /// Remove `id` now, cancelling any scheduled eviction.
    pub fn discard(&self, id: &str) {
        if let Some(entry) = self.lock().remove(id) {
            if let Some(eviction) = entry.eviction {
                eviction.abort();
            }
        }
    }

    /// Number of tracked jobs, finished ones awaiting eviction included.
    pub fn active_jobs(&self) -> usize {
        self.lock().len()
    }

    fn bump(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    // The map holds plain values; a panic mid-update cannot leave it torn.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
