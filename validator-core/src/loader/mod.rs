//! Content-addressed machine loader
//!
//! Building a machine set means reading and decoding a large image and
//! stepping it to its first host-I/O boundary, so every module root is built
//! at most once per process and then shared.
//!
//! # Single-flight cache
//! Each key is absent, building, or ready:
//! - ready: callers get the cached value immediately;
//! - building: callers join the in-flight build and receive its outcome;
//! - absent: the caller starts a build on the blocking pool.
//!
//! A failed build removes its marker, so the next caller retries, and every
//! caller that joined the failed build receives the same error. The map lock
//! is only held for state transitions; builds of unrelated roots run in
//! parallel. Entries are never evicted.

pub mod locator;
pub mod machines;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Result, ValidatorError};
use crate::types::ModuleRoot;

pub use locator::MachineLocator;
pub use machines::{MachineSet, MachineSetLoader};

/// Builds the cached value for one module root. Runs on a blocking thread.
pub type BuildFn<T> = Arc<dyn Fn(ModuleRoot) -> Result<T> + Send + Sync>;

type BuildSlot<T> = Option<Result<Arc<T>>>;

enum CacheEntry<T> {
    Building(watch::Receiver<BuildSlot<T>>),
    Ready(Arc<T>),
}

type EntryMap<T> = Arc<Mutex<HashMap<ModuleRoot, CacheEntry<T>>>>;

#[derive(Default)]
struct Counters {
    hits: AtomicUsize,
    joins: AtomicUsize,
    builds: AtomicUsize,
    failures: AtomicUsize,
}

/// Runtime statistics for a [`MachineLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderStats {
    /// Requests answered from a ready entry.
    pub hits: usize,
    /// Requests that joined an in-flight build.
    pub joins: usize,
    /// Builds started.
    pub builds: usize,
    /// Builds that failed.
    pub failures: usize,
    /// Ready entries.
    pub cached_count: usize,
}

pub struct MachineLoader<T> {
    entries: EntryMap<T>,
    build: BuildFn<T>,
    counters: Arc<Counters>,
}

impl<T: Send + Sync + 'static> MachineLoader<T> {
    pub fn new(build: BuildFn<T>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            build,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Return the value for `module_root`, building it if nobody has yet.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn get_machine(&self, module_root: ModuleRoot) -> Result<Arc<T>> {
        let (mut receiver, builder) = {
            let mut entries = self.entries.lock();
            match entries.get(&module_root) {
                Some(CacheEntry::Ready(value)) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(value));
                }
                Some(CacheEntry::Building(receiver)) => {
                    self.counters.joins.fetch_add(1, Ordering::Relaxed);
                    debug!(%module_root, "Joining in-flight machine build");
                    (receiver.clone(), None)
                }
                None => {
                    let (sender, receiver) = watch::channel(None);
                    entries.insert(module_root, CacheEntry::Building(receiver.clone()));
                    self.counters.builds.fetch_add(1, Ordering::Relaxed);
                    (receiver, Some(sender))
                }
            }
        };
        // Spawned with the map unlocked: a failed spawn drops the build guard,
        // which takes the lock to clear the marker.
        if let Some(sender) = builder {
            self.spawn_build(module_root, sender);
        }

        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(ValidatorError::build_failed(module_root, "machine build aborted"))
        })
    }

    fn spawn_build(&self, module_root: ModuleRoot, sender: watch::Sender<BuildSlot<T>>) {
        let build = Arc::clone(&self.build);
        let counters = Arc::clone(&self.counters);
        let mut guard = BuildGuard {
            entries: Arc::clone(&self.entries),
            module_root,
            settled: false,
        };

        tokio::task::spawn_blocking(move || {
            info!(%module_root, "Building machines");
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| build(module_root)))
                .unwrap_or_else(|_| {
                    Err(ValidatorError::build_failed(module_root, "machine build panicked"))
                })
                .map(Arc::new);

            {
                let mut entries = guard.entries.lock();
                match &outcome {
                    Ok(value) => {
                        entries.insert(module_root, CacheEntry::Ready(Arc::clone(value)));
                        info!(%module_root, "Machines ready");
                    }
                    Err(e) => {
                        entries.remove(&module_root);
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(%module_root, "Machine build failed: {}", e);
                    }
                }
                guard.settled = true;
            }
            // Joiners may already be gone; the cache entry is what matters.
            let _ = sender.send(Some(outcome));
        });
    }

    /// The cached value, if its build has already completed.
    pub fn get_if_ready(&self, module_root: ModuleRoot) -> Option<Arc<T>> {
        match self.entries.lock().get(&module_root) {
            Some(CacheEntry::Ready(value)) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    pub fn is_building(&self, module_root: ModuleRoot) -> bool {
        matches!(
            self.entries.lock().get(&module_root),
            Some(CacheEntry::Building(_))
        )
    }

    /// Module roots with a ready entry.
    pub fn cached_roots(&self) -> Vec<ModuleRoot> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| matches!(entry, CacheEntry::Ready(_)))
            .map(|(root, _)| *root)
            .collect()
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            joins: self.counters.joins.load(Ordering::Relaxed),
            builds: self.counters.builds.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            cached_count: self.cached_roots().len(),
        }
    }
}

/// Clears the building marker if a build task is dropped before it settles
/// (for example when the runtime shuts down with the task still queued).
struct BuildGuard<T> {
    entries: EntryMap<T>,
    module_root: ModuleRoot,
    settled: bool,
}

impl<T> Drop for BuildGuard<T> {
    fn drop(&mut self) {
        if !self.settled {
            let mut entries = self.entries.lock();
            if matches!(entries.get(&self.module_root), Some(CacheEntry::Building(_))) {
                entries.remove(&self.module_root);
            }
        }
    }
}
