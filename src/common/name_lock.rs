use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
struct LockEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    refs: usize,
}

/// Mutual exclusion keyed by an arbitrary name.
///
/// Locks for distinct names are independent. Entries are refcounted and
/// reclaimed once the last guard for a name is dropped, so the registry does
/// not grow with the set of names ever locked.
#[derive(Default)]
pub struct NameLockRegistry {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl NameLockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires the lock named `name`, waiting until every earlier holder of
    /// the same name has released it.
    pub async fn lock(self: &Arc<Self>, name: &str) -> NameLockGuard {
        let lock = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(name.to_string()).or_default();
            entry.refs += 1;
            entry.lock.clone()
        };
        let guard = lock.lock_owned().await;
        NameLockGuard {
            registry: self.clone(),
            name: name.to_string(),
            guard: Some(guard),
        }
    }

    fn release(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(name) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(name);
            }
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Scoped holder of a name lock; releases on every exit path.
pub struct NameLockGuard {
    registry: Arc<NameLockRegistry>,
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NameLockGuard {
    fn drop(&mut self) {
        // The mutex must be released before the registry entry is reclaimed,
        // otherwise a late locker could create a second mutex for the same
        // name while this one is still held.
        self.guard.take();
        self.registry.release(&self.name);
    }
}
