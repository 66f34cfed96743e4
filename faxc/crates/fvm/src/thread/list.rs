//! Thread List - registry of attached mutator threads

use super::{MutatorThread, ThreadId};
use parking_lot::RwLock;
use std::sync::Arc;

/// ThreadList - all attached mutator threads
///
/// The coordinator works on snapshots; a thread attaching after a snapshot
/// was taken starts `Blocked` and observes the armed poll on its way in.
pub struct ThreadList {
    threads: RwLock<Vec<Arc<MutatorThread>>>,
}

impl ThreadList {
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, thread: Arc<MutatorThread>) {
        self.threads.write().push(thread);
    }

    /// Remove a thread, returning it if it was listed
    pub fn remove(&self, id: ThreadId) -> Option<Arc<MutatorThread>> {
        let mut threads = self.threads.write();
        let index = threads.iter().position(|t| t.id() == id)?;
        Some(threads.swap_remove(index))
    }

    pub fn find(&self, id: ThreadId) -> Option<Arc<MutatorThread>> {
        self.threads.read().iter().find(|t| t.id() == id).cloned()
    }

    /// A live thread record attached by the calling OS thread
    pub fn find_current(&self) -> Option<Arc<MutatorThread>> {
        let current = std::thread::current().id();
        self.threads
            .read()
            .iter()
            .find(|t| t.os_thread() == current && !t.is_terminated())
            .cloned()
    }

    /// Copy of the current list
    pub fn snapshot(&self) -> Vec<Arc<MutatorThread>> {
        self.threads.read().clone()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}
