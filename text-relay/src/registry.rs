use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    connection::{ConnectionHandle, ConnectionId},
    protocol::BROADCAST_TARGET,
};

struct Entry {
    handle: Arc<ConnectionHandle>,
    username: String,
}

/// Table of live connections and their usernames, in registration order.
///
/// Every operation runs under one lock that only ever guards in-memory work:
/// callers copy out the handles they need and queue frames on them after the
/// lock is released, so a slow peer cannot stall membership changes.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the handle to `username`, replacing any earlier mapping for the
    /// same connection. Usernames are not required to be unique.
    pub fn register(&self, handle: Arc<ConnectionHandle>, username: String) {
        let mut entries = self.lock();
        match entries.iter_mut().find(|entry| entry.handle.id() == handle.id()) {
            Some(entry) => entry.username = username,
            None => entries.push(Entry { handle, username }),
        }
    }

    /// Removes the connection and returns the username it was registered
    /// under. Removing an unknown connection is a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<String> {
        let mut entries = self.lock();
        let index = entries.iter().position(|entry| entry.handle.id() == id)?;
        Some(entries.remove(index).username)
    }

    /// `"All"` followed by each distinct registered username.
    pub fn snapshot(&self) -> Vec<String> {
        snapshot_of(&self.lock())
    }

    /// First connection registered under `username`, if any.
    pub fn resolve(&self, username: &str) -> Option<Arc<ConnectionHandle>> {
        self.lock()
            .iter()
            .find(|entry| entry.username == username)
            .map(|entry| Arc::clone(&entry.handle))
    }

    /// Every registered connection other than `sender`.
    pub fn recipients_except(&self, sender: ConnectionId) -> Vec<Arc<ConnectionHandle>> {
        self.lock()
            .iter()
            .filter(|entry| entry.handle.id() != sender)
            .map(|entry| Arc::clone(&entry.handle))
            .collect()
    }

    /// Snapshot plus every handle, taken under the same lock so the list
    /// matches the set of connections it is sent to.
    pub fn membership(&self) -> (Vec<String>, Vec<Arc<ConnectionHandle>>) {
        let entries = self.lock();
        let handles = entries
            .iter()
            .map(|entry| Arc::clone(&entry.handle))
            .collect();
        (snapshot_of(&entries), handles)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Map updates are single push/remove calls, so a panic elsewhere cannot
    // leave the vector half-modified.
    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn snapshot_of(entries: &[Entry]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut names = Vec::with_capacity(entries.len() + 1);
    names.push(BROADCAST_TARGET.to_string());
    for entry in entries {
        if seen.insert(entry.username.as_str()) {
            names.push(entry.username.clone());
        }
    }
    names
}
