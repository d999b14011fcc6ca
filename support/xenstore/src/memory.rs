// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process store with xenstored watch semantics.

use crate::watch_matches;
use crate::Error;
use crate::Store;
use crate::WatchEvent;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::os::fd::BorrowedFd;
use std::sync::Arc;

/// An in-memory [`Store`].
///
/// Clones share the same keys, so a test can hand one clone to a backend
/// and use another to drive and inspect it. Watch events are delivered to
/// the clone that registered the watch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
    client: usize,
}

#[derive(Debug, Default)]
struct Shared {
    keys: BTreeMap<String, String>,
    watches: Vec<Watch>,
    pending: BTreeMap<usize, VecDeque<WatchEvent>>,
    next_client: usize,
    fail_reads: bool,
    fail_watches: bool,
}

#[derive(Debug)]
struct Watch {
    client: usize,
    path: String,
    token: String,
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        let client = {
            let mut shared = self.shared.lock();
            shared.next_client += 1;
            shared.next_client
        };
        Self {
            shared: self.shared.clone(),
            client,
        }
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value at `path`, if any, without going through [`Store`].
    pub fn get(&self, path: &str) -> Option<String> {
        self.shared.lock().keys.get(path).cloned()
    }

    /// Returns the `(path, token)` pairs of every registered watch.
    pub fn watches(&self) -> Vec<(String, String)> {
        self.shared
            .lock()
            .watches
            .iter()
            .map(|w| (w.path.clone(), w.token.clone()))
            .collect()
    }

    /// Removes `path` and its children without firing watches.
    pub fn remove(&self, path: &str) {
        self.shared
            .lock()
            .keys
            .retain(|key, _| !watch_matches(path, key));
    }

    /// Makes every subsequent read fail, to exercise error paths.
    pub fn set_fail_reads(&self, fail: bool) {
        self.shared.lock().fail_reads = fail;
    }

    /// Makes every subsequent watch registration fail.
    pub fn set_fail_watches(&self, fail: bool) {
        self.shared.lock().fail_watches = fail;
    }
}

impl Shared {
    fn notify(&mut self, changed: &str) {
        let events: Vec<_> = self
            .watches
            .iter()
            .filter(|w| watch_matches(&w.path, changed))
            .map(|w| {
                (
                    w.client,
                    WatchEvent {
                        path: changed.to_owned(),
                        token: w.token.clone(),
                    },
                )
            })
            .collect();
        for (client, event) in events {
            self.pending.entry(client).or_default().push_back(event);
        }
    }
}

impl Store for MemoryStore {
    fn read(&mut self, path: &str) -> Result<String, Error> {
        let shared = self.shared.lock();
        if shared.fail_reads {
            return Err(Error::Daemon("EIO".into()));
        }
        shared
            .keys
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_owned()))
    }

    fn write(&mut self, path: &str, value: &str) -> Result<(), Error> {
        let mut shared = self.shared.lock();
        shared.keys.insert(path.to_owned(), value.to_owned());
        shared.notify(path);
        Ok(())
    }

    fn directory(&mut self, path: &str) -> Result<Vec<String>, Error> {
        let shared = self.shared.lock();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut names: Vec<String> = shared
            .keys
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_owned())
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() && !shared.keys.contains_key(path) {
            return Err(Error::NotFound(path.to_owned()));
        }
        Ok(names)
    }

    fn watch(&mut self, path: &str, token: &str) -> Result<(), Error> {
        let mut shared = self.shared.lock();
        if shared.fail_watches {
            return Err(Error::Daemon("ENOSPC".into()));
        }
        shared.watches.push(Watch {
            client: self.client,
            path: path.to_owned(),
            token: token.to_owned(),
        });
        // xenstored fires every new watch once.
        shared
            .pending
            .entry(self.client)
            .or_default()
            .push_back(WatchEvent {
                path: path.to_owned(),
                token: token.to_owned(),
            });
        Ok(())
    }

    fn unwatch(&mut self, path: &str, token: &str) -> Result<(), Error> {
        let mut shared = self.shared.lock();
        let client = self.client;
        let before = shared.watches.len();
        shared
            .watches
            .retain(|w| !(w.client == client && w.path == path && w.token == token));
        if shared.watches.len() == before {
            return Err(Error::NotFound(path.to_owned()));
        }
        Ok(())
    }

    fn read_watch(&mut self) -> Result<WatchEvent, Error> {
        // There is no one to wait for in process, so an empty queue is an
        // error rather than a hang.
        self.shared
            .lock()
            .pending
            .get_mut(&self.client)
            .and_then(|queue| queue.pop_front())
            .ok_or(Error::Protocol("no watch event pending"))
    }

    fn has_pending_watch(&self) -> bool {
        self.shared
            .lock()
            .pending
            .get(&self.client)
            .is_some_and(|queue| !queue.is_empty())
    }

    fn notification_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}
