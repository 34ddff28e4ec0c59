// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded window of sends awaiting acknowledgment from the remote side.
//!
//! Each pending send moves `sent -> confirmed` exactly once. Confirmations may
//! arrive in any order. Retransmission is left to the coordinator, which uses
//! [`ConfirmationTracker::oldest_pending_age`] as its trigger and
//! [`ConfirmationTracker::drain`] to recover unconfirmed entries.

use std::hash::BuildHasherDefault;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fnv::FnvHasher;
use hashbrown::HashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::entry::Entry;
use crate::errors::ConfirmError;

/// Per-connection, monotonically increasing send identifier.
pub type SendId = u64;

#[derive(Debug)]
struct PendingSend {
    entry: Arc<Entry>,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct ConfirmationTracker {
    capacity: usize,
    pending: Mutex<HashMap<SendId, PendingSend, BuildHasherDefault<FnvHasher>>>,
    emptied: Notify,
}

impl ConfirmationTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            pending: Mutex::new(HashMap::with_capacity_and_hasher(
                capacity,
                BuildHasherDefault::default(),
            )),
            emptied: Notify::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of sends awaiting confirmation.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pending() >= self.capacity
    }

    /// Registers `entry` as sent under `id`. Fails fast, leaving state untouched,
    /// when the window is full or `id` is already pending.
    pub fn add(&self, id: SendId, entry: Arc<Entry>) -> Result<(), ConfirmError> {
        let mut pending = self.lock();
        if pending.len() >= self.capacity {
            return Err(ConfirmError::Full {
                capacity: self.capacity,
            });
        }
        if pending.contains_key(&id) {
            return Err(ConfirmError::Duplicate(id));
        }
        pending.insert(
            id,
            PendingSend {
                entry,
                sent_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Marks `id` confirmed and forgets it.
    pub fn confirm(&self, id: SendId) -> Result<(), ConfirmError> {
        self.take(id).map(|_| ()).ok_or(ConfirmError::Unknown(id))
    }

    /// Removes `id` without confirming it, handing back its entry.
    pub fn take(&self, id: SendId) -> Option<Arc<Entry>> {
        let mut pending = self.lock();
        let removed = pending.remove(&id)?;
        if pending.is_empty() {
            self.emptied.notify_waiters();
        }
        Some(removed.entry)
    }

    /// Age of the longest-waiting send, if any.
    #[must_use]
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .values()
            .map(|p| now.saturating_duration_since(p.sent_at))
            .max()
    }

    /// Removes every pending send, returning the entries in send order.
    pub fn drain(&self) -> Vec<Arc<Entry>> {
        let mut pending = self.lock();
        let mut drained: Vec<(SendId, Arc<Entry>)> =
            pending.drain().map(|(id, p)| (id, p.entry)).collect();
        drop(pending);
        self.emptied.notify_waiters();
        drained.sort_unstable_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Resolves once nothing is pending.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SendId, PendingSend, BuildHasherDefault<FnvHasher>>>
    {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
