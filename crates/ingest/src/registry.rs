// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connections owned by one coordinator, keyed by integer handle.
//!
//! Each destination gets one [`ConnectionSlot`] for the coordinator's lifetime. The
//! slot outlives the individual connections dialed into it: a connection is attached
//! when dialed, detached when it fails, and its confirmation window is drained back
//! into the coordinator before the next one is attached.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use derive_more::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::confirm::{ConfirmationTracker, SendId};
use crate::entry::Entry;
use crate::errors::{IngestError, TransportError};
use crate::rate_limiter::ThrottledTransport;
use crate::transport::encode_frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub struct ConnHandle(pub u64);

/// A send that did not reach the connection. The entry is handed back so the
/// caller can route it elsewhere.
#[derive(Debug)]
pub struct SendFailure {
    pub entry: Arc<Entry>,
    pub error: IngestError,
    /// The connection is no longer usable and has been flagged for recycling.
    pub recycle: bool,
}

pub struct ConnectionSlot {
    handle: ConnHandle,
    name: String,
    hot: AtomicBool,
    live: tokio::sync::Mutex<Option<ThrottledTransport>>,
    tracker: ConfirmationTracker,
    next_send_id: AtomicU64,
    // cancelled when the attached connection must be torn down
    failed: Mutex<CancellationToken>,
}

impl ConnectionSlot {
    #[must_use]
    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_hot(&self) -> bool {
        self.hot.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn tracker(&self) -> &ConfirmationTracker {
        &self.tracker
    }

    /// Installs a freshly dialed connection. `failed` is cancelled when the
    /// connection fails a write or is otherwise flagged for teardown.
    pub async fn attach(&self, transport: ThrottledTransport, failed: CancellationToken) {
        *self.failed.lock().unwrap_or_else(PoisonError::into_inner) = failed;
        *self.live.lock().await = Some(transport);
    }

    /// Removes the current connection, waiting for any in-flight write to finish.
    pub async fn detach(&self) -> Option<ThrottledTransport> {
        self.live.lock().await.take()
    }

    /// Flags the attached connection for teardown.
    pub fn fail(&self) {
        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Writes `entry` as one frame and registers it as pending. A connection-level
    /// failure flags the slot; capacity and deadline failures before any byte is
    /// written leave the connection usable.
    pub async fn send(&self, entry: Arc<Entry>) -> Result<usize, SendFailure> {
        let mut live = self.live.lock().await;
        let Some(transport) = live.as_mut() else {
            return Err(SendFailure {
                entry,
                error: IngestError::NotHot,
                recycle: false,
            });
        };

        let id: SendId = self.next_send_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tracker.add(id, Arc::clone(&entry)) {
            return Err(SendFailure {
                entry,
                error: e.into(),
                recycle: false,
            });
        }

        let mut frame = Vec::new();
        encode_frame(id, &entry, &mut frame);
        match transport.write_all(&frame).await {
            Ok(written) => Ok(written),
            Err(error) => {
                self.tracker.take(id);
                let recycle = !matches!(error, TransportError::Timeout { written: 0 });
                if recycle {
                    self.fail();
                }
                Err(SendFailure {
                    entry,
                    error: error.into(),
                    recycle,
                })
            }
        }
    }
}

/// Connection slots in registration order; the first hot slot is preferred.
pub struct ConnectionRegistry {
    next_handle: AtomicU64,
    slots: RwLock<Vec<Arc<ConnectionSlot>>>,
    hot: watch::Sender<usize>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (hot, _) = watch::channel(0);
        Self {
            next_handle: AtomicU64::new(1),
            slots: RwLock::new(Vec::new()),
            hot,
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        max_unconfirmed: usize,
    ) -> Arc<ConnectionSlot> {
        let slot = Arc::new(ConnectionSlot {
            handle: ConnHandle(self.next_handle.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            hot: AtomicBool::new(false),
            live: tokio::sync::Mutex::new(None),
            tracker: ConfirmationTracker::new(max_unconfirmed),
            next_send_id: AtomicU64::new(1),
            failed: Mutex::new(CancellationToken::new()),
        });
        self.write_slots().push(Arc::clone(&slot));
        slot
    }

    pub fn remove(&self, handle: ConnHandle) -> Option<Arc<ConnectionSlot>> {
        let removed = {
            let mut slots = self.write_slots();
            let idx = slots.iter().position(|s| s.handle == handle)?;
            slots.remove(idx)
        };
        self.publish_hot();
        Some(removed)
    }

    #[must_use]
    pub fn get(&self, handle: ConnHandle) -> Option<Arc<ConnectionSlot>> {
        self.read_slots()
            .iter()
            .find(|s| s.handle == handle)
            .cloned()
    }

    #[must_use]
    pub fn slots(&self) -> Vec<Arc<ConnectionSlot>> {
        self.read_slots().clone()
    }

    #[must_use]
    pub fn hot_slots(&self) -> Vec<Arc<ConnectionSlot>> {
        self.read_slots()
            .iter()
            .filter(|s| s.is_hot())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn hot_count(&self) -> usize {
        *self.hot.borrow()
    }

    /// Watches the number of hot connections.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.hot.subscribe()
    }

    pub fn set_hot(&self, slot: &ConnectionSlot, hot: bool) {
        slot.hot.store(hot, Ordering::Release);
        self.publish_hot();
    }

    /// Sends still awaiting confirmation across every slot.
    #[must_use]
    pub fn unconfirmed(&self) -> usize {
        self.read_slots().iter().map(|s| s.tracker.pending()).sum()
    }

    fn publish_hot(&self) {
        // counted under the watch lock so concurrent updates publish in order
        self.hot.send_if_modified(|current| {
            let count = self.read_slots().iter().filter(|s| s.is_hot()).count();
            let changed = *current != count;
            *current = count;
            changed
        });
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<ConnectionSlot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<ConnectionSlot>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}
