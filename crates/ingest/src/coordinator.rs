// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-facing entry point that owns every other component.
//!
//! Entries go to the first hot connection. When no connection takes an entry it is
//! spilled to the overflow cache, and a background drain task redelivers the cache
//! in FIFO order once a connection is hot again. Each destination has its own
//! maintenance task that dials, reads confirmations, detects stuck connections and
//! requeues unconfirmed entries when its connection dies. Delivery is at-least-once:
//! a requeued entry may already have reached the collector.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::OverflowCache;
use crate::config::Config;
use crate::confirm::SendId;
use crate::constants::{
    CONFIRM_CHECK_INTERVAL, DRAIN_INTERVAL, RECONNECT_BACKOFF_MAX, RECONNECT_BACKOFF_MIN,
    SYNC_POLL_INTERVAL,
};
use crate::entry::{Entry, EntryTag};
use crate::errors::{CacheError, ConfigError, IngestError, TransportError};
use crate::processor::{Processor, ProcessorSet, RuleProcessor};
use crate::rate_limiter::{RateLimiter, ThrottledTransport};
use crate::registry::{ConnectionRegistry, ConnectionSlot};
use crate::stats::{Stats, StatsSnapshot};
use crate::tags::Tagger;
use crate::transport::{AckSource, Connection, Dialer, TcpDialer, Transport};

const ACK_CHANNEL_SIZE: usize = 1024;

pub struct Coordinator {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    tagger: Tagger,
    limiter: Option<RateLimiter>,
    write_timeout: Option<Duration>,
    confirm_timeout: Duration,
    registry: ConnectionRegistry,
    cache: Option<Mutex<Option<OverflowCache>>>,
    // entries handed back by a dead connection that the cache could not take,
    // or redeliveries that found no room; drained before the cache
    retry: Mutex<VecDeque<Arc<Entry>>>,
    // held while an entry is between the backlog and a tracker, and while a dead
    // connection's window is moved back into the retry queue
    redelivery: tokio::sync::Mutex<()>,
    processors: tokio::sync::Mutex<ProcessorSet>,
    cancel: CancellationToken,
    backlog: Notify,
    stats: Stats,
    closed: AtomicBool,
}

impl Coordinator {
    /// Builds the pipeline and starts one maintenance task per dialer plus the
    /// drain task. Must be called from within a tokio runtime.
    pub fn new(config: &Config, dialers: Vec<Box<dyn Dialer>>) -> Result<Self, IngestError> {
        if config.max_unconfirmed == 0 {
            return Err(ConfigError::Invalid(
                "max_unconfirmed must be greater than zero".to_string(),
            )
            .into());
        }
        let tagger = Tagger::new(&config.tags)?;
        let limiter = config
            .rate_limit_bytes()?
            .map(|rate| RateLimiter::new(rate, config.rate_burst_multiplier))
            .transpose()
            .map_err(ConfigError::from)?;

        if config.cache_enabled && config.cache_path.is_none() {
            return Err(ConfigError::Invalid(
                "cache is enabled but no cache path is set".to_string(),
            )
            .into());
        }
        let cache = config
            .cache_config()
            .map(OverflowCache::open)
            .transpose()?
            .map(|cache| Mutex::new(Some(cache)));

        let mut processors = ProcessorSet::new();
        if !config.processor_rules.is_empty() {
            let mut rules = RuleProcessor::new();
            rules.load_config(&config.processor_rules)?;
            processors.push(Box::new(rules));
        }

        let inner = Arc::new(Inner {
            tagger,
            limiter,
            write_timeout: config.write_timeout(),
            confirm_timeout: config.confirm_timeout(),
            registry: ConnectionRegistry::new(),
            cache,
            retry: Mutex::new(VecDeque::new()),
            redelivery: tokio::sync::Mutex::new(()),
            processors: tokio::sync::Mutex::new(processors),
            cancel: CancellationToken::new(),
            backlog: Notify::new(),
            stats: Stats::new(),
            closed: AtomicBool::new(false),
        });

        let mut tasks = Vec::with_capacity(dialers.len() + 1);
        for dialer in dialers {
            let slot = inner.registry.register(dialer.name(), config.max_unconfirmed);
            debug!(
                "INGEST | registered destination {} as connection {}",
                slot.name(),
                slot.handle()
            );
            tasks.push(tokio::spawn(Arc::clone(&inner).maintain(slot, dialer)));
        }
        tasks.push(tokio::spawn(Arc::clone(&inner).drain_loop()));

        info!(
            "INGEST | coordinator started with {} destinations, rate limit {}, cache {}",
            tasks.len() - 1,
            inner
                .limiter
                .as_ref()
                .map_or_else(|| "none".to_string(), |l| format!("{} B/s", l.rate())),
            if inner.cache.is_some() { "enabled" } else { "disabled" },
        );

        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    /// Validates `config` and dials every configured destination over TCP.
    pub fn connect_tcp(config: &Config) -> Result<Self, IngestError> {
        config.validate()?;
        let dialers = config
            .destinations
            .iter()
            .map(|addr| Box::new(TcpDialer::new(addr.as_str())) as Box<dyn Dialer>)
            .collect();
        Self::new(config, dialers)
    }

    /// Resolves a configured tag name to its identifier. Names no pattern allows
    /// are rejected.
    pub fn get_tag(&self, name: &str) -> Result<EntryTag, IngestError> {
        Ok(self.inner.tagger.negotiate_allowed(name)?)
    }

    #[must_use]
    pub fn tagger(&self) -> &Tagger {
        &self.inner.tagger
    }

    /// Accepts one entry. `Ok` means it was written to a connection or persisted in
    /// the overflow cache.
    pub async fn write_entry(&self, entry: Entry) -> Result<(), IngestError> {
        self.ensure_open()?;
        for entry in self.process(vec![entry]).await? {
            self.inner.deliver(entry).await?;
        }
        Ok(())
    }

    /// Accepts a batch. Tags are checked for the whole batch before anything is
    /// delivered; a later failure leaves the entries before it accepted.
    pub async fn write_batch(&self, entries: Vec<Entry>) -> Result<(), IngestError> {
        self.ensure_open()?;
        if let Some(entry) = entries.iter().find(|e| !self.inner.tagger.allowed(e.tag)) {
            return Err(IngestError::TagNotPermitted(entry.tag));
        }
        for entry in self.process(entries).await? {
            self.inner.deliver(entry).await?;
        }
        Ok(())
    }

    /// Appends a processor to the chain run on every write.
    pub async fn add_processor(
        &self,
        mut processor: Box<dyn Processor>,
        vars: &HashMap<String, String>,
    ) -> Result<(), IngestError> {
        processor.load_config(vars)?;
        self.inner.processors.lock().await.push(processor);
        Ok(())
    }

    /// Waits until at least one connection is hot.
    pub async fn wait_for_hot(&self, timeout: Duration) -> Result<(), IngestError> {
        let mut hot = self.inner.registry.subscribe();
        let result = match tokio::time::timeout(timeout, hot.wait_for(|count| *count > 0)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(IngestError::Closed),
            Err(_) => Err(IngestError::Timeout("a hot connection")),
        };
        result
    }

    /// Flushes processors and waits until the overflow backlog is redelivered and
    /// every send is confirmed, then syncs the cache file.
    pub async fn sync(&self, timeout: Duration) -> Result<(), IngestError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;

        let flushed = self.inner.processors.lock().await.flush().await?;
        for entry in flushed {
            self.inner.deliver(entry).await?;
        }
        self.inner.backlog.notify_one();

        loop {
            let (backlog_empty, unconfirmed) =
                tokio::time::timeout_at(deadline, self.inner.pending())
                    .await
                    .map_err(|_| IngestError::Timeout("the overflow backlog to drain"))?;
            if backlog_empty && unconfirmed == 0 {
                break;
            }
            if backlog_empty {
                for slot in self.inner.registry.slots() {
                    tokio::time::timeout_at(deadline, slot.tracker().wait_empty())
                        .await
                        .map_err(|_| IngestError::Timeout("unconfirmed entries"))?;
                }
            } else if Instant::now() >= deadline {
                return Err(IngestError::Timeout("the overflow backlog to drain"));
            } else {
                tokio::time::sleep_until((Instant::now() + SYNC_POLL_INTERVAL).min(deadline))
                    .await;
            }
        }

        if let Some(cache) = &self.inner.cache {
            if let Some(cache) = lock(cache).as_mut() {
                cache.sync()?;
            }
        }
        Ok(())
    }

    /// Stops every background task and persists whatever was not delivered.
    ///
    /// Unconfirmed sends are requeued, so entries still awaiting confirmation are
    /// persisted even if the collector received them; call [`Coordinator::sync`]
    /// first to avoid duplicates. Without a cache, entries that could not be
    /// delivered are counted in [`IngestError::Undelivered`].
    pub async fn close(&self) -> Result<(), IngestError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("INGEST | closing coordinator");

        let flushed = self.inner.processors.lock().await.flush().await;
        match flushed {
            Ok(flushed) => {
                for entry in flushed {
                    if let Err(e) = self.inner.deliver(entry).await {
                        warn!("INGEST | dropping flushed entry during close: {e}");
                    }
                }
            }
            Err(e) => warn!("INGEST | processor flush failed during close: {e}"),
        }

        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                error!("INGEST | background task failed: {e}");
            }
        }

        // the retry queue is older than anything still in the cache
        let leftover: Vec<Arc<Entry>> = lock(&self.inner.retry).drain(..).collect();
        let cache = self.inner.cache.as_ref().and_then(|cache| lock(cache).take());
        match cache {
            Some(mut cache) => {
                for entry in leftover.iter().rev() {
                    cache.push_front(entry);
                }
                cache.close()?;
                Ok(())
            }
            None if leftover.is_empty() => Ok(()),
            None => Err(IngestError::Undelivered(leftover.len())),
        }
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    #[must_use]
    pub fn hot_connections(&self) -> usize {
        self.inner.registry.hot_count()
    }

    /// Sends awaiting confirmation across every connection.
    #[must_use]
    pub fn unconfirmed(&self) -> usize {
        self.inner.registry.unconfirmed()
    }

    fn ensure_open(&self) -> Result<(), IngestError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(IngestError::Closed);
        }
        Ok(())
    }

    async fn process(&self, entries: Vec<Entry>) -> Result<Vec<Entry>, IngestError> {
        let mut processors = self.inner.processors.lock().await;
        if processors.is_empty() {
            return Ok(entries);
        }
        let submitted = entries.len();
        let processed = processors.process(entries).await?;
        drop(processors);
        self.inner
            .stats
            .record_dropped(submitted.saturating_sub(processed.len()));
        Ok(processed)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    async fn deliver(&self, entry: Entry) -> Result<(), IngestError> {
        if !self.tagger.allowed(entry.tag) {
            return Err(IngestError::TagNotPermitted(entry.tag));
        }
        match self.send_hot(Arc::new(entry)).await {
            Ok(()) => Ok(()),
            Err((entry, error)) => self.spill(&entry, error),
        }
    }

    /// Offers `entry` to each hot connection in registration order.
    async fn send_hot(&self, mut entry: Arc<Entry>) -> Result<(), (Arc<Entry>, IngestError)> {
        let mut last = IngestError::NotHot;
        for slot in self.registry.hot_slots() {
            match slot.send(entry).await {
                Ok(written) => {
                    self.stats.record_written(written);
                    return Ok(());
                }
                Err(failure) => {
                    if failure.recycle {
                        warn!(
                            "INGEST | write to {} failed, recycling connection: {}",
                            slot.name(),
                            failure.error
                        );
                    }
                    entry = failure.entry;
                    last = failure.error;
                }
            }
        }
        Err((entry, last))
    }

    fn spill(&self, entry: &Entry, error: IngestError) -> Result<(), IngestError> {
        let Some(cache) = &self.cache else {
            return Err(error);
        };
        lock(cache)
            .as_mut()
            .ok_or(CacheError::Closed)?
            .push(entry)?;
        debug!("INGEST | cached entry after delivery failure: {error}");
        self.stats.record_cached();
        self.backlog.notify_one();
        Ok(())
    }

    /// Moves a dead connection's unconfirmed entries, in send order, ahead of
    /// everything else waiting for redelivery.
    async fn requeue(&self, slot: &ConnectionSlot) {
        let _redelivery = self.redelivery.lock().await;
        let entries = slot.tracker().drain();
        if entries.is_empty() {
            return;
        }
        info!(
            "INGEST | requeueing {} unconfirmed entries from {}",
            entries.len(),
            slot.name()
        );
        self.stats.record_requeued(entries.len());
        {
            let mut retry = lock(&self.retry);
            for entry in entries.into_iter().rev() {
                retry.push_front(entry);
            }
        }
        self.backlog.notify_one();
    }

    /// Whether the backlog is empty, and how many sends await confirmation. No
    /// redelivery is in flight while this is evaluated.
    async fn pending(&self) -> (bool, usize) {
        let _redelivery = self.redelivery.lock().await;
        (self.backlog_is_empty(), self.registry.unconfirmed())
    }

    fn backlog_is_empty(&self) -> bool {
        if !lock(&self.retry).is_empty() {
            return false;
        }
        self.cache
            .as_ref()
            .map_or(true, |cache| lock(cache).as_ref().map_or(true, OverflowCache::is_empty))
    }

    fn next_backlog(&self) -> Result<Option<Arc<Entry>>, CacheError> {
        if let Some(entry) = lock(&self.retry).pop_front() {
            return Ok(Some(entry));
        }
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        match lock(cache).as_mut() {
            Some(cache) => Ok(cache.pop()?.map(Arc::new)),
            None => Ok(None),
        }
    }

    /// Redelivers the backlog while a connection is hot, stopping at the first
    /// entry no connection takes.
    async fn drain_backlog(&self) {
        while self.registry.hot_count() > 0 && !self.cancel.is_cancelled() {
            let _redelivery = self.redelivery.lock().await;
            let entry = match self.next_backlog() {
                Ok(Some(entry)) => entry,
                Ok(None) => return,
                Err(e) => {
                    error!("INGEST | unable to read overflow cache: {e}");
                    return;
                }
            };
            if let Err((entry, error)) = self.send_hot(entry).await {
                debug!("INGEST | redelivery paused: {error}");
                lock(&self.retry).push_front(entry);
                return;
            }
        }
    }

    async fn drain_loop(self: Arc<Self>) {
        let mut hot = self.registry.subscribe();
        let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.backlog.notified() => {}
                changed = hot.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            self.drain_backlog().await;
        }
        debug!("INGEST | drain task stopped");
    }

    /// Keeps one destination connected until the coordinator is cancelled.
    async fn maintain(self: Arc<Self>, slot: Arc<ConnectionSlot>, dialer: Box<dyn Dialer>) {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        let mut connected_before = false;
        while !self.cancel.is_cancelled() {
            let dialed = tokio::select! {
                () = self.cancel.cancelled() => break,
                dialed = dialer.dial() => dialed,
            };
            let pause = match dialed {
                Ok(connection) => {
                    if connected_before {
                        self.stats.record_reconnect();
                    }
                    connected_before = true;
                    backoff = RECONNECT_BACKOFF_MIN;
                    self.run_connection(&slot, connection).await;
                    self.retire(&slot).await;
                    RECONNECT_BACKOFF_MIN
                }
                Err(e) => {
                    warn!(
                        "INGEST | unable to connect to {}: {e}, retrying in {backoff:?}",
                        dialer.name()
                    );
                    let pause = backoff;
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                    pause
                }
            };
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }
        debug!("INGEST | maintenance for {} stopped", slot.name());
    }

    /// Serves one live connection until it fails, stalls or the coordinator stops.
    async fn run_connection(&self, slot: &ConnectionSlot, connection: Connection) {
        let Connection { transport, acks } = connection;
        let failed = self.cancel.child_token();
        let transport = match &self.limiter {
            Some(limiter) => limiter.wrap(transport),
            None => ThrottledTransport::unthrottled(transport),
        }
        .with_write_timeout(self.write_timeout)
        .with_cancel(failed.clone());

        slot.attach(transport, failed.clone()).await;
        self.registry.set_hot(slot, true);
        info!("INGEST | connection to {} is hot", slot.name());

        let (ack_tx, mut ack_rx) = mpsc::channel(ACK_CHANNEL_SIZE);
        let reader = tokio::spawn(read_acks(acks, ack_tx));
        let mut check = tokio::time::interval(CONFIRM_CHECK_INTERVAL);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = failed.cancelled() => {
                    debug!("INGEST | connection to {} flagged for teardown", slot.name());
                    break;
                }
                ack = ack_rx.recv() => match ack {
                    Some(Ok(id)) => self.confirm(slot, id),
                    Some(Err(e)) => {
                        warn!("INGEST | lost connection to {}: {e}", slot.name());
                        break;
                    }
                    None => {
                        info!("INGEST | {} closed the connection", slot.name());
                        break;
                    }
                },
                _ = check.tick() => {
                    if let Some(age) = slot.tracker().oldest_pending_age() {
                        if age > self.confirm_timeout {
                            warn!(
                                "INGEST | {} has not confirmed a send for {age:?}, reconnecting",
                                slot.name()
                            );
                            break;
                        }
                    }
                }
            }
        }
        reader.abort();
    }

    fn confirm(&self, slot: &ConnectionSlot, id: SendId) {
        match slot.tracker().confirm(id) {
            Ok(()) => {
                self.stats.record_confirmed();
                self.backlog.notify_one();
            }
            Err(e) => warn!("INGEST | {}: {e}", slot.name()),
        }
    }

    /// Tears down the slot's connection and requeues everything it left unconfirmed.
    async fn retire(&self, slot: &ConnectionSlot) {
        slot.fail();
        self.registry.set_hot(slot, false);
        if let Some(mut transport) = slot.detach().await {
            if let Err(e) = transport.close().await {
                debug!("INGEST | error closing connection to {}: {e}", slot.name());
            }
        }
        self.requeue(slot).await;
    }
}

async fn read_acks(
    mut acks: Box<dyn AckSource>,
    tx: mpsc::Sender<Result<SendId, TransportError>>,
) {
    loop {
        match acks.next().await {
            Ok(Some(id)) => {
                if tx.send(Ok(id)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TagError;
    use tracing_test::traced_test;

    fn config(tags: &[&str]) -> Config {
        Config {
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            ..Config::default()
        }
    }

    fn cached_config(tags: &[&str], dir: &tempfile::TempDir) -> Config {
        Config {
            cache_enabled: true,
            cache_path: Some(dir.path().join("overflow.cache")),
            cache_memory_entries: 2,
            ..config(tags)
        }
    }

    #[tokio::test]
    async fn test_rejects_unpermitted_tag() {
        let coordinator = Coordinator::new(&config(&["app-*"]), Vec::new()).expect("coordinator");
        let denied = coordinator.tagger().negotiate("other").expect("negotiate");
        let err = coordinator
            .write_entry(Entry::new(denied, b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::TagNotPermitted(tag) if tag == denied));
    }

    #[tokio::test]
    async fn test_get_tag_only_resolves_allowed_names() {
        let coordinator = Coordinator::new(&config(&["app-*"]), Vec::new()).expect("coordinator");
        let tag = coordinator.get_tag("app-web").expect("allowed");
        assert_eq!(coordinator.get_tag("app-web").expect("allowed"), tag);
        assert!(coordinator.tagger().allowed(tag));
        assert!(matches!(
            coordinator.get_tag("db"),
            Err(IngestError::Tag(TagError::NotAllowed(_)))
        ));
    }

    #[tokio::test]
    async fn test_no_connection_and_no_cache_is_not_hot() {
        let coordinator = Coordinator::new(&config(&["app"]), Vec::new()).expect("coordinator");
        let tag = coordinator.get_tag("app").expect("tag");
        let err = coordinator
            .write_entry(Entry::new(tag, b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(coordinator.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_spills_to_cache_without_connection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let coordinator =
            Coordinator::new(&cached_config(&["app"], &dir), Vec::new()).expect("coordinator");
        let tag = coordinator.get_tag("app").expect("tag");
        for i in 0..5u8 {
            coordinator
                .write_entry(Entry::new(tag, vec![i]))
                .await
                .expect("cached");
        }
        assert_eq!(coordinator.stats().entries_cached, 5);
        assert!(matches!(
            coordinator.sync(Duration::from_millis(50)).await,
            Err(IngestError::Timeout(_))
        ));
        coordinator.close().await.expect("close");

        let mut cache = OverflowCache::open(
            cached_config(&["app"], &dir)
                .cache_config()
                .expect("cache config"),
        )
        .expect("reopen");
        let mut order = Vec::new();
        while let Some(entry) = cache.pop().expect("pop") {
            order.push(entry.data[0]);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_write_batch_checks_every_tag_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let coordinator =
            Coordinator::new(&cached_config(&["app"], &dir), Vec::new()).expect("coordinator");
        let allowed = coordinator.get_tag("app").expect("tag");
        let denied = coordinator.tagger().negotiate("nope").expect("negotiate");

        let err = coordinator
            .write_batch(vec![
                Entry::new(allowed, b"a".to_vec()),
                Entry::new(denied, b"b".to_vec()),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::TagNotPermitted(_)));
        assert_eq!(coordinator.stats().entries_cached, 0);
    }

    #[tokio::test]
    async fn test_rule_processor_filters_before_delivery() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = cached_config(&["app"], &dir);
        config
            .processor_rules
            .insert("exclude_at_match".to_string(), "healthcheck".to_string());
        let coordinator = Coordinator::new(&config, Vec::new()).expect("coordinator");
        let tag = coordinator.get_tag("app").expect("tag");

        coordinator
            .write_entry(Entry::new(tag, b"GET /healthcheck".to_vec()))
            .await
            .expect("filtered");
        coordinator
            .write_entry(Entry::new(tag, b"GET /orders".to_vec()))
            .await
            .expect("cached");
        let stats = coordinator.stats();
        assert_eq!(stats.entries_dropped, 1);
        assert_eq!(stats.entries_cached, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_hot_times_out() {
        let coordinator = Coordinator::new(&config(&[]), Vec::new()).expect("coordinator");
        assert_eq!(coordinator.hot_connections(), 0);
        assert!(matches!(
            coordinator.wait_for_hot(Duration::from_secs(1)).await,
            Err(IngestError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_coordinator_rejects_writes() {
        let coordinator = Coordinator::new(&config(&["app"]), Vec::new()).expect("coordinator");
        coordinator.close().await.expect("close");
        coordinator.close().await.expect("close is idempotent");
        let tag = coordinator.get_tag("app").expect("tag");
        assert!(matches!(
            coordinator.write_entry(Entry::new(tag, b"x".to_vec())).await,
            Err(IngestError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_rejects_invalid_configuration() {
        let bad_pattern = config(&["a*b*"]);
        assert!(matches!(
            Coordinator::new(&bad_pattern, Vec::new()),
            Err(IngestError::Tag(TagError::InvalidPattern { .. }))
        ));

        let no_path = Config {
            cache_enabled: true,
            ..Config::default()
        };
        assert!(matches!(
            Coordinator::new(&no_path, Vec::new()),
            Err(IngestError::Config(ConfigError::Invalid(_)))
        ));

        let zero_rate = Config {
            rate_limit: Some("0".to_string()),
            ..Config::default()
        };
        assert!(Coordinator::new(&zero_rate, Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_close_persists_retry_queue_ahead_of_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = cached_config(&["app"], &dir);
        let coordinator = Coordinator::new(&config, Vec::new()).expect("coordinator");
        let tag = coordinator.get_tag("app").expect("tag");
        for i in 2..5u8 {
            coordinator
                .write_entry(Entry::new(tag, vec![i]))
                .await
                .expect("cached");
        }
        // popped from the cache head earlier and handed back by a connection
        lock(&coordinator.inner.retry)
            .extend((0..2u8).map(|i| Arc::new(Entry::new(tag, vec![i]))));
        coordinator.close().await.expect("close");

        let mut cache =
            OverflowCache::open(config.cache_config().expect("cache config")).expect("reopen");
        let mut order = Vec::new();
        while let Some(entry) = cache.pop().expect("pop") {
            order.push(entry.data[0]);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_sync_waits_for_redelivery_in_flight() {
        let coordinator = Coordinator::new(&config(&["app"]), Vec::new()).expect("coordinator");
        coordinator
            .sync(Duration::from_millis(50))
            .await
            .expect("nothing pending");

        // an entry taken from the backlog that no connection has tracked yet
        let redelivery = coordinator.inner.redelivery.lock().await;
        assert!(matches!(
            coordinator.sync(Duration::from_millis(50)).await,
            Err(IngestError::Timeout(_))
        ));
        drop(redelivery);
        coordinator
            .sync(Duration::from_millis(50))
            .await
            .expect("settled");
    }

    struct RefusingDialer;

    #[async_trait::async_trait]
    impl Dialer for RefusingDialer {
        fn name(&self) -> &str {
            "refusing:1"
        }

        async fn dial(&self) -> Result<Connection, TransportError> {
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_dial_failures_are_logged_and_retried() {
        let coordinator =
            Coordinator::new(&config(&[]), vec![Box::new(RefusingDialer)]).expect("coordinator");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(logs_contain("unable to connect to refusing:1"));
        assert_eq!(coordinator.hot_connections(), 0);
        coordinator.close().await.expect("close");
    }
}
