//! In-process counter store.
//!
//! Backs a single guard instance (and the test suite) without Redis.
//! Expiry uses `tokio::time::Instant` so paused test clocks apply to it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::store::{CounterConnection, Endpoint, StoreBackend, StoreResult};

#[derive(Debug, Clone, Copy)]
struct MemoryEntry {
    value: u64,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn ttl_secs(&self, now: Instant) -> i64 {
        match self.expires_at {
            None => -1,
            Some(at) => {
                let remaining = at.saturating_duration_since(now);
                // Round up so a fresh window reports its full length.
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                secs as i64
            }
        }
    }
}

/// Shared in-memory key space.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired keys until shutdown.
    pub async fn run_sweeper(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.purge_expired();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.len(), "Purged expired counters");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Memory store sweeper stopping");
                    break;
                }
            }
        }
    }

    fn live(&self, key: &str, now: Instant) -> Option<MemoryEntry> {
        let entry = *self.entries.get(key)?;
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            None
        } else {
            Some(entry)
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn resolve_endpoint(&self) -> StoreResult<Endpoint> {
        Ok(Endpoint::new("in-process", 0))
    }

    async fn connect(&self, _endpoint: &Endpoint) -> StoreResult<Box<dyn CounterConnection>> {
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
        }))
    }
}

/// Connection handle over a [`MemoryBackend`].
pub struct MemoryConnection {
    store: MemoryBackend,
}

impl MemoryConnection {
    fn bump(&self, key: &str, expiry: Option<u64>) -> (u64, i64) {
        let now = Instant::now();
        let mut entry = self.store.entries.entry(key.to_string()).or_insert(MemoryEntry {
            value: 0,
            expires_at: None,
        });
        if entry.is_expired(now) {
            *entry = MemoryEntry {
                value: 0,
                expires_at: None,
            };
        }
        entry.value = entry.value.saturating_add(1);
        if let Some(seconds) = expiry {
            if entry.value == 1 || entry.expires_at.is_none() {
                entry.expires_at = Some(now + Duration::from_secs(seconds));
            }
        }
        (entry.value, entry.ttl_secs(now))
    }
}

#[async_trait]
impl CounterConnection for MemoryConnection {
    async fn ping(&mut self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&mut self, key: &str) -> StoreResult<Option<u64>> {
        Ok(self.store.live(key, Instant::now()).map(|e| e.value))
    }

    async fn ttl(&mut self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        Ok(self.store.live(key, now).map_or(-2, |e| e.ttl_secs(now)))
    }

    async fn set_with_expiry(&mut self, key: &str, value: u64, seconds: u64) -> StoreResult<()> {
        let expires_at = Some(Instant::now() + Duration::from_secs(seconds));
        self.store
            .entries
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn incr(&mut self, key: &str) -> StoreResult<u64> {
        Ok(self.bump(key, None).0)
    }

    async fn expire(&mut self, key: &str, seconds: u64) -> StoreResult<()> {
        let now = Instant::now();
        if let Some(mut entry) = self.store.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = Some(now + Duration::from_secs(seconds));
            }
        }
        Ok(())
    }

    async fn incr_with_expiry(&mut self, key: &str, seconds: u64) -> StoreResult<(u64, i64)> {
        Ok(self.bump(key, Some(seconds)))
    }
}
