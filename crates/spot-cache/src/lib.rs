//! Provider-state caches for the reconciliation controller.
//!
//! There is no durable local store: the live roster ([`InventoryCache`]) and
//! the per-instance event timelines ([`OperationLog`]) are rebuilt from the
//! provider on demand. Both follow the same discipline, enforced by
//! [`CacheGate`]:
//!
//! - lazily populated on first read
//! - never patched, only rebuilt in full or cleared in full
//! - readers get an immutable `Arc` snapshot, so a half-built map is never
//!   observable
//! - `invalidate()` after any mutating provider call forces the next read to
//!   refresh exactly once

#![forbid(unsafe_code)]

mod inventory;
mod oplog;
mod timeline;

pub use inventory::{Inventory, InventoryCache};
pub use oplog::OperationLog;
pub use timeline::{InstanceTimeline, TimelineMap};

use parking_lot::RwLock;
use spot_provider::ProviderError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The instance never appeared in the operation history window.
    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type CacheResult<T> = Result<T, CacheError>;

// ─── Cache gate ───────────────────────────────────────────────────────────────

/// Single access point for one cached snapshot: refresh-if-stale, then read.
///
/// Refreshes are serialized. A refresh that races an `invalidate()` still
/// hands its result to its own caller but does not publish it, so the next
/// reader refreshes again.
#[derive(Debug)]
pub struct CacheGate<T> {
    slot: RwLock<Option<Arc<T>>>,
    refresh_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    refreshes: AtomicU64,
}

impl<T> CacheGate<T> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Return the published snapshot, running `fetch` first if there is none.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> CacheResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }

        let _refreshing = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let fresh = Arc::new(fetch().await?);
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        if self.generation.load(Ordering::SeqCst) == generation {
            *self.slot.write() = Some(Arc::clone(&fresh));
        }
        Ok(fresh)
    }

    /// Drop the snapshot; the next read refreshes.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.slot.write() = None;
    }

    pub fn is_stale(&self) -> bool {
        self.slot.read().is_none()
    }

    /// Full refreshes performed since construction.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn current(&self) -> Option<Arc<T>> {
        self.slot.read().clone()
    }
}

impl<T> Default for CacheGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_refreshes_once_until_invalidated() {
        let gate: CacheGate<u32> = CacheGate::new();
        assert!(gate.is_stale());

        let a = gate.get_or_refresh(|| async { Ok(1) }).await.unwrap();
        let b = gate.get_or_refresh(|| async { Ok(2) }).await.unwrap();
        assert_eq!((*a, *b), (1, 1));
        assert_eq!(gate.refresh_count(), 1);
        assert!(!gate.is_stale());

        gate.invalidate();
        assert!(gate.is_stale());
        let c = gate.get_or_refresh(|| async { Ok(3) }).await.unwrap();
        assert_eq!(*c, 3);
        assert_eq!(gate.refresh_count(), 2);
    }

    #[tokio::test]
    async fn test_gate_failed_refresh_leaves_stale() {
        let gate: CacheGate<u32> = CacheGate::new();
        let err = gate
            .get_or_refresh(|| async {
                Err(CacheError::Provider(ProviderError::Auth("expired".to_string())))
            })
            .await;
        assert!(err.is_err());
        assert!(gate.is_stale());
        assert_eq!(gate.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_gate_invalidate_during_refresh_is_not_published() {
        let gate: Arc<CacheGate<u32>> = Arc::new(CacheGate::new());
        let inner = Arc::clone(&gate);
        let v = gate
            .get_or_refresh(|| async move {
                inner.invalidate();
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(*v, 7);
        assert!(gate.is_stale(), "snapshot built before invalidate must not be published");
    }
}
