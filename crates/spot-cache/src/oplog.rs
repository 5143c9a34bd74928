//! Recent operation history, folded into per-instance timelines.

use crate::{CacheGate, CacheResult, TimelineMap};
use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use spot_proto::{Clock, EventCategory, LookbackWindow, OperationEvent};
use spot_provider::Provider;
use std::sync::Arc;
use tracing::{debug, info};

/// Lazily rebuilt view of every zone's operation log within the lookback window.
#[derive(Debug)]
pub struct OperationLog {
    provider: Arc<dyn Provider>,
    zones: Vec<String>,
    window: LookbackWindow,
    clock: Arc<dyn Clock>,
    gate: CacheGate<TimelineMap>,
}

impl OperationLog {
    pub fn new(
        provider: Arc<dyn Provider>,
        zones: Vec<String>,
        window: LookbackWindow,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            zones,
            window,
            clock,
            gate: CacheGate::new(),
        }
    }

    /// Current timelines, refreshing from the provider if stale.
    pub async fn snapshot(&self) -> CacheResult<Arc<TimelineMap>> {
        self.gate.get_or_refresh(|| self.rebuild()).await
    }

    /// Drop the timelines; the next query rebuilds them from every zone.
    pub fn invalidate(&self) {
        debug!("operation log invalidated");
        self.gate.invalidate();
    }

    /// True until the next rebuild after construction or `invalidate()`.
    pub fn is_stale(&self) -> bool {
        self.gate.is_stale()
    }

    /// Full rebuilds performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.gate.refresh_count()
    }

    async fn rebuild(&self) -> CacheResult<TimelineMap> {
        let per_zone = try_join_all(
            self.zones
                .iter()
                .map(|zone| self.provider.list_zone_operations(zone)),
        )
        .await?;

        let now = self.clock.now();
        let mut raw = 0usize;
        let mut events: Vec<OperationEvent> = Vec::new();
        for ops in &per_zone {
            raw += ops.len();
            events.extend(
                ops.iter()
                    .filter_map(OperationEvent::from_operation)
                    .filter(|ev| self.window.contains(now, ev.end_time)),
            );
        }
        events.sort_by(|a, b| b.end_time.cmp(&a.end_time));

        let map = TimelineMap::build(&events);
        info!(
            zones = self.zones.len(),
            raw_operations = raw,
            events = events.len(),
            instances = map.len(),
            lookback_days = self.window.days,
            "rebuilt operation timelines"
        );
        Ok(map)
    }

    async fn last(&self, name: &str, category: EventCategory) -> CacheResult<Option<DateTime<Utc>>> {
        let map = self.snapshot().await?;
        Ok(map.get(name)?.last(category))
    }

    /// Most recent start, reset or insert within the window.
    pub async fn last_start_time(&self, name: &str) -> CacheResult<Option<DateTime<Utc>>> {
        self.last(name, EventCategory::Start).await
    }

    /// Most recent guest-initiated shutdown, i.e. the job finishing.
    ///
    /// `UnknownInstance` if `name` has no operations in the window.
    pub async fn last_completion_time(&self, name: &str) -> CacheResult<Option<DateTime<Utc>>> {
        self.last(name, EventCategory::Completion).await
    }

    /// Most recent preemption by the provider.
    pub async fn last_preempt_time(&self, name: &str) -> CacheResult<Option<DateTime<Utc>>> {
        self.last(name, EventCategory::Preemption).await
    }

    /// Most recent explicit stop.
    pub async fn last_stop_time(&self, name: &str) -> CacheResult<Option<DateTime<Utc>>> {
        self.last(name, EventCategory::Stop).await
    }

    /// Most recent insert.
    pub async fn last_create_time(&self, name: &str) -> CacheResult<Option<DateTime<Utc>>> {
        self.last(name, EventCategory::Creation).await
    }

    /// Most recent delete.
    pub async fn last_delete_time(&self, name: &str) -> CacheResult<Option<DateTime<Utc>>> {
        self.last(name, EventCategory::Deletion).await
    }
}
