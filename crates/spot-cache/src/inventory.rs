//! Live instance roster across the configured zones.

use crate::{CacheGate, CacheResult};
use futures_util::future::try_join_all;
use spot_proto::{InstanceRecord, InstanceStatus};
use spot_provider::Provider;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One full listing of every configured zone, keyed by instance name.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    records: BTreeMap<String, InstanceRecord>,
}

impl Inventory {
    /// Key records by name; a later duplicate replaces an earlier one.
    pub fn from_records(records: impl IntoIterator<Item = InstanceRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    /// The record for `name`, if it is live.
    pub fn get(&self, name: &str) -> Option<&InstanceRecord> {
        self.records.get(name)
    }

    /// Whether `name` currently exists in any configured zone.
    pub fn is_live(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Provider status as of the last listing.
    pub fn status_of(&self, name: &str) -> Option<InstanceStatus> {
        self.records.get(name).map(|r| r.status)
    }

    /// Records in name order.
    pub fn iter(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.records.values()
    }

    /// Instances in `zone` that are not terminated.
    pub fn active_in_zone(&self, zone: &str) -> usize {
        self.records
            .values()
            .filter(|r| r.zone == zone && !r.status.is_terminated())
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Lazily refreshed [`Inventory`] with wholesale invalidation.
#[derive(Debug)]
pub struct InventoryCache {
    provider: Arc<dyn Provider>,
    zones: Vec<String>,
    gate: CacheGate<Inventory>,
}

impl InventoryCache {
    pub fn new(provider: Arc<dyn Provider>, zones: Vec<String>) -> Self {
        Self {
            provider,
            zones,
            gate: CacheGate::new(),
        }
    }

    /// Current roster, listing every zone first if stale.
    pub async fn snapshot(&self) -> CacheResult<Arc<Inventory>> {
        self.gate.get_or_refresh(|| self.rebuild()).await
    }

    /// Whether `name` exists in any configured zone, refreshing if stale.
    pub async fn is_live(&self, name: &str) -> CacheResult<bool> {
        Ok(self.snapshot().await?.is_live(name))
    }

    /// Drop the roster; the next read lists every zone again.
    pub fn invalidate(&self) {
        debug!("inventory invalidated");
        self.gate.invalidate();
    }

    pub fn is_stale(&self) -> bool {
        self.gate.is_stale()
    }

    /// Full listings performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.gate.refresh_count()
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    async fn rebuild(&self) -> CacheResult<Inventory> {
        let per_zone = try_join_all(self.zones.iter().map(|zone| self.list_zone(zone))).await?;
        let inventory = Inventory::from_records(per_zone.into_iter().flatten());
        info!(
            zones = self.zones.len(),
            instances = inventory.len(),
            "rebuilt instance inventory"
        );
        Ok(inventory)
    }

    async fn list_zone(&self, zone: &str) -> CacheResult<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.provider.list_instances(zone, token.as_deref()).await?;
            records.extend(page.instances.iter().map(InstanceRecord::from_provider));
            match page.next_page_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_proto::{ProviderInstance, metadata_keys};
    use spot_provider::{CallKind, FakeProvider};

    fn instance(name: &str, zone: &str, status: InstanceStatus) -> ProviderInstance {
        ProviderInstance {
            name: name.to_string(),
            zone: format!("https://www.googleapis.com/compute/v1/projects/p/zones/{zone}"),
            status,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_paginates_every_zone() {
        let fake = Arc::new(FakeProvider::new().with_page_size(2));
        for i in 0..5 {
            fake.add_instance(instance(&format!("a-p-{i}"), "z1", InstanceStatus::Running));
        }
        fake.add_instance(instance("b-p-0", "z2", InstanceStatus::Terminated));

        let cache = InventoryCache::new(fake.clone(), vec!["z1".into(), "z2".into()]);
        let inv = cache.snapshot().await.unwrap();
        assert_eq!(inv.len(), 6);
        assert_eq!(inv.get("b-p-0").unwrap().zone, "z2");
        assert_eq!(inv.active_in_zone("z1"), 5);
        assert_eq!(inv.active_in_zone("z2"), 0);
        // three pages in z1, one in z2
        assert_eq!(fake.count(CallKind::ListInstances), 4);
    }

    #[tokio::test]
    async fn test_budget_read_from_metadata() {
        let fake = Arc::new(FakeProvider::new());
        let mut with_budget = instance("a-p-0", "z1", InstanceStatus::Running);
        with_budget
            .metadata
            .insert(metadata_keys::MAX_RUN_SECONDS.to_string(), "3600".to_string());
        fake.add_instance(with_budget);
        fake.add_instance(instance("a-p-1", "z1", InstanceStatus::Running));

        let cache = InventoryCache::new(fake, vec!["z1".into()]);
        let inv = cache.snapshot().await.unwrap();
        assert_eq!(inv.get("a-p-0").unwrap().max_run_seconds, Some(3600));
        assert_eq!(inv.get("a-p-1").unwrap().max_run_seconds, None);
    }

    #[tokio::test]
    async fn test_invalidate_then_refresh_sees_mutation() {
        let fake = Arc::new(FakeProvider::new());
        fake.add_instance(instance("a-p-0", "z1", InstanceStatus::Terminated));
        let cache = InventoryCache::new(fake.clone(), vec!["z1".into()]);

        assert_eq!(cache.snapshot().await.unwrap().status_of("a-p-0"), Some(InstanceStatus::Terminated));
        fake.start_instance("z1", "a-p-0").await.unwrap();

        // Still the old snapshot until invalidated.
        assert_eq!(cache.snapshot().await.unwrap().status_of("a-p-0"), Some(InstanceStatus::Terminated));
        cache.invalidate();
        assert_eq!(cache.snapshot().await.unwrap().status_of("a-p-0"), Some(InstanceStatus::Running));
        assert_eq!(cache.refresh_count(), 2);
        assert!(!cache.is_live("ghost").await.unwrap());
    }
}
