//! Reconciliation and admission control for preemptible batch instances.
//!
//! [`Controller`] is the request surface: `monitor()` runs one
//! reconciliation pass, `start_or_create` / `stop` / `stop_all` perform
//! admission, `status()` returns one derived row per live instance. Every
//! operation returns a [`Report`] of timestamped lines.
//!
//! The controller does not schedule itself. Callers decide when to run a
//! pass; overlapping passes are not coordinated and may issue duplicate
//! starts or resets, which the provider tolerates.

#![forbid(unsafe_code)]

mod admission;
mod error;
mod reconcile;
mod report;

pub use error::{ControllerError, ControllerResult};
pub use report::{LineKind, NOTHING_TO_REPORT, Report, ReportLine};

use spot_cache::{InventoryCache, OperationLog};
use spot_config::ControllerConfig;
use spot_lifecycle::{LifecycleDeriver, LifecycleSnapshot};
use spot_observe::{ActionAuditLog, ActionKind, ActionOutcome, MetricsExporter, OperationsMetrics};
use spot_proto::{Clock, InstanceStatus, instance_name};
use spot_provider::{Provider, ProviderError, ProviderResult};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Controller {
    config: ControllerConfig,
    provider: Arc<dyn Provider>,
    clock: Arc<dyn Clock>,
    inventory: InventoryCache,
    operations: OperationLog,
    metrics: Arc<OperationsMetrics>,
    audit: ActionAuditLog,
}

impl Controller {
    pub fn new(config: ControllerConfig, provider: Arc<dyn Provider>, clock: Arc<dyn Clock>) -> Self {
        let inventory = InventoryCache::new(Arc::clone(&provider), config.zones.clone());
        let operations = OperationLog::new(
            Arc::clone(&provider),
            config.zones.clone(),
            config.lookback(),
            Arc::clone(&clock),
        );
        info!(
            provider = provider.name(),
            project = %config.project,
            zones = ?config.zones,
            live_delete = config.live_delete,
            "controller ready"
        );
        Self {
            config,
            provider,
            clock,
            inventory,
            operations,
            metrics: Arc::new(OperationsMetrics::new()),
            audit: ActionAuditLog::default_capacity(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn inventory(&self) -> &InventoryCache {
        &self.inventory
    }

    pub fn operations(&self) -> &OperationLog {
        &self.operations
    }

    pub fn metrics(&self) -> Arc<OperationsMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn audit(&self) -> &ActionAuditLog {
        &self.audit
    }

    /// Prometheus text for every counter, cache refresh totals included.
    pub fn render_metrics(&self) -> String {
        self.metrics
            .sync_cache_refreshes(self.inventory.refresh_count(), self.operations.refresh_count());
        MetricsExporter::new(Arc::clone(&self.metrics)).render()
    }

    /// Clear both caches so the next read of either sees post-action state.
    pub fn invalidate_caches(&self) {
        self.inventory.invalidate();
        self.operations.invalidate();
    }

    // ─── Status ───────────────────────────────────────────────────────────────

    /// One derived row per live instance, in name order.
    pub async fn status(&self) -> ControllerResult<Vec<LifecycleSnapshot>> {
        let inventory = self.inventory.snapshot().await?;
        let timelines = self.operations.snapshot().await?;
        let deriver = LifecycleDeriver::new(&timelines, self.clock.now());
        Ok(inventory.iter().map(|record| deriver.snapshot(record)).collect())
    }

    /// Ask the provider directly, zone by zone, for one instance's status.
    /// `None` if no configured zone has it.
    pub async fn instance_status(&self, group: &str, index: u32) -> ControllerResult<Option<InstanceStatus>> {
        let name = instance_name(group, index);
        for zone in &self.config.zones {
            match self.provider.get_instance_status(zone, &name).await {
                Ok(status) => return Ok(Some(status)),
                Err(ProviderError::NotFound(_)) => continue,
                Err(e) => {
                    self.metrics.record_provider_error();
                    return Err(e.into());
                }
            }
        }
        Ok(None)
    }

    // ─── Provider actions ─────────────────────────────────────────────────────

    /// Issue one instance-level mutating call. Both caches are invalidated
    /// whether or not it succeeds, and the attempt is audited.
    async fn act(&self, action: InstanceAction, zone: &str, name: &str) -> ProviderResult<()> {
        let result = match action {
            InstanceAction::Start => self.provider.start_instance(zone, name).await,
            InstanceAction::Reset => self.provider.reset_instance(zone, name).await,
            InstanceAction::Stop => self.provider.stop_instance(zone, name).await,
            InstanceAction::Delete => self.provider.delete_instance(zone, name).await,
        };
        self.invalidate_caches();
        self.audit_result(action.kind(), zone, name, &result);
        result
    }

    fn audit_result(&self, kind: ActionKind, zone: &str, name: &str, result: &ProviderResult<()>) {
        let now = self.clock.now();
        match result {
            Ok(()) => self
                .audit
                .record(now, name, Some(zone), kind, ActionOutcome::Success, None),
            Err(e) => {
                warn!(instance = %name, zone = %zone, action = ?kind, error = %e, "provider call failed");
                self.metrics.record_provider_error();
                self.audit
                    .record(now, name, Some(zone), kind, ActionOutcome::Failure, Some(e.to_string()));
            }
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("project", &self.config.project)
            .field("zones", &self.config.zones)
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// Mutating calls against an existing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceAction {
    Start,
    Reset,
    Stop,
    Delete,
}

impl InstanceAction {
    fn kind(self) -> ActionKind {
        match self {
            Self::Start => ActionKind::Start,
            Self::Reset => ActionKind::Reset,
            Self::Stop => ActionKind::Stop,
            Self::Delete => ActionKind::Delete,
        }
    }

    pub(crate) fn verb(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Reset => "reset",
            Self::Stop => "stop",
            Self::Delete => "delete",
        }
    }
}
