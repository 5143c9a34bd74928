//! Observability for the reconciliation controller.
//!
//! - [`OperationsMetrics`]: atomic counters for passes, actions, refusals and errors
//! - [`MetricsExporter`]: Prometheus text rendering of those counters
//! - [`ActionAuditLog`]: bounded in-memory trail of every corrective or
//!   admission action, mirrored as structured tracing events

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────
// Counter
// ─────────────────────────────────────────────────────────────

/// Monotonic `u64` counter, shared by reference.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Add one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrite with a value tracked elsewhere (cache refresh totals).
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────
// Operations Metrics
// ─────────────────────────────────────────────────────────────

/// Counters for everything the controller does to the fleet.
///
/// ```rust
/// # use spot_observe::OperationsMetrics;
/// let metrics = OperationsMetrics::new();
/// metrics.record_pass();
/// assert_eq!(metrics.passes_total.get(), 1);
/// ```
#[derive(Debug, Default)]
pub struct OperationsMetrics {
    /// Reconciliation passes run.
    pub passes_total: Counter,
    /// Passes that took no action.
    pub quiet_passes_total: Counter,
    /// Preempted instances started again.
    pub restarts_total: Counter,
    /// Over-budget instances reset.
    pub resets_total: Counter,
    /// Completed instances deleted.
    pub deletes_total: Counter,
    /// Completed instances reported but left alone.
    pub delete_eligible_total: Counter,
    /// Existing instances started by admission.
    pub starts_total: Counter,
    /// Instances created by admission.
    pub creates_total: Counter,
    /// Instances stopped, singly or by stop-all.
    pub stops_total: Counter,
    /// Admissions refused because every zone was at capacity.
    pub admission_refusals_total: Counter,
    /// Mutating or lookup provider calls that returned an error.
    pub provider_errors_total: Counter,
    /// Full inventory listings, mirrored from the inventory cache.
    pub inventory_refreshes_total: Counter,
    /// Full operation-log rebuilds, mirrored from the operation log.
    pub operation_log_refreshes_total: Counter,
}

impl OperationsMetrics {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a reconciliation pass.
    pub fn record_pass(&self) {
        self.passes_total.inc();
    }

    /// Record a pass that finished without acting or failing.
    pub fn record_quiet_pass(&self) {
        self.quiet_passes_total.inc();
    }

    /// Record a preempted instance started again. Logs at info.
    pub fn record_restart(&self) {
        self.restarts_total.inc();
        info!(counter = "restarts_total", value = self.restarts_total.get(), "preempted instance restarted");
    }

    /// Record an over-budget instance reset. Logs at info.
    pub fn record_reset(&self) {
        self.resets_total.inc();
        info!(counter = "resets_total", value = self.resets_total.get(), "over-budget instance reset");
    }

    /// Record a completed instance deleted.
    pub fn record_delete(&self) {
        self.deletes_total.inc();
    }

    /// Record a completed instance left in place because live delete is off.
    pub fn record_delete_eligible(&self) {
        self.delete_eligible_total.inc();
    }

    /// Record an existing instance started through admission.
    pub fn record_start(&self) {
        self.starts_total.inc();
    }

    /// Record an instance created through admission. Logs at info.
    pub fn record_create(&self) {
        self.creates_total.inc();
        info!(counter = "creates_total", value = self.creates_total.get(), "instance created");
    }

    /// Record an instance stopped.
    pub fn record_stop(&self) {
        self.stops_total.inc();
    }

    /// Record an admission refused for lack of zone capacity. Logs at warn.
    pub fn record_refusal(&self) {
        self.admission_refusals_total.inc();
        warn!(
            counter = "admission_refusals_total",
            value = self.admission_refusals_total.get(),
            "admission refused"
        );
    }

    /// Record a failed provider call. Logs at warn.
    pub fn record_provider_error(&self) {
        self.provider_errors_total.inc();
        warn!(
            counter = "provider_errors_total",
            value = self.provider_errors_total.get(),
            "provider call failed"
        );
    }

    /// Copy the caches' own refresh counters in before export.
    pub fn sync_cache_refreshes(&self, inventory: u64, operation_log: u64) {
        self.inventory_refreshes_total.set(inventory);
        self.operation_log_refreshes_total.set(operation_log);
    }
}

// ─────────────────────────────────────────────────────────────
// Metrics Exporter (Prometheus text format)
// ─────────────────────────────────────────────────────────────

/// Renders [`OperationsMetrics`] as Prometheus text exposition.
pub struct MetricsExporter {
    /// Counters to render; shared with the controller that updates them.
    metrics: Arc<OperationsMetrics>,
    /// Metric name prefix, `spotctl` unless overridden.
    prefix: String,
}

impl MetricsExporter {
    /// Exporter with the default `spotctl` prefix.
    pub fn new(metrics: Arc<OperationsMetrics>) -> Self {
        Self::with_prefix(metrics, "spotctl")
    }

    /// Exporter with a custom metric name prefix.
    pub fn with_prefix(metrics: Arc<OperationsMetrics>, prefix: impl Into<String>) -> Self {
        Self {
            metrics,
            prefix: prefix.into(),
        }
    }

    /// `# HELP`, `# TYPE` and value line for every counter.
    pub fn render(&self) -> String {
        let m = &self.metrics;
        let rows: [(&str, &str, &Counter); 13] = [
            ("passes_total", "Reconciliation passes run", &m.passes_total),
            ("quiet_passes_total", "Reconciliation passes with nothing to report", &m.quiet_passes_total),
            ("restarts_total", "Preempted instances started again", &m.restarts_total),
            ("resets_total", "Instances reset after exceeding their run budget", &m.resets_total),
            ("deletes_total", "Completed instances deleted", &m.deletes_total),
            ("delete_eligible_total", "Completed instances reported but not deleted", &m.delete_eligible_total),
            ("starts_total", "Existing instances started by admission", &m.starts_total),
            ("creates_total", "Instances created by admission", &m.creates_total),
            ("stops_total", "Instances stopped", &m.stops_total),
            ("admission_refusals_total", "Admissions refused for lack of zone capacity", &m.admission_refusals_total),
            ("provider_errors_total", "Provider calls that failed", &m.provider_errors_total),
            ("inventory_refreshes_total", "Full inventory listings performed", &m.inventory_refreshes_total),
            ("operation_log_refreshes_total", "Full operation log rebuilds performed", &m.operation_log_refreshes_total),
        ];

        let mut out = String::new();
        for (name, help, counter) in rows {
            write_counter(&mut out, &self.prefix, name, help, counter.get());
        }
        out
    }
}

fn write_counter(out: &mut String, prefix: &str, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
    out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
    out.push_str(&format!("{prefix}_{name} {value}\n\n"));
}

// ─────────────────────────────────────────────────────────────
// Action Audit Log
// ─────────────────────────────────────────────────────────────

/// Provider-facing action the controller attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Start,
    Reset,
    Stop,
    Delete,
    Create,
}

/// How an attempted action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
    /// Admission refused; nothing was sent to the provider.
    Refused,
    /// Live-delete is off; the action was only reported.
    DryRun,
}

/// One audited action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAuditEntry {
    /// Random v4 id, also attached to the matching tracing event.
    pub id: String,
    /// Controller clock time of the attempt.
    pub timestamp: DateTime<Utc>,
    pub instance: String,
    /// `None` when no zone was chosen, as for a refused admission.
    pub zone: Option<String>,
    pub kind: ActionKind,
    pub outcome: ActionOutcome,
    /// Provider error text or refusal reason.
    pub detail: Option<String>,
}

/// Bounded record of controller actions. Oldest entries are evicted first.
pub struct ActionAuditLog {
    entries: RwLock<Vec<ActionAuditEntry>>,
    max_entries: usize,
}

impl ActionAuditLog {
    /// Empty log keeping at most `max_entries` entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_entries,
        }
    }

    /// Empty log holding up to 10,000 entries.
    pub fn default_capacity() -> Self {
        Self::new(10_000)
    }

    /// Append an entry and emit it as a tracing event: info on success,
    /// error on failure, warn when refused or not executed.
    pub fn record(
        &self,
        at: DateTime<Utc>,
        instance: &str,
        zone: Option<&str>,
        kind: ActionKind,
        outcome: ActionOutcome,
        detail: Option<String>,
    ) {
        let entry = ActionAuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: at,
            instance: instance.to_string(),
            zone: zone.map(String::from),
            kind,
            outcome,
            detail,
        };

        match outcome {
            ActionOutcome::Success => info!(
                audit_id = %entry.id,
                instance = %entry.instance,
                zone = ?entry.zone,
                kind = ?entry.kind,
                "controller action succeeded"
            ),
            ActionOutcome::Failure => error!(
                audit_id = %entry.id,
                instance = %entry.instance,
                zone = ?entry.zone,
                kind = ?entry.kind,
                detail = ?entry.detail,
                "controller action failed"
            ),
            ActionOutcome::Refused => warn!(
                audit_id = %entry.id,
                instance = %entry.instance,
                kind = ?entry.kind,
                detail = ?entry.detail,
                "controller action refused"
            ),
            ActionOutcome::DryRun => warn!(
                audit_id = %entry.id,
                instance = %entry.instance,
                zone = ?entry.zone,
                kind = ?entry.kind,
                "controller action not executed"
            ),
        }

        let mut entries = self.entries.write();
        entries.push(entry);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
    }

    /// Most recent first, optionally filtered.
    pub fn query(&self, kind: Option<ActionKind>, instance: Option<&str>, limit: usize) -> Vec<ActionAuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .filter(|e| instance.is_none_or(|i| e.instance == i))
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// The whole trail, oldest first, as pretty JSON.
    pub fn to_json(&self) -> String {
        let entries = self.entries.read();
        serde_json::to_string_pretty(&*entries).unwrap_or_else(|_| "[]".to_string())
    }

    /// Entries currently held.
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }
}

impl std::fmt::Debug for ActionAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionAuditLog")
            .field("entries", &self.count())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_counters() {
        let m = OperationsMetrics::new();
        m.record_pass();
        m.record_pass();
        m.record_restart();
        m.record_refusal();
        m.sync_cache_refreshes(4, 3);
        assert_eq!(m.passes_total.get(), 2);
        assert_eq!(m.restarts_total.get(), 1);
        assert_eq!(m.admission_refusals_total.get(), 1);
        assert_eq!(m.inventory_refreshes_total.get(), 4);
        m.sync_cache_refreshes(5, 3);
        assert_eq!(m.inventory_refreshes_total.get(), 5);
    }

    #[test]
    fn test_prometheus_render() {
        let m = Arc::new(OperationsMetrics::new());
        m.record_reset();
        let text = MetricsExporter::new(Arc::clone(&m)).render();
        assert!(text.contains("# TYPE spotctl_resets_total counter"));
        assert!(text.contains("spotctl_resets_total 1\n"));
        assert!(text.contains("spotctl_passes_total 0\n"));

        let custom = MetricsExporter::with_prefix(m, "fleet").render();
        assert!(custom.contains("fleet_resets_total 1"));
    }

    #[test]
    fn test_audit_log_query_and_eviction() {
        let log = ActionAuditLog::new(3);
        for i in 0..5 {
            log.record(
                at(),
                &format!("site-p-{i}"),
                Some("us-west1-a"),
                if i % 2 == 0 { ActionKind::Start } else { ActionKind::Reset },
                ActionOutcome::Success,
                None,
            );
        }
        assert_eq!(log.count(), 3);
        let starts = log.query(Some(ActionKind::Start), None, 10);
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[0].instance, "site-p-4");
        assert!(log.query(None, Some("site-p-0"), 10).is_empty());
    }

    #[test]
    fn test_audit_log_json() {
        let log = ActionAuditLog::new(10);
        log.record(at(), "a", None, ActionKind::Create, ActionOutcome::Refused, Some("no zone".into()));
        let json = log.to_json();
        assert!(json.contains("\"outcome\": \"refused\""));
        assert!(json.contains("\"kind\": \"create\""));
    }
}
