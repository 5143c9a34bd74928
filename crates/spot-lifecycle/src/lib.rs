//! Lifecycle derivation, corrective-action rules and zone balancing.
//!
//! Everything here is pure: functions read an [`InstanceTimeline`] or an
//! [`Inventory`] snapshot plus "now" and return values. No I/O, no state.
//! Every "last X" is the head of a window-bounded, descending list, so the
//! results are the same whether computed from a warm or a cold cache.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use spot_cache::{InstanceTimeline, Inventory, TimelineMap};
use spot_proto::{EventCategory, InstanceRecord, InstanceStatus};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
}

// ─── Derivations ──────────────────────────────────────────────────────────────

fn non_negative(d: Duration) -> Duration {
    d.max(Duration::zero())
}

/// How long the current run has been going. Zero if there is no start or the
/// most recent start already completed.
pub fn current_run_elapsed(timeline: &InstanceTimeline, now: DateTime<Utc>) -> Duration {
    let Some(start) = timeline.last_start() else {
        return Duration::zero();
    };
    if let Some(done) = timeline.last_completion()
        && start < done
    {
        return Duration::zero();
    }
    non_negative(now - start)
}

/// Duration of the most recent start→completion pair, or zero.
pub fn last_run_elapsed(timeline: &InstanceTimeline) -> Duration {
    match (timeline.last_start(), timeline.last_completion()) {
        (Some(start), Some(done)) => non_negative(done - start),
        _ => Duration::zero(),
    }
}

/// A preemption strictly after the most recent start.
pub fn was_preempted(timeline: &InstanceTimeline) -> bool {
    matches!(
        (timeline.last_start(), timeline.last_preemption()),
        (Some(start), Some(preempt)) if start < preempt
    )
}

/// A completion strictly after the most recent start.
pub fn was_completed(timeline: &InstanceTimeline) -> bool {
    matches!(
        (timeline.last_start(), timeline.last_completion()),
        (Some(start), Some(done)) if start < done
    )
}

/// Preemptions inside the lookback window, not over the instance lifetime.
pub fn preemption_count(timeline: &InstanceTimeline) -> usize {
    timeline.events(EventCategory::Preemption).len()
}

/// Time between the most recent creation and the most recent deletion.
pub fn instance_live_span(timeline: &InstanceTimeline) -> Duration {
    match (timeline.last_creation(), timeline.last_deletion()) {
        (Some(created), Some(deleted)) => non_negative(deleted - created),
        _ => Duration::zero(),
    }
}

/// `elapsed` strictly exceeds the declared budget. No budget never exceeds.
pub fn is_over_budget(elapsed: Duration, max_run_seconds: Option<u64>) -> bool {
    let Some(max) = max_run_seconds else {
        return false;
    };
    let budget = i64::try_from(max)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX);
    elapsed > budget
}

// ─── Lifecycle snapshot ───────────────────────────────────────────────────────

/// Every derived value for one live instance at one instant; one status row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSnapshot {
    pub name: String,
    pub zone: String,
    pub status: InstanceStatus,
    pub last_start: Option<DateTime<Utc>>,
    pub last_completion: Option<DateTime<Utc>>,
    pub last_preemption: Option<DateTime<Utc>>,
    pub current_run_secs: i64,
    pub last_run_secs: i64,
    pub preempted: bool,
    pub preemption_count: usize,
    pub completed: bool,
    pub live_span_secs: i64,
    pub max_run_seconds: Option<u64>,
    pub over_budget: bool,
}

impl LifecycleSnapshot {
    pub fn derive(record: &InstanceRecord, timeline: &InstanceTimeline, now: DateTime<Utc>) -> Self {
        let current = current_run_elapsed(timeline, now);
        Self {
            name: record.name.clone(),
            zone: record.zone.clone(),
            status: record.status,
            last_start: timeline.last_start(),
            last_completion: timeline.last_completion(),
            last_preemption: timeline.last_preemption(),
            current_run_secs: current.num_seconds(),
            last_run_secs: last_run_elapsed(timeline).num_seconds(),
            preempted: was_preempted(timeline),
            preemption_count: preemption_count(timeline),
            completed: was_completed(timeline),
            live_span_secs: instance_live_span(timeline).num_seconds(),
            max_run_seconds: record.max_run_seconds,
            over_budget: is_over_budget(current, record.max_run_seconds),
        }
    }
}

/// Derivations for a whole timeline map at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleDeriver<'a> {
    timelines: &'a TimelineMap,
    now: DateTime<Utc>,
}

impl<'a> LifecycleDeriver<'a> {
    pub fn new(timelines: &'a TimelineMap, now: DateTime<Utc>) -> Self {
        Self { timelines, now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn timeline(&self, name: &str) -> Result<&'a InstanceTimeline, LifecycleError> {
        self.timelines
            .get(name)
            .map_err(|_| LifecycleError::UnknownInstance(name.to_string()))
    }

    pub fn current_run_elapsed(&self, name: &str) -> Result<Duration, LifecycleError> {
        Ok(current_run_elapsed(self.timeline(name)?, self.now))
    }

    pub fn last_run_elapsed(&self, name: &str) -> Result<Duration, LifecycleError> {
        Ok(last_run_elapsed(self.timeline(name)?))
    }

    pub fn was_preempted(&self, name: &str) -> Result<bool, LifecycleError> {
        Ok(was_preempted(self.timeline(name)?))
    }

    pub fn was_completed(&self, name: &str) -> Result<bool, LifecycleError> {
        Ok(was_completed(self.timeline(name)?))
    }

    pub fn preemption_count(&self, name: &str) -> Result<usize, LifecycleError> {
        Ok(preemption_count(self.timeline(name)?))
    }

    pub fn instance_live_span(&self, name: &str) -> Result<Duration, LifecycleError> {
        Ok(instance_live_span(self.timeline(name)?))
    }

    /// Row for a live instance. Instances with no history in the window get
    /// the empty timeline rather than an error.
    pub fn snapshot(&self, record: &InstanceRecord) -> LifecycleSnapshot {
        let timeline = self.timelines.get_or_empty(&record.name);
        LifecycleSnapshot::derive(record, timeline, self.now)
    }
}

// ─── Corrective actions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectiveAction {
    /// Preempted after its last start: cold boot it again.
    Restart,
    /// Ran past its budget: hard reset.
    Reset,
    /// Completed and live-delete is on.
    Delete,
    /// Completed but live-delete is off: report only.
    EligibleForDelete,
    None,
}

impl CorrectiveAction {
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Restart | Self::Reset | Self::Delete)
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Restart => "preempted, restarting",
            Self::Reset => "exceeded max run, restarting",
            Self::Delete => "completed, deleting",
            Self::EligibleForDelete => "eligible for delete (not executed)",
            Self::None => "no action",
        }
    }
}

/// First matching rule wins: preempted, then over budget, then completed.
pub fn decide_action(snapshot: &LifecycleSnapshot, live_delete: bool) -> CorrectiveAction {
    let action = if snapshot.preempted {
        CorrectiveAction::Restart
    } else if snapshot.over_budget {
        CorrectiveAction::Reset
    } else if snapshot.completed {
        if live_delete {
            CorrectiveAction::Delete
        } else {
            CorrectiveAction::EligibleForDelete
        }
    } else {
        CorrectiveAction::None
    };
    debug!(instance = %snapshot.name, ?action, "evaluated corrective action");
    action
}

// ─── Zone balancing ───────────────────────────────────────────────────────────

/// Non-terminated instance count in one zone at admission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneLoad {
    pub zone: String,
    pub active: usize,
}

/// Per-zone load in configured zone order.
pub fn zone_loads(zones: &[String], inventory: &Inventory) -> Vec<ZoneLoad> {
    zones
        .iter()
        .map(|zone| ZoneLoad {
            zone: zone.clone(),
            active: inventory.active_in_zone(zone),
        })
        .collect()
}

/// Least-loaded zone, first in configured order among ties. `None` when the
/// least-loaded zone is already at `capacity_per_zone` or there are no zones.
pub fn pick_zone(zones: &[String], inventory: &Inventory, capacity_per_zone: u32) -> Option<ZoneLoad> {
    let mut best: Option<ZoneLoad> = None;
    for load in zone_loads(zones, inventory) {
        match &best {
            Some(current) if current.active <= load.active => {}
            _ => best = Some(load),
        }
    }
    best.filter(|load| load.active < capacity_per_zone as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_proto::{OperationEvent, OperationType};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn timeline(events: &[(OperationType, i64)]) -> InstanceTimeline {
        let evs: Vec<OperationEvent> = events
            .iter()
            .map(|(op, secs)| OperationEvent {
                target: "site-a-p-0".to_string(),
                zone: "z1".to_string(),
                operation_type: *op,
                end_time: t0() + Duration::seconds(*secs),
            })
            .collect();
        InstanceTimeline::from_events(&evs)
    }

    fn record(name: &str, zone: &str, status: InstanceStatus, max: Option<u64>) -> InstanceRecord {
        InstanceRecord {
            name: name.to_string(),
            zone: zone.to_string(),
            status,
            max_run_seconds: max,
        }
    }

    #[test]
    fn test_empty_timeline_is_all_zero() {
        let empty = InstanceTimeline::empty();
        assert_eq!(current_run_elapsed(empty, t0()), Duration::zero());
        assert_eq!(last_run_elapsed(empty), Duration::zero());
        assert_eq!(instance_live_span(empty), Duration::zero());
        assert!(!was_preempted(empty));
        assert!(!was_completed(empty));
        assert_eq!(preemption_count(empty), 0);
    }

    #[test]
    fn test_current_run_measured_from_last_start_despite_preemption() {
        let tl = timeline(&[(OperationType::Start, 0), (OperationType::Preempted, 600)]);
        let now = t0() + Duration::seconds(601);
        assert_eq!(current_run_elapsed(&tl, now), Duration::seconds(601));
        assert!(was_preempted(&tl));
        assert!(!was_completed(&tl));
    }

    #[test]
    fn test_current_run_zero_after_completion() {
        let tl = timeline(&[(OperationType::Start, 0), (OperationType::Complete, 500)]);
        assert_eq!(current_run_elapsed(&tl, t0() + Duration::hours(1)), Duration::zero());
        assert_eq!(last_run_elapsed(&tl), Duration::seconds(500));
        assert!(was_completed(&tl));
    }

    #[test]
    fn test_current_run_clamped_under_clock_skew() {
        let tl = timeline(&[(OperationType::Start, 120)]);
        assert_eq!(current_run_elapsed(&tl, t0()), Duration::zero());
    }

    #[test]
    fn test_restart_after_completion_is_a_new_run() {
        let tl = timeline(&[
            (OperationType::Start, 0),
            (OperationType::Complete, 500),
            (OperationType::Reset, 900),
        ]);
        assert!(!was_completed(&tl));
        assert_eq!(current_run_elapsed(&tl, t0() + Duration::seconds(1000)), Duration::seconds(100));
        // Completion precedes the latest start, so the pair is clamped.
        assert_eq!(last_run_elapsed(&tl), Duration::zero());
    }

    #[test]
    fn test_preemption_before_latest_start_does_not_count() {
        let tl = timeline(&[
            (OperationType::Start, 0),
            (OperationType::Preempted, 60),
            (OperationType::Start, 120),
        ]);
        assert!(!was_preempted(&tl));
        assert_eq!(preemption_count(&tl), 1);
    }

    #[test]
    fn test_live_span_and_insert_counts_as_start() {
        let tl = timeline(&[(OperationType::Insert, 0), (OperationType::Delete, 3600)]);
        assert_eq!(tl.last_start(), Some(t0()));
        assert_eq!(instance_live_span(&tl), Duration::hours(1));
    }

    #[test]
    fn test_budget_unset_never_exceeded() {
        assert!(!is_over_budget(Duration::days(365), None));
        assert!(!is_over_budget(Duration::seconds(700), Some(700)));
        assert!(is_over_budget(Duration::seconds(701), Some(700)));
        assert!(!is_over_budget(Duration::seconds(1), Some(u64::MAX)));
    }

    #[test]
    fn test_priority_preempted_beats_over_budget() {
        let tl = timeline(&[(OperationType::Start, 0), (OperationType::Preempted, 600)]);
        let rec = record("site-a-p-0", "z1", InstanceStatus::Terminated, Some(300));
        let snap = LifecycleSnapshot::derive(&rec, &tl, t0() + Duration::seconds(900));
        assert!(snap.preempted && snap.over_budget);
        assert_eq!(decide_action(&snap, true), CorrectiveAction::Restart);
    }

    #[test]
    fn test_over_budget_before_completed() {
        let mut snap = LifecycleSnapshot::derive(
            &record("x", "z1", InstanceStatus::Running, None),
            InstanceTimeline::empty(),
            t0(),
        );
        snap.over_budget = true;
        snap.completed = true;
        assert_eq!(decide_action(&snap, true), CorrectiveAction::Reset);
    }

    #[test]
    fn test_completed_respects_live_delete() {
        let tl = timeline(&[(OperationType::Start, 0), (OperationType::Complete, 500)]);
        let rec = record("site-a-p-0", "z1", InstanceStatus::Terminated, None);
        let snap = LifecycleSnapshot::derive(&rec, &tl, t0() + Duration::seconds(600));
        assert_eq!(decide_action(&snap, false), CorrectiveAction::EligibleForDelete);
        assert_eq!(decide_action(&snap, true), CorrectiveAction::Delete);
        assert!(!CorrectiveAction::EligibleForDelete.is_mutating());
    }

    #[test]
    fn test_deriver_unknown_instance() {
        let map = TimelineMap::build(&[]);
        let deriver = LifecycleDeriver::new(&map, t0());
        assert_eq!(
            deriver.was_preempted("ghost"),
            Err(LifecycleError::UnknownInstance("ghost".to_string()))
        );
        let row = deriver.snapshot(&record("ghost", "z1", InstanceStatus::Running, Some(10)));
        assert_eq!(row.current_run_secs, 0);
        assert!(!row.over_budget);
    }

    #[test]
    fn test_pick_zone_least_loaded() {
        let zones = vec!["z1".to_string(), "z2".to_string(), "z3".to_string()];
        let inv = Inventory::from_records([
            record("a", "z1", InstanceStatus::Running, None),
            record("b", "z1", InstanceStatus::Running, None),
            record("c", "z2", InstanceStatus::Running, None),
            record("d", "z3", InstanceStatus::Terminated, None),
            record("e", "z3", InstanceStatus::Terminated, None),
        ]);
        let pick = pick_zone(&zones, &inv, 3).unwrap();
        assert_eq!(pick, ZoneLoad { zone: "z3".to_string(), active: 0 });
    }

    #[test]
    fn test_pick_zone_tie_break_is_configured_order() {
        let inv = Inventory::default();
        let ab = vec!["b".to_string(), "a".to_string()];
        for _ in 0..5 {
            assert_eq!(pick_zone(&ab, &inv, 1).unwrap().zone, "b");
        }
    }

    #[test]
    fn test_pick_zone_refuses_when_full() {
        let zones = vec!["z1".to_string(), "z2".to_string()];
        let inv = Inventory::from_records([
            record("a", "z1", InstanceStatus::Running, None),
            record("b", "z2", InstanceStatus::Staging, None),
        ]);
        assert_eq!(pick_zone(&zones, &inv, 1), None);
        assert!(pick_zone(&zones, &inv, 2).is_some());
        assert_eq!(pick_zone(&[], &inv, 2), None);
    }

    #[test]
    fn test_snapshot_serializes() {
        let row = LifecycleSnapshot::derive(
            &record("a", "z1", InstanceStatus::Running, Some(60)),
            InstanceTimeline::empty(),
            t0(),
        );
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("\"status\":\"RUNNING\""));
    }
}
