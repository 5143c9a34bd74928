//! One reconciliation pass over every live instance.

use crate::{Controller, ControllerResult, InstanceAction, Report};
use spot_lifecycle::{CorrectiveAction, LifecycleDeriver, decide_action};
use spot_observe::{ActionKind, ActionOutcome};
use tracing::{debug, info, warn};

impl Controller {
    /// Evaluate each live instance once and apply at most one corrective
    /// action to it.
    ///
    /// Instances are read through the caches one at a time, so after any
    /// action the next instance is judged on refreshed state. A failed
    /// provider call is reported and the pass moves on to the next instance.
    /// Failing to load the initial inventory or timelines fails the pass.
    pub async fn monitor(&self) -> ControllerResult<Report> {
        self.metrics.record_pass();
        let mut report = Report::new();

        let names: Vec<String> = self
            .inventory
            .snapshot()
            .await?
            .iter()
            .map(|r| r.name.clone())
            .collect();
        self.operations.snapshot().await?;

        for name in &names {
            if let Err(e) = self.reconcile_one(name, &mut report).await {
                warn!(instance = %name, error = %e, "reconciliation pass aborted: state refresh failed");
                report.failed(self.clock.now(), Some(name), format!("{name}: FAILED refresh: {e}"));
                break;
            }
        }

        if report.actions() == 0 && report.failures() == 0 {
            self.metrics.record_quiet_pass();
        }
        info!(
            instances = names.len(),
            actions = report.actions(),
            failures = report.failures(),
            "reconciliation pass complete"
        );
        Ok(report.finish(self.clock.now()))
    }

    /// Errors returned here are cache refresh failures; provider action
    /// failures are written into the report instead.
    async fn reconcile_one(&self, name: &str, report: &mut Report) -> ControllerResult<()> {
        let inventory = self.inventory.snapshot().await?;
        let Some(record) = inventory.get(name) else {
            debug!(instance = %name, "no longer live, skipping");
            return Ok(());
        };
        let timelines = self.operations.snapshot().await?;
        let now = self.clock.now();
        let row = LifecycleDeriver::new(&timelines, now).snapshot(record);

        let decision = decide_action(&row, self.config.live_delete);
        let action = match decision {
            CorrectiveAction::Restart => InstanceAction::Start,
            CorrectiveAction::Reset => InstanceAction::Reset,
            CorrectiveAction::Delete => InstanceAction::Delete,
            CorrectiveAction::EligibleForDelete => {
                self.metrics.record_delete_eligible();
                self.audit.record(
                    now,
                    name,
                    Some(&record.zone),
                    ActionKind::Delete,
                    ActionOutcome::DryRun,
                    None,
                );
                report.observed(now, name, format!("{name}: {}", decision.message()));
                return Ok(());
            }
            CorrectiveAction::None => return Ok(()),
        };

        match self.act(action, &record.zone, name).await {
            Ok(()) => {
                match decision {
                    CorrectiveAction::Restart => self.metrics.record_restart(),
                    CorrectiveAction::Reset => self.metrics.record_reset(),
                    _ => self.metrics.record_delete(),
                }
                report.action(self.clock.now(), name, format!("{name}: {}", decision.message()));
            }
            Err(e) => {
                report.failed(
                    self.clock.now(),
                    Some(name),
                    format!("{name}: FAILED {}: {e}", action.verb()),
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LineKind;
    use chrono::{DateTime, Duration, Utc};
    use spot_config::ControllerConfig;
    use spot_proto::{
        FixedClock, InstanceStatus, ProviderInstance, ZoneOperation, format_provider_timestamp,
        metadata_keys,
    };
    use spot_provider::{CallKind, FakeProvider};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_710_000_000, 0).unwrap()
    }

    fn config(live_delete: bool) -> ControllerConfig {
        ControllerConfig {
            project: "p".into(),
            zones: vec!["z1".into()],
            live_delete,
            ..ControllerConfig::default()
        }
    }

    fn add(fake: &FakeProvider, name: &str, status: InstanceStatus, max: Option<u64>) {
        let mut metadata = BTreeMap::new();
        if let Some(m) = max {
            metadata.insert(metadata_keys::MAX_RUN_SECONDS.to_string(), m.to_string());
        }
        fake.add_instance(ProviderInstance {
            name: name.into(),
            zone: "z1".into(),
            status,
            metadata,
        });
    }

    fn op(fake: &FakeProvider, name: &str, kind: &str, at: DateTime<Utc>) {
        fake.add_operation(
            "z1",
            ZoneOperation {
                target_link: Some(format!("projects/p/zones/z1/instances/{name}")),
                target_id: None,
                zone: "z1".into(),
                operation_type: kind.into(),
                end_time: Some(format_provider_timestamp(at, -420)),
                status: "DONE".into(),
            },
        );
    }

    fn controller(fake: &Arc<FakeProvider>, clock: &Arc<FixedClock>, live_delete: bool) -> Controller {
        Controller::new(config(live_delete), fake.clone(), clock.clone())
    }

    #[tokio::test]
    async fn test_quiet_pass_reports_sentinel() {
        let fake = Arc::new(FakeProvider::new());
        add(&fake, "a-p-0", InstanceStatus::Running, None);
        op(&fake, "a-p-0", "start", t0());
        let clock = Arc::new(FixedClock::new(t0() + Duration::minutes(5)));

        let ctl = controller(&fake, &clock, false);
        let report = ctl.monitor().await.unwrap();
        assert!(report.is_quiet());
        assert!(fake.mutating_calls().is_empty());
        assert_eq!(ctl.metrics().quiet_passes_total.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_action_does_not_stop_pass() {
        let fake = Arc::new(FakeProvider::new());
        for name in ["a-p-0", "a-p-1"] {
            add(&fake, name, InstanceStatus::Terminated, None);
            op(&fake, name, "start", t0());
            op(&fake, name, "compute.instances.preempted", t0() + Duration::minutes(10));
        }
        fake.fail_on(CallKind::Start, "a-p-0");
        let clock = Arc::new(FixedClock::new(t0() + Duration::minutes(11)));

        let ctl = controller(&fake, &clock, false);
        let report = ctl.monitor().await.unwrap();
        assert_eq!(report.failures(), 1);
        assert_eq!(report.actions(), 1);
        let failed = report.lines().iter().find(|l| l.kind == LineKind::Failed).unwrap();
        assert!(failed.text.contains("provider returned 503"));
        assert_eq!(fake.status_of("a-p-1"), Some(InstanceStatus::Running));
        assert_eq!(ctl.metrics().provider_errors_total.get(), 1);
    }

    #[tokio::test]
    async fn test_live_delete_removes_completed() {
        let fake = Arc::new(FakeProvider::new());
        add(&fake, "a-p-0", InstanceStatus::Terminated, None);
        op(&fake, "a-p-0", "start", t0());
        op(&fake, "a-p-0", "compute.instances.guestTerminate", t0() + Duration::seconds(500));
        let clock = Arc::new(FixedClock::new(t0() + Duration::seconds(600)));

        let ctl = controller(&fake, &clock, true);
        let report = ctl.monitor().await.unwrap();
        assert!(report.mentions("a-p-0: completed, deleting"));
        assert_eq!(fake.count(CallKind::Delete), 1);
        assert_eq!(fake.status_of("a-p-0"), None);
        assert_eq!(ctl.metrics().deletes_total.get(), 1);
    }
}
