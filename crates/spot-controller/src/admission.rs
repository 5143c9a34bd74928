//! Admission: start-or-create, stop and stop-all.

use crate::{Controller, ControllerError, ControllerResult, InstanceAction, Report};
use spot_config::GroupConfig;
use spot_lifecycle::pick_zone;
use spot_observe::{ActionKind, ActionOutcome};
use spot_proto::instance_name;
use spot_provider::{CreateInstanceRequest, JobMetadata};
use std::collections::BTreeMap;
use tracing::{info, warn};

impl Controller {
    /// Start `{group}-p-{index}` if it exists, otherwise create it in the
    /// least-loaded zone. When every zone is at capacity the request is
    /// refused and nothing is sent to the provider.
    ///
    /// Only creation needs the group's job settings, so an existing instance
    /// is started even if its group is no longer configured.
    pub async fn start_or_create(&self, group: &str, index: u32) -> ControllerResult<Report> {
        let name = instance_name(group, index);
        let inventory = self.inventory.snapshot().await?;
        let mut report = Report::new();

        if let Some(record) = inventory.get(&name) {
            self.act(InstanceAction::Start, &record.zone, &name).await?;
            self.metrics.record_start();
            report.action(self.clock.now(), &name, format!("Starting instance: {name}"));
            return Ok(report.finish(self.clock.now()));
        }

        let group_config = self
            .config
            .group(group)
            .ok_or_else(|| ControllerError::UnknownGroup(group.to_string()))?;

        let Some(target) = pick_zone(&self.config.zones, &inventory, self.config.capacity_per_zone) else {
            let reason = format!(
                "no zone available for {name}: all {} zones at capacity {}",
                self.config.zones.len(),
                self.config.capacity_per_zone
            );
            self.metrics.record_refusal();
            self.audit.record(
                self.clock.now(),
                &name,
                None,
                ActionKind::Create,
                ActionOutcome::Refused,
                Some(reason.clone()),
            );
            report.refused(self.clock.now(), &name, reason);
            return Ok(report.finish(self.clock.now()));
        };

        let source_image = match self.provider.get_image(&self.config.boot_image).await {
            Ok(link) => link,
            Err(e) => {
                self.metrics.record_provider_error();
                return Err(e.into());
            }
        };
        let request = self.create_request(&name, group, group_config, source_image);

        let result = self.provider.create_instance(&target.zone, &request).await;
        self.invalidate_caches();
        self.audit_result(ActionKind::Create, &target.zone, &name, &result);
        result?;

        self.metrics.record_create();
        info!(instance = %name, zone = %target.zone, load = target.active, "instance created");
        report.action(
            self.clock.now(),
            &name,
            format!("Creating instance: {name} in {}", target.zone),
        );
        Ok(report.finish(self.clock.now()))
    }

    /// Stop `{group}-p-{index}` if it exists; otherwise nothing happens.
    pub async fn stop(&self, group: &str, index: u32) -> ControllerResult<Report> {
        let name = instance_name(group, index);
        let inventory = self.inventory.snapshot().await?;
        let mut report = Report::new();

        match inventory.get(&name) {
            Some(record) => {
                self.act(InstanceAction::Stop, &record.zone, &name).await?;
                self.metrics.record_stop();
                report.action(self.clock.now(), &name, format!("Stopping instance: {name}"));
            }
            None => {
                info!(instance = %name, "stop requested for an instance that does not exist");
                report.observed(self.clock.now(), &name, format!("{name}: not found, nothing to stop"));
            }
        }
        Ok(report.finish(self.clock.now()))
    }

    /// Stop every live instance in every group. A failure on one instance is
    /// reported and the rest are still stopped.
    pub async fn stop_all(&self) -> ControllerResult<Report> {
        let inventory = self.inventory.snapshot().await?;
        let mut report = Report::new();

        for record in inventory.iter() {
            match self.act(InstanceAction::Stop, &record.zone, &record.name).await {
                Ok(()) => {
                    self.metrics.record_stop();
                    report.action(
                        self.clock.now(),
                        &record.name,
                        format!("Stopping instance: {}", record.name),
                    );
                }
                Err(e) => {
                    warn!(instance = %record.name, error = %e, "stop failed, continuing");
                    report.failed(
                        self.clock.now(),
                        Some(&record.name),
                        format!("{}: FAILED stop: {e}", record.name),
                    );
                }
            }
        }
        Ok(report.finish(self.clock.now()))
    }

    fn create_request(
        &self,
        name: &str,
        group: &str,
        group_config: &GroupConfig,
        source_image: String,
    ) -> CreateInstanceRequest {
        let job = JobMetadata {
            timezone: &group_config.timezone,
            bucket_uri: &group_config.bucket_uri,
            docker_image: &group_config.docker_image,
            site_name: &group_config.site_name,
            start_hour: group_config.start_hour,
            day_offset: group_config.day_offset,
            max_run_seconds: group_config.max_run_seconds,
        };
        CreateInstanceRequest {
            name: name.to_string(),
            machine_type: self.config.machine_type.clone(),
            source_image,
            disk_size_gb: self.config.disk_size_gb,
            preemptible: true,
            metadata: job.to_metadata(),
            labels: BTreeMap::from([("spot_group".to_string(), group.to_string())]),
            scopes: self.config.service_account_scopes.clone(),
        }
    }
}
