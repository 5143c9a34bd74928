//! Shared fixtures for the scenario tests: a scripted fleet on a
//! [`FakeProvider`] with a manually driven clock.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use spot_config::{ControllerConfig, GroupConfig};
use spot_controller::Controller;
use spot_proto::{
    FixedClock, InstanceStatus, OPERATION_DONE, ProviderInstance, ZoneOperation,
    format_provider_timestamp, metadata_keys,
};
use spot_provider::FakeProvider;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const GROUP: &str = "site-a";

/// Reference instant every scenario is expressed against.
pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_709_280_000, 0).unwrap_or_default()
}

pub fn secs(n: i64) -> Duration {
    Duration::seconds(n)
}

/// A scripted fleet: provider state, clock and controller config.
pub struct Fleet {
    pub fake: Arc<FakeProvider>,
    pub clock: Arc<FixedClock>,
    pub config: ControllerConfig,
}

impl Fleet {
    pub fn new(zones: &[&str]) -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            GROUP.to_string(),
            GroupConfig {
                timezone: "America/Los_Angeles".to_string(),
                bucket_uri: "gs://blipmaps/site-a".to_string(),
                docker_image: "gcr.io/blipmaps/site-a:latest".to_string(),
                site_name: "SITE_A".to_string(),
                start_hour: 7,
                day_offset: 0,
                max_run_seconds: Some(700),
            },
        );
        let config = ControllerConfig {
            project: "blipmaps".to_string(),
            zones: zones.iter().map(|z| z.to_string()).collect(),
            groups,
            ..ControllerConfig::default()
        };
        Self {
            fake: Arc::new(FakeProvider::new()),
            clock: Arc::new(FixedClock::new(t0())),
            config,
        }
    }

    pub fn capacity(mut self, per_zone: u32) -> Self {
        self.config.capacity_per_zone = per_zone;
        self
    }

    pub fn live_delete(mut self, on: bool) -> Self {
        self.config.live_delete = on;
        self
    }

    /// Have the fake log a `DONE` operation for each successful mutation.
    pub fn logging_mutations(mut self) -> Self {
        let fake = FakeProvider::new().with_clock(self.clock.clone());
        self.fake = Arc::new(fake);
        self
    }

    pub fn instance(&self, name: &str, zone: &str, status: InstanceStatus, max_run: Option<u64>) {
        let mut metadata = BTreeMap::new();
        if let Some(max) = max_run {
            metadata.insert(metadata_keys::MAX_RUN_SECONDS.to_string(), max.to_string());
        }
        self.fake.add_instance(ProviderInstance {
            name: name.to_string(),
            zone: format!("https://www.googleapis.com/compute/v1/projects/blipmaps/zones/{zone}"),
            status,
            metadata,
        });
    }

    /// Record a finished operation of `kind` against `name` at `at`.
    pub fn event(&self, name: &str, zone: &str, kind: &str, at: DateTime<Utc>) {
        self.fake.add_operation(
            zone,
            ZoneOperation {
                target_link: Some(format!(
                    "https://www.googleapis.com/compute/v1/projects/blipmaps/zones/{zone}/instances/{name}"
                )),
                target_id: Some("4711".to_string()),
                zone: format!("https://www.googleapis.com/compute/v1/projects/blipmaps/zones/{zone}"),
                operation_type: kind.to_string(),
                end_time: Some(format_provider_timestamp(at, -420)),
                status: OPERATION_DONE.to_string(),
            },
        );
    }

    pub fn at(&self, now: DateTime<Utc>) {
        self.clock.set(now);
    }

    pub fn controller(&self) -> Controller {
        Controller::new(self.config.clone(), self.fake.clone(), self.clock.clone())
    }
}
