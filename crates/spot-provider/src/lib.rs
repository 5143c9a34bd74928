//! Compute provider capability for spotctl.
//!
//! The controller never talks HTTP itself; it calls through [`Provider`].
//! [`ComputeProvider`] is the Compute Engine REST adapter and
//! [`FakeProvider`] is the scripted in-memory double used by tests.
//! Every call is a single round-trip with no built-in retry.

#![forbid(unsafe_code)]

mod compute;
mod fake;

pub use compute::{AccessToken, ComputeProvider};
pub use fake::{CallKind, FakeProvider, ProviderCall};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spot_proto::{metadata_keys, ImageRef, InstancePage, InstanceStatus, ZoneOperation};
use std::collections::BTreeMap;
use thiserror::Error;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("decode error: {0}")]
    Decode(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

// ─── Provider trait ───────────────────────────────────────────────────────────

/// The provider capability consumed by the controller.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// One page of live instances in `zone`. Callers loop on `next_page_token`.
    async fn list_instances(&self, zone: &str, page_token: Option<&str>) -> ProviderResult<InstancePage>;

    /// All recorded operations in `zone`, in provider order.
    async fn list_zone_operations(&self, zone: &str) -> ProviderResult<Vec<ZoneOperation>>;

    async fn start_instance(&self, zone: &str, name: &str) -> ProviderResult<()>;
    async fn reset_instance(&self, zone: &str, name: &str) -> ProviderResult<()>;
    async fn stop_instance(&self, zone: &str, name: &str) -> ProviderResult<()>;
    async fn delete_instance(&self, zone: &str, name: &str) -> ProviderResult<()>;
    async fn create_instance(&self, zone: &str, req: &CreateInstanceRequest) -> ProviderResult<()>;

    async fn get_instance_status(&self, zone: &str, name: &str) -> ProviderResult<InstanceStatus>;

    /// Resolve an image family to a concrete disk image self-link.
    async fn get_image(&self, image: &ImageRef) -> ProviderResult<String>;
}

// ─── Instance creation ────────────────────────────────────────────────────────

/// Everything needed to insert one preemptible batch instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub machine_type: String,
    pub source_image: String,
    pub disk_size_gb: u32,
    pub preemptible: bool,
    pub metadata: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub scopes: Vec<String>,
}

/// Per-group job parameters attached to the instance as metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMetadata<'a> {
    pub timezone: &'a str,
    pub bucket_uri: &'a str,
    pub docker_image: &'a str,
    pub site_name: &'a str,
    pub start_hour: u8,
    pub day_offset: u32,
    pub max_run_seconds: Option<u64>,
}

impl JobMetadata<'_> {
    /// Metadata items, including the boot-time startup payload.
    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        let mut items = BTreeMap::from([
            (metadata_keys::TIMEZONE.to_string(), self.timezone.to_string()),
            (metadata_keys::BUCKET_URI.to_string(), self.bucket_uri.to_string()),
            (metadata_keys::DOCKER_IMAGE.to_string(), self.docker_image.to_string()),
            (metadata_keys::SITE_NAME.to_string(), self.site_name.to_string()),
            (metadata_keys::START_HOUR.to_string(), self.start_hour.to_string()),
            (metadata_keys::DAY_OFFSET.to_string(), self.day_offset.to_string()),
            (metadata_keys::STARTUP_SCRIPT.to_string(), startup_script()),
        ]);
        if let Some(max) = self.max_run_seconds {
            items.insert(metadata_keys::MAX_RUN_SECONDS.to_string(), max.to_string());
        }
        items
    }
}

/// Label applied to every instance this controller creates.
pub const MANAGED_BY_LABEL: (&str, &str) = ("managed_by", "spotctl");

// ─── Startup script ───────────────────────────────────────────────────────────

/// Boot-time payload: run the group's container once, ship results, power off.
///
/// All job parameters are read back from instance metadata so one script
/// serves every group.
pub fn startup_script() -> String {
    r#"#!/bin/bash
set -uo pipefail

md() {
  curl -sSf "http://metadata.google.internal/computeMetadata/v1/instance/attributes/$1" -H "Metadata-Flavor: Google"
}

DAY_OFFSET="$(md day_offset || echo 0)"
JOB_TZ="$(md TZ)"
DOCKER_IMAGE="$(md docker_image)"
BUCKET_URI="$(md bucket_uri)"
SITE_NAME="$(md site_name)"
START_HOUR="$(md starthh)"

RUN_DATE="$(TZ="$JOB_TZ" date "+%Y%m%d")"
FCST_DATE="$(TZ="$JOB_TZ" date -d "+${DAY_OFFSET} days" "+%Y%m%d")"
JOB_START_HOUR=$(( START_HOUR + DAY_OFFSET * 24 ))

gsutil_cp() {
  docker run --rm -v /tmp:/tmp google/cloud-sdk:slim gsutil -m cp "$@"
}

mkdir -p /tmp/OUT /tmp/LOG
docker pull "$DOCKER_IMAGE"
docker run --rm \
  --log-driver=gcplogs \
  --net=host \
  -v /tmp/OUT:/root/rasp/${SITE_NAME}/OUT/ \
  -v /tmp/LOG:/root/rasp/${SITE_NAME}/LOG/ \
  -e START_HOUR="$JOB_START_HOUR" \
  "$DOCKER_IMAGE"

gsutil_cp /tmp/OUT/* "${BUCKET_URI}/${RUN_DATE}/${FCST_DATE}/FCST/"
tar -C /tmp/LOG/ -czf "/tmp/${RUN_DATE}_${FCST_DATE}_logs.tgz" .
gsutil_cp "/tmp/${RUN_DATE}_${FCST_DATE}_logs.tgz" "${BUCKET_URI}/logs/"
touch "/tmp/${RUN_DATE}_${FCST_DATE}.exists"
gsutil_cp "/tmp/${RUN_DATE}_${FCST_DATE}.exists" "${BUCKET_URI}/index/"

docker image prune -f
docker container prune -f

shutdown -h now
"#
    .to_string()
}
