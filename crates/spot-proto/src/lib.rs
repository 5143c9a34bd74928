//! Typed records shared across the spotctl preemptible-fleet controller.
//!
//! Defines the instance and operation records read from the provider, the
//! provider timestamp parser, and the clock/lookback-window primitives used
//! to bound which history is considered authoritative.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

// ─── Metadata keys ────────────────────────────────────────────────────────────

/// Instance metadata keys written at creation and read back by the boot script.
pub mod metadata_keys {
    pub const TIMEZONE: &str = "TZ";
    pub const BUCKET_URI: &str = "bucket_uri";
    pub const DOCKER_IMAGE: &str = "docker_image";
    pub const SITE_NAME: &str = "site_name";
    pub const START_HOUR: &str = "starthh";
    pub const DAY_OFFSET: &str = "day_offset";
    pub const MAX_RUN_SECONDS: &str = "max_run_seconds";
    pub const STARTUP_SCRIPT: &str = "startup-script";
}

/// Compose the canonical instance name for a logical group and index.
pub fn instance_name(group: &str, index: u32) -> String {
    format!("{group}-p-{index}")
}

/// Last path segment of a provider resource URL (`.../zones/us-west1-a` → `us-west1-a`).
pub fn resource_name(url_or_name: &str) -> &str {
    url_or_name.rsplit('/').next().unwrap_or(url_or_name)
}

/// Resolve an instance name from an operation's target link.
///
/// Only links that point at an instance (`.../instances/<name>`) resolve.
pub fn instance_from_target_link(target_link: &str) -> Option<&str> {
    let mut parts = target_link.rsplit('/');
    let name = parts.next()?;
    match parts.next() {
        Some("instances") if !name.is_empty() => Some(name),
        _ => None,
    }
}

// ─── Instance status ──────────────────────────────────────────────────────────

/// Provider-reported instance status. Treated as opaque apart from `TERMINATED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    Repairing,
    Terminated,
    #[default]
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "PROVISIONING",
            Self::Staging => "STAGING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Suspending => "SUSPENDING",
            Self::Suspended => "SUSPENDED",
            Self::Repairing => "REPAIRING",
            Self::Terminated => "TERMINATED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

// ─── Instances ────────────────────────────────────────────────────────────────

/// One instance as returned by a provider listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub name: String,
    pub zone: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// One page of an instance listing plus its continuation token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstancePage {
    pub instances: Vec<ProviderInstance>,
    pub next_page_token: Option<String>,
}

/// A live instance as held by the inventory cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub zone: String,
    pub status: InstanceStatus,
    /// Declared run budget. `None` means no timeout enforcement, never zero.
    pub max_run_seconds: Option<u64>,
}

impl InstanceRecord {
    /// Build a record from a listing entry. A missing or unparseable
    /// `max_run_seconds` metadata value leaves the budget unset, as does zero.
    pub fn from_provider(instance: &ProviderInstance) -> Self {
        let max_run_seconds = instance
            .metadata
            .get(metadata_keys::MAX_RUN_SECONDS)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|&max| max > 0);
        Self {
            name: instance.name.clone(),
            zone: resource_name(&instance.zone).to_string(),
            status: instance.status,
            max_run_seconds,
        }
    }
}

// ─── Operations ───────────────────────────────────────────────────────────────

/// A raw zone operation as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneOperation {
    #[serde(default)]
    pub target_link: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub zone: String,
    pub operation_type: String,
    #[serde(default)]
    pub end_time: Option<String>,
    pub status: String,
}

/// Terminal operation status; only operations in this state count.
pub const OPERATION_DONE: &str = "DONE";

/// Recognized operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Start,
    Reset,
    Stop,
    Insert,
    Delete,
    /// Guest-initiated shutdown: the job finished and the machine halted itself.
    Complete,
    Preempted,
}

impl OperationType {
    pub fn from_provider(op: &str) -> Option<Self> {
        match op {
            "start" => Some(Self::Start),
            "reset" => Some(Self::Reset),
            "stop" => Some(Self::Stop),
            "insert" => Some(Self::Insert),
            "delete" => Some(Self::Delete),
            "compute.instances.guestTerminate" | "guestTerminate" => Some(Self::Complete),
            "compute.instances.preempted" | "preempted" => Some(Self::Preempted),
            _ => None,
        }
    }

    /// Timeline categories this operation contributes a timestamp to.
    ///
    /// start, reset and insert all count as a start; insert is also a creation.
    pub fn categories(&self) -> &'static [EventCategory] {
        match self {
            Self::Start | Self::Reset => &[EventCategory::Start],
            Self::Insert => &[EventCategory::Start, EventCategory::Creation],
            Self::Stop => &[EventCategory::Stop],
            Self::Delete => &[EventCategory::Deletion],
            Self::Complete => &[EventCategory::Completion],
            Self::Preempted => &[EventCategory::Preemption],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Start,
    Stop,
    Completion,
    Preemption,
    Creation,
    Deletion,
}

/// A filtered, typed operation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationEvent {
    pub target: String,
    pub zone: String,
    pub operation_type: OperationType,
    pub end_time: DateTime<Utc>,
}

impl OperationEvent {
    /// Convert a raw operation, dropping anything that is not terminal, not a
    /// recognized type, not targeted at an instance, or lacks an end time.
    pub fn from_operation(op: &ZoneOperation) -> Option<Self> {
        if op.status != OPERATION_DONE {
            return None;
        }
        let operation_type = OperationType::from_provider(&op.operation_type)?;
        let target = instance_from_target_link(op.target_link.as_deref()?)?;
        let end_time = parse_provider_timestamp(op.end_time.as_deref()?).ok()?;
        Some(Self {
            target: target.to_string(),
            zone: resource_name(&op.zone).to_string(),
            operation_type,
            end_time,
        })
    }
}

// ─── Timestamps ───────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp too short: {0:?}")]
    TooShort(String),
    #[error("invalid utc offset in {0:?}")]
    Offset(String),
    #[error("invalid timestamp body in {0:?}")]
    Body(String),
}

/// Parse a provider timestamp such as `2016-10-12T07:43:51.345-07:00`.
///
/// The offset is split off explicitly: hours come from characters −6..−3 and
/// minutes from the last two characters (carrying the hours' sign). The
/// offset is subtracted from the naive local time to obtain UTC.
pub fn parse_provider_timestamp(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    let raw = raw.trim();
    if !raw.is_ascii() || raw.len() < 7 {
        return Err(TimestampError::TooShort(raw.to_string()));
    }
    let split = raw.len() - 6;
    let (body, offset) = raw.split_at(split);
    if offset.as_bytes()[3] != b':' {
        return Err(TimestampError::Offset(raw.to_string()));
    }

    let hours: i64 = offset[0..3]
        .parse()
        .map_err(|_| TimestampError::Offset(raw.to_string()))?;
    let minutes: i64 = offset[4..6]
        .parse()
        .map_err(|_| TimestampError::Offset(raw.to_string()))?;
    if !offset.starts_with(['+', '-']) || hours.abs() > 23 || minutes > 59 {
        return Err(TimestampError::Offset(raw.to_string()));
    }
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let offset_minutes = hours * 60 + sign * minutes;

    let naive = NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|_| TimestampError::Body(raw.to_string()))?;
    Ok(Utc.from_utc_datetime(&(naive - Duration::minutes(offset_minutes))))
}

/// Render a UTC instant the way the provider does, at a fixed `±HH:MM` offset.
pub fn format_provider_timestamp(at: DateTime<Utc>, offset_minutes: i32) -> String {
    let local = at.naive_utc() + Duration::minutes(i64::from(offset_minutes));
    let sign = if offset_minutes < 0 { '-' } else { '+' };
    let abs = offset_minutes.unsigned_abs();
    format!(
        "{}{sign}{:02}:{:02}",
        local.format("%Y-%m-%dT%H:%M:%S%.3f"),
        abs / 60,
        abs % 60
    )
}

// ─── Images ───────────────────────────────────────────────────────────────────

/// A boot image family reference, resolved to a concrete image at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub project: String,
    pub family: String,
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.family)
    }
}

impl Default for ImageRef {
    fn default() -> Self {
        Self {
            project: "cos-cloud".to_string(),
            family: "cos-stable".to_string(),
        }
    }
}

// ─── Clock & lookback window ──────────────────────────────────────────────────

/// Source of "now" for window filtering and elapsed-time derivation.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    millis: AtomicI64,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(at.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// How much operation history counts as recent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookbackWindow {
    pub days: u32,
}

impl LookbackWindow {
    pub fn days(days: u32) -> Self {
        Self { days }
    }

    /// Oldest instant still inside the window. Saturates at the earliest
    /// representable time instead of overflowing.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Duration::try_days(i64::from(self.days))
            .and_then(|span| now.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Events newer than `now` (provider clock ahead of ours) are kept.
    pub fn contains(&self, now: DateTime<Utc>, at: DateTime<Utc>) -> bool {
        at >= self.start(now)
    }
}

impl Default for LookbackWindow {
    fn default() -> Self {
        Self::days(7)
    }
}
