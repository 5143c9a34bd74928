//! Operator CLI library for the preemptible batch instance controller.
//!
//! The binary in `main.rs` parses arguments and drives a
//! [`spot_controller::Controller`]; this library holds the pieces worth
//! testing on their own: controller wiring plus status and audit rendering.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use spot_config::ControllerConfig;
use spot_controller::Controller;
use spot_lifecycle::LifecycleSnapshot;
use spot_observe::ActionAuditEntry;
use spot_proto::SystemClock;
use spot_provider::{AccessToken, ComputeProvider};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

/// Load the config (with environment overrides) and wire a controller
/// against the live Compute Engine API.
pub fn controller_from_path(path: &Path) -> anyhow::Result<Controller> {
    let config = ControllerConfig::load_with_env(path)?;
    let provider = ComputeProvider::new(config.project.clone(), AccessToken::from_env())?;
    Ok(Controller::new(config, Arc::new(provider), Arc::new(SystemClock)))
}

/// `3725` → `1h02m05s`; negative input renders as zero.
pub fn format_secs(secs: i64) -> String {
    let secs = secs.max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn yes_no(b: bool) -> &'static str {
    if b { "yes" } else { "no" }
}

/// Fixed-width table, one row per instance.
pub fn render_status_table(rows: &[LifecycleSnapshot]) -> String {
    const HEADERS: [&str; 12] = [
        "NAME",
        "ZONE",
        "STATUS",
        "LAST START",
        "LAST COMPLETION",
        "CURRENT RUN",
        "LAST RUN",
        "PREEMPTED",
        "PREEMPTIONS",
        "COMPLETED",
        "LIVE SPAN",
        "MAX RUN",
    ];

    let cells: Vec<[String; 12]> = rows
        .iter()
        .map(|r| {
            [
                r.name.clone(),
                r.zone.clone(),
                r.status.to_string(),
                format_time(r.last_start),
                format_time(r.last_completion),
                format_secs(r.current_run_secs),
                format_secs(r.last_run_secs),
                yes_no(r.preempted).to_string(),
                r.preemption_count.to_string(),
                yes_no(r.completed).to_string(),
                format_secs(r.live_span_secs),
                r.max_run_seconds
                    .map(|m| format_secs(i64::try_from(m).unwrap_or(i64::MAX)))
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut line = |fields: &[&str]| {
        let joined = fields
            .iter()
            .zip(widths)
            .map(|(f, w)| format!("{f:<w$}"))
            .collect::<Vec<_>>()
            .join("  ");
        let _ = writeln!(out, "{}", joined.trim_end());
    };
    line(&HEADERS);
    for row in &cells {
        let refs: Vec<&str> = row.iter().map(String::as_str).collect();
        line(&refs);
    }
    if rows.is_empty() {
        let _ = writeln!(out, "(no live instances)");
    }
    out
}

/// One line per audit entry, newest first as given.
pub fn render_audit_table(entries: &[ActionAuditEntry]) -> String {
    if entries.is_empty() {
        return "(no actions recorded)\n".to_string();
    }
    let mut out = String::new();
    for e in entries {
        let _ = write!(
            out,
            "{}  {:<8}  {:<8}  {}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", e.kind).to_lowercase(),
            format!("{:?}", e.outcome).to_lowercase(),
            e.instance
        );
        if let Some(zone) = &e.zone {
            let _ = write!(out, " ({zone})");
        }
        if let Some(detail) = &e.detail {
            let _ = write!(out, ": {detail}");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use spot_proto::InstanceStatus;

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(0), "0s");
        assert_eq!(format_secs(-5), "0s");
        assert_eq!(format_secs(59), "59s");
        assert_eq!(format_secs(61), "1m01s");
        assert_eq!(format_secs(3725), "1h02m05s");
    }

    #[test]
    fn test_status_table_aligns_columns() {
        let row = LifecycleSnapshot {
            name: "rasp-blipmap-bayarea-4k-p-0".into(),
            zone: "us-west1-a".into(),
            status: InstanceStatus::Running,
            last_start: DateTime::from_timestamp(1_700_000_000, 0),
            last_completion: None,
            last_preemption: None,
            current_run_secs: 600,
            last_run_secs: 0,
            preempted: false,
            preemption_count: 0,
            completed: false,
            live_span_secs: 0,
            max_run_seconds: Some(7200),
            over_budget: false,
        };
        let table = render_status_table(&[row]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("NAME"));
        assert!(lines[1].starts_with("rasp-blipmap-bayarea-4k-p-0  us-west1-a"));
        assert!(lines[1].contains("2023-11-14 22:13:20"));
        assert!(lines[1].contains("10m00s"));
        assert!(lines[1].ends_with("2h00m00s"));
        assert_eq!(lines[0].find("ZONE"), lines[1].find("us-west1-a"));
    }

    #[test]
    fn test_audit_table_lines() {
        use spot_observe::{ActionAuditLog, ActionKind, ActionOutcome};

        let log = ActionAuditLog::new(10);
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        log.record(at, "site-p-0", Some("us-west1-a"), ActionKind::Start, ActionOutcome::Success, None);
        log.record(
            at,
            "site-p-1",
            None,
            ActionKind::Create,
            ActionOutcome::Refused,
            Some("no zone available".into()),
        );

        let table = render_audit_table(&log.query(None, None, 10));
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("2023-11-14 22:13:20  create    refused   site-p-1"));
        assert!(lines[0].ends_with(": no zone available"));
        assert!(lines[1].ends_with("site-p-0 (us-west1-a)"));

        assert_eq!(render_audit_table(&[]), "(no actions recorded)\n");
    }

    #[test]
    fn test_status_table_empty() {
        assert!(render_status_table(&[]).contains("(no live instances)"));
    }

    #[test]
    fn test_controller_from_missing_path_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(controller_from_path(&dir.path().join("absent.json")).is_err());
    }
}
