//! Line-per-instance audit trail returned by every controller operation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Shown when an operation ran and found nothing to do.
pub const NOTHING_TO_REPORT: &str = "nothing to report";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// A provider call was issued and succeeded.
    Action,
    /// Something was observed but deliberately not acted on.
    Observed,
    /// Admission declined; no provider call was made.
    Refused,
    /// A provider call failed; the text carries the provider error.
    Failed,
    /// The "nothing to report" marker.
    Quiet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLine {
    pub at: DateTime<Utc>,
    pub instance: Option<String>,
    pub kind: LineKind,
    pub text: String,
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.at.format("%Y-%m-%d %H:%M:%S"), self.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    lines: Vec<ReportLine>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, at: DateTime<Utc>, instance: Option<&str>, kind: LineKind, text: String) {
        self.lines.push(ReportLine {
            at,
            instance: instance.map(String::from),
            kind,
            text,
        });
    }

    pub fn action(&mut self, at: DateTime<Utc>, instance: &str, text: impl Into<String>) {
        self.push(at, Some(instance), LineKind::Action, text.into());
    }

    pub fn observed(&mut self, at: DateTime<Utc>, instance: &str, text: impl Into<String>) {
        self.push(at, Some(instance), LineKind::Observed, text.into());
    }

    pub fn refused(&mut self, at: DateTime<Utc>, instance: &str, text: impl Into<String>) {
        self.push(at, Some(instance), LineKind::Refused, text.into());
    }

    pub fn failed(&mut self, at: DateTime<Utc>, instance: Option<&str>, text: impl Into<String>) {
        self.push(at, instance, LineKind::Failed, text.into());
    }

    /// Append the sentinel if nothing else was reported.
    pub fn finish(mut self, at: DateTime<Utc>) -> Self {
        if self.lines.is_empty() {
            self.push(at, None, LineKind::Quiet, NOTHING_TO_REPORT.to_string());
        }
        self
    }

    pub fn lines(&self) -> &[ReportLine] {
        &self.lines
    }

    pub fn count(&self, kind: LineKind) -> usize {
        self.lines.iter().filter(|l| l.kind == kind).count()
    }

    /// Provider calls that went through.
    pub fn actions(&self) -> usize {
        self.count(LineKind::Action)
    }

    pub fn failures(&self) -> usize {
        self.count(LineKind::Failed)
    }

    pub fn is_quiet(&self) -> bool {
        self.lines.len() == 1 && self.lines[0].kind == LineKind::Quiet
    }

    /// Whether any line mentions `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.text.contains(needle))
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_empty_report_gets_sentinel() {
        let report = Report::new().finish(at());
        assert!(report.is_quiet());
        assert_eq!(report.to_string(), "[2023-11-14 22:13:20] nothing to report\n");
    }

    #[test]
    fn test_sentinel_not_added_after_findings() {
        let mut report = Report::new();
        report.observed(at(), "a-p-0", "a-p-0: eligible for delete (not executed)");
        let report = report.finish(at());
        assert!(!report.is_quiet());
        assert_eq!(report.actions(), 0);
        assert!(report.mentions("eligible for delete"));
    }

    #[test]
    fn test_counts_by_kind() {
        let mut report = Report::new();
        report.action(at(), "a", "a: preempted, restarting");
        report.failed(at(), Some("b"), "b: FAILED reset: provider returned 503: x");
        assert_eq!(report.actions(), 1);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.lines()[1].instance.as_deref(), Some("b"));
    }
}
