//! Per-instance event timelines derived from the filtered operation log.

use crate::{CacheError, CacheResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use spot_proto::{EventCategory, OperationEvent};
use std::collections::HashMap;

/// Timestamps per event category for one instance, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceTimeline {
    starts: Vec<DateTime<Utc>>,
    stops: Vec<DateTime<Utc>>,
    completions: Vec<DateTime<Utc>>,
    preemptions: Vec<DateTime<Utc>>,
    creations: Vec<DateTime<Utc>>,
    deletions: Vec<DateTime<Utc>>,
}

static EMPTY: InstanceTimeline = InstanceTimeline {
    starts: Vec::new(),
    stops: Vec::new(),
    completions: Vec::new(),
    preemptions: Vec::new(),
    creations: Vec::new(),
    deletions: Vec::new(),
};

impl InstanceTimeline {
    /// The timeline of an instance with no recorded history.
    pub fn empty() -> &'static Self {
        &EMPTY
    }

    /// Build from unordered events; categories are sorted on the way out.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a OperationEvent>) -> Self {
        let mut timeline = Self::default();
        for event in events {
            for category in event.operation_type.categories() {
                timeline.list_mut(*category).push(event.end_time);
            }
        }
        timeline.sort();
        timeline
    }

    fn list_mut(&mut self, category: EventCategory) -> &mut Vec<DateTime<Utc>> {
        match category {
            EventCategory::Start => &mut self.starts,
            EventCategory::Stop => &mut self.stops,
            EventCategory::Completion => &mut self.completions,
            EventCategory::Preemption => &mut self.preemptions,
            EventCategory::Creation => &mut self.creations,
            EventCategory::Deletion => &mut self.deletions,
        }
    }

    fn sort(&mut self) {
        for list in [
            &mut self.starts,
            &mut self.stops,
            &mut self.completions,
            &mut self.preemptions,
            &mut self.creations,
            &mut self.deletions,
        ] {
            list.sort_by(|a, b| b.cmp(a));
        }
    }

    /// All timestamps in `category`, descending.
    pub fn events(&self, category: EventCategory) -> &[DateTime<Utc>] {
        match category {
            EventCategory::Start => &self.starts,
            EventCategory::Stop => &self.stops,
            EventCategory::Completion => &self.completions,
            EventCategory::Preemption => &self.preemptions,
            EventCategory::Creation => &self.creations,
            EventCategory::Deletion => &self.deletions,
        }
    }

    /// Most recent timestamp in `category`.
    pub fn last(&self, category: EventCategory) -> Option<DateTime<Utc>> {
        self.events(category).first().copied()
    }

    /// Start, reset or insert.
    pub fn last_start(&self) -> Option<DateTime<Utc>> {
        self.last(EventCategory::Start)
    }

    pub fn last_stop(&self) -> Option<DateTime<Utc>> {
        self.last(EventCategory::Stop)
    }

    /// Guest-initiated shutdown.
    pub fn last_completion(&self) -> Option<DateTime<Utc>> {
        self.last(EventCategory::Completion)
    }

    pub fn last_preemption(&self) -> Option<DateTime<Utc>> {
        self.last(EventCategory::Preemption)
    }

    pub fn last_creation(&self) -> Option<DateTime<Utc>> {
        self.last(EventCategory::Creation)
    }

    pub fn last_deletion(&self) -> Option<DateTime<Utc>> {
        self.last(EventCategory::Deletion)
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
            && self.stops.is_empty()
            && self.completions.is_empty()
            && self.preemptions.is_empty()
            && self.creations.is_empty()
            && self.deletions.is_empty()
    }
}

/// Every instance's timeline, keyed by instance name. Built in one piece.
#[derive(Debug, Clone, Default)]
pub struct TimelineMap {
    timelines: HashMap<String, InstanceTimeline>,
    event_count: usize,
}

impl TimelineMap {
    /// Group filtered events by target instance.
    pub fn build(events: &[OperationEvent]) -> Self {
        let mut by_target: HashMap<&str, Vec<&OperationEvent>> = HashMap::new();
        for event in events {
            by_target.entry(event.target.as_str()).or_default().push(event);
        }
        let timelines = by_target
            .into_iter()
            .map(|(name, evs)| (name.to_string(), InstanceTimeline::from_events(evs)))
            .collect();
        Self {
            timelines,
            event_count: events.len(),
        }
    }

    /// Timeline for `name`, or [`CacheError::UnknownInstance`] if it was never seen.
    pub fn get(&self, name: &str) -> CacheResult<&InstanceTimeline> {
        self.timelines
            .get(name)
            .ok_or_else(|| CacheError::UnknownInstance(name.to_string()))
    }

    /// Timeline for `name`, or the empty timeline if it was never seen.
    pub fn get_or_empty(&self, name: &str) -> &InstanceTimeline {
        self.timelines.get(name).unwrap_or(InstanceTimeline::empty())
    }

    /// Whether `name` has any event in the window.
    pub fn contains(&self, name: &str) -> bool {
        self.timelines.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.timelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timelines.is_empty()
    }

    /// Events that survived filtering.
    pub fn event_count(&self) -> usize {
        self.event_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use spot_proto::OperationType;

    fn ev(target: &str, op: OperationType, at: DateTime<Utc>) -> OperationEvent {
        OperationEvent {
            target: target.to_string(),
            zone: "us-west1-a".to_string(),
            operation_type: op,
            end_time: at,
        }
    }

    #[test]
    fn test_timeline_collapses_and_sorts() {
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let events = vec![
            ev("a", OperationType::Insert, t0),
            ev("a", OperationType::Reset, t0 + Duration::minutes(30)),
            ev("a", OperationType::Start, t0 + Duration::minutes(10)),
            ev("a", OperationType::Preempted, t0 + Duration::minutes(20)),
            ev("b", OperationType::Complete, t0),
        ];
        let map = TimelineMap::build(&events);
        assert_eq!(map.len(), 2);
        assert_eq!(map.event_count(), 5);

        let a = map.get("a").unwrap();
        assert_eq!(
            a.events(EventCategory::Start),
            &[t0 + Duration::minutes(30), t0 + Duration::minutes(10), t0]
        );
        assert_eq!(a.last_start(), Some(t0 + Duration::minutes(30)));
        assert_eq!(a.last_creation(), Some(t0));
        assert_eq!(a.last_preemption(), Some(t0 + Duration::minutes(20)));
        assert_eq!(a.last_completion(), None);
    }

    #[test]
    fn test_unknown_vs_empty() {
        let map = TimelineMap::build(&[]);
        assert!(matches!(map.get("ghost"), Err(CacheError::UnknownInstance(n)) if n == "ghost"));
        let empty = map.get_or_empty("ghost");
        assert!(empty.is_empty());
        assert_eq!(empty.last_start(), None);
    }
}
