//! spotctl performance benchmarks using Criterion.
//!
//! Run with: `cargo bench -p spot-bench`

use chrono::{DateTime, Duration, Utc};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use spot_cache::{Inventory, TimelineMap};
use spot_lifecycle::{LifecycleDeriver, decide_action, pick_zone};
use spot_proto::{InstanceRecord, InstanceStatus, OperationEvent, OperationType, instance_name};

const FLEET: u32 = 500;
const ZONES: [&str; 4] = ["us-west1-a", "us-west1-b", "us-west1-c", "us-central1-a"];

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_709_280_000, 0).unwrap_or_default()
}

fn zone(i: u32) -> &'static str {
    ZONES[i as usize % ZONES.len()]
}

/// A week of daily runs per instance: start, then either completion or
/// preemption followed by a restart.
fn make_events() -> Vec<OperationEvent> {
    let mut events = Vec::new();
    for i in 0..FLEET {
        let name = instance_name("bench", i);
        for day in 0..7i64 {
            let base = t0() + Duration::days(day) + Duration::seconds(i64::from(i));
            let mut push = |operation_type, offset| {
                events.push(OperationEvent {
                    target: name.clone(),
                    zone: zone(i).to_string(),
                    operation_type,
                    end_time: base + Duration::seconds(offset),
                });
            };
            push(OperationType::Start, 0);
            if (i + day as u32) % 3 == 0 {
                push(OperationType::Preempted, 1800);
                push(OperationType::Start, 1860);
            }
            push(OperationType::Complete, 7200);
        }
    }
    events.sort_by(|a, b| b.end_time.cmp(&a.end_time));
    events
}

fn make_records() -> Vec<InstanceRecord> {
    (0..FLEET)
        .map(|i| InstanceRecord {
            name: instance_name("bench", i),
            zone: zone(i).to_string(),
            status: if i % 5 == 0 { InstanceStatus::Terminated } else { InstanceStatus::Running },
            max_run_seconds: Some(10_800),
        })
        .collect()
}

// ─── bench_timeline_build ─────────────────────────────────────────────────────

/// Group a week of operations into per-instance timelines.
///
/// Runs on every operation-log refresh, i.e. after each mutating action.
fn bench_timeline_build(c: &mut Criterion) {
    let events = make_events();

    c.bench_function("timeline_build_500", |b| {
        b.iter(|| {
            let map = TimelineMap::build(black_box(&events));
            black_box(map.len())
        });
    });
}

// ─── bench_fleet_derivation ───────────────────────────────────────────────────

/// Derive a status row and a decision for every live instance.
fn bench_fleet_derivation(c: &mut Criterion) {
    let timelines = TimelineMap::build(&make_events());
    let records = make_records();
    let now = t0() + Duration::days(7);

    c.bench_function("fleet_derivation_500", |b| {
        b.iter(|| {
            let deriver = LifecycleDeriver::new(black_box(&timelines), now);
            let mutating = records
                .iter()
                .map(|r| decide_action(&deriver.snapshot(r), false))
                .filter(|a| a.is_mutating())
                .count();
            black_box(mutating)
        });
    });
}

// ─── bench_zone_selection ─────────────────────────────────────────────────────

/// Pick the least-loaded zone across the fleet.
///
/// Called once per admission request that has to create.
fn bench_zone_selection(c: &mut Criterion) {
    let inventory = Inventory::from_records(make_records());
    let zones: Vec<String> = ZONES.iter().map(|z| z.to_string()).collect();

    c.bench_function("zone_selection_500", |b| {
        b.iter(|| black_box(pick_zone(black_box(&zones), &inventory, 200)));
    });
}

// ─── Criterion groups ─────────────────────────────────────────────────────────

criterion_group!(benches, bench_timeline_build, bench_fleet_derivation, bench_zone_selection);
criterion_main!(benches);
