//! Scripted in-memory provider.
//!
//! Holds per-zone instances and operations, pages listings, records every
//! call, and applies the obvious status side-effects of mutating calls so a
//! post-action refresh observes post-action state. With a clock attached,
//! each successful mutating call also appends a matching `DONE` operation.

use crate::{CreateInstanceRequest, Provider, ProviderError, ProviderResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use spot_proto::{
    Clock, ImageRef, InstancePage, InstanceStatus, OPERATION_DONE, ProviderInstance, ZoneOperation,
    format_provider_timestamp,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    ListInstances,
    ListOperations,
    Start,
    Reset,
    Stop,
    Delete,
    Create,
    GetStatus,
    GetImage,
}

impl CallKind {
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Start | Self::Reset | Self::Stop | Self::Delete | Self::Create
        )
    }
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub kind: CallKind,
    pub zone: String,
    /// Instance name for per-instance calls, page token for listings.
    pub target: Option<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    instances: BTreeMap<String, Vec<ProviderInstance>>,
    operations: BTreeMap<String, Vec<ZoneOperation>>,
    calls: Vec<ProviderCall>,
    failures: HashSet<(CallKind, String)>,
    /// Listing failures keyed by zone, with the number of calls still allowed
    /// to succeed before they start failing.
    listing_failures: HashMap<(CallKind, String), usize>,
    created: Vec<(String, CreateInstanceRequest)>,
}

#[derive(Debug)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
    page_size: usize,
    clock: Option<Arc<dyn Clock>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            page_size: 2,
            clock: None,
        }
    }

    /// Instances per listing page; small by default so paging is exercised.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Append a `DONE` operation stamped with `clock` for every successful
    /// mutating call.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn add_instance(&self, instance: ProviderInstance) {
        let zone = spot_proto::resource_name(&instance.zone).to_string();
        self.state.lock().instances.entry(zone).or_default().push(instance);
    }

    pub fn add_operation(&self, zone: &str, op: ZoneOperation) {
        self.state
            .lock()
            .operations
            .entry(zone.to_string())
            .or_default()
            .push(op);
    }

    /// Make every `kind` call against `target` fail with a 503.
    pub fn fail_on(&self, kind: CallKind, target: &str) {
        self.state.lock().failures.insert((kind, target.to_string()));
    }

    /// Make every `kind` listing of `zone` fail with a 503.
    pub fn fail_listing(&self, kind: CallKind, zone: &str) {
        self.fail_listing_after(kind, zone, 0);
    }

    /// Let `successes` listings of `zone` through, then fail every later one.
    pub fn fail_listing_after(&self, kind: CallKind, zone: &str, successes: usize) {
        self.state
            .lock()
            .listing_failures
            .insert((kind, zone.to_string()), successes);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<ProviderCall> {
        self.calls().into_iter().filter(|c| c.kind.is_mutating()).collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.state.lock().calls.iter().filter(|c| c.kind == kind).count()
    }

    /// Create requests received so far, with their zones.
    pub fn created(&self) -> Vec<(String, CreateInstanceRequest)> {
        self.state.lock().created.clone()
    }

    pub fn status_of(&self, name: &str) -> Option<InstanceStatus> {
        self.state
            .lock()
            .instances
            .values()
            .flatten()
            .find(|i| i.name == name)
            .map(|i| i.status)
    }

    fn record(&self, kind: CallKind, zone: &str, target: Option<&str>) -> ProviderResult<()> {
        let mut state = self.state.lock();
        state.calls.push(ProviderCall {
            kind,
            zone: zone.to_string(),
            target: target.map(String::from),
        });
        if let Some(remaining) = state.listing_failures.get_mut(&(kind, zone.to_string())) {
            if *remaining == 0 {
                return Err(Self::injected(kind, zone));
            }
            *remaining -= 1;
        }
        if let Some(t) = target
            && state.failures.contains(&(kind, t.to_string()))
        {
            return Err(Self::injected(kind, t));
        }
        Ok(())
    }

    fn injected(kind: CallKind, target: &str) -> ProviderError {
        ProviderError::Status {
            code: 503,
            body: format!("injected {kind:?} failure for {target}"),
        }
    }

    fn log_operation(state: &mut FakeState, clock: Option<&Arc<dyn Clock>>, zone: &str, name: &str, op: &str) {
        let Some(clock) = clock else { return };
        state.operations.entry(zone.to_string()).or_default().push(ZoneOperation {
            target_link: Some(format!("projects/fake/zones/{zone}/instances/{name}")),
            target_id: None,
            zone: zone.to_string(),
            operation_type: op.to_string(),
            end_time: Some(format_provider_timestamp(clock.now(), -420)),
            status: OPERATION_DONE.to_string(),
        });
    }

    fn transition(&self, zone: &str, name: &str, status: InstanceStatus, op: &str) -> ProviderResult<()> {
        let mut state = self.state.lock();
        let instance = state
            .instances
            .get_mut(zone)
            .and_then(|list| list.iter_mut().find(|i| i.name == name))
            .ok_or_else(|| ProviderError::NotFound(format!("{zone}/{name}")))?;
        instance.status = status;
        Self::log_operation(&mut state, self.clock.as_ref(), zone, name, op);
        Ok(())
    }
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_instances(&self, zone: &str, page_token: Option<&str>) -> ProviderResult<InstancePage> {
        self.record(CallKind::ListInstances, zone, page_token)?;
        let offset: usize = match page_token {
            Some(t) => t
                .parse()
                .map_err(|_| ProviderError::Decode(format!("bad page token {t}")))?,
            None => 0,
        };
        let state = self.state.lock();
        let all = state.instances.get(zone).map(Vec::as_slice).unwrap_or(&[]);
        let end = (offset + self.page_size).min(all.len());
        let instances = all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(InstancePage {
            instances,
            next_page_token: (end < all.len()).then(|| end.to_string()),
        })
    }

    async fn list_zone_operations(&self, zone: &str) -> ProviderResult<Vec<ZoneOperation>> {
        self.record(CallKind::ListOperations, zone, None)?;
        Ok(self.state.lock().operations.get(zone).cloned().unwrap_or_default())
    }

    async fn start_instance(&self, zone: &str, name: &str) -> ProviderResult<()> {
        self.record(CallKind::Start, zone, Some(name))?;
        self.transition(zone, name, InstanceStatus::Running, "start")
    }

    async fn reset_instance(&self, zone: &str, name: &str) -> ProviderResult<()> {
        self.record(CallKind::Reset, zone, Some(name))?;
        self.transition(zone, name, InstanceStatus::Running, "reset")
    }

    async fn stop_instance(&self, zone: &str, name: &str) -> ProviderResult<()> {
        self.record(CallKind::Stop, zone, Some(name))?;
        self.transition(zone, name, InstanceStatus::Terminated, "stop")
    }

    async fn delete_instance(&self, zone: &str, name: &str) -> ProviderResult<()> {
        self.record(CallKind::Delete, zone, Some(name))?;
        let mut state = self.state.lock();
        let list = state.instances.entry(zone.to_string()).or_default();
        let before = list.len();
        list.retain(|i| i.name != name);
        if list.len() == before {
            return Err(ProviderError::NotFound(format!("{zone}/{name}")));
        }
        Self::log_operation(&mut state, self.clock.as_ref(), zone, name, "delete");
        Ok(())
    }

    async fn create_instance(&self, zone: &str, req: &CreateInstanceRequest) -> ProviderResult<()> {
        self.record(CallKind::Create, zone, Some(&req.name))?;
        let mut state = self.state.lock();
        state.instances.entry(zone.to_string()).or_default().push(ProviderInstance {
            name: req.name.clone(),
            zone: zone.to_string(),
            status: InstanceStatus::Running,
            metadata: req.metadata.clone(),
        });
        state.created.push((zone.to_string(), req.clone()));
        Self::log_operation(&mut state, self.clock.as_ref(), zone, &req.name, "insert");
        Ok(())
    }

    async fn get_instance_status(&self, zone: &str, name: &str) -> ProviderResult<InstanceStatus> {
        self.record(CallKind::GetStatus, zone, Some(name))?;
        let state = self.state.lock();
        state
            .instances
            .get(zone)
            .and_then(|list| list.iter().find(|i| i.name == name))
            .map(|i| i.status)
            .ok_or_else(|| ProviderError::NotFound(format!("{zone}/{name}")))
    }

    async fn get_image(&self, image: &ImageRef) -> ProviderResult<String> {
        self.record(CallKind::GetImage, "global", Some(&image.family))?;
        Ok(format!(
            "https://www.googleapis.com/compute/v1/projects/{}/global/images/{}-fake",
            image.project, image.family
        ))
    }
}
