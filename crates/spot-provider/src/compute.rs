//! Compute Engine REST adapter.

use crate::{CreateInstanceRequest, MANAGED_BY_LABEL, Provider, ProviderError, ProviderResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use spot_proto::{ImageRef, InstancePage, InstanceStatus, ProviderInstance, ZoneOperation};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

const API_BASE: &str = "https://compute.googleapis.com/compute/v1";
const TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

// ─── Access tokens ────────────────────────────────────────────────────────────

/// Where bearer tokens come from.
#[derive(Debug)]
pub enum AccessToken {
    /// A fixed token, e.g. from `gcloud auth print-access-token`.
    Static(String),
    /// The default service account of the machine we run on.
    MetadataServer {
        cached: Mutex<Option<(String, Instant)>>,
    },
}

impl AccessToken {
    /// `SPOTCTL_ACCESS_TOKEN` if set, otherwise the metadata server.
    pub fn from_env() -> Self {
        match std::env::var("SPOTCTL_ACCESS_TOKEN") {
            Ok(token) if !token.is_empty() => Self::Static(token),
            _ => Self::MetadataServer {
                cached: Mutex::new(None),
            },
        }
    }

    async fn bearer(&self, client: &reqwest::Client) -> ProviderResult<String> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::MetadataServer { cached } => {
                let mut guard = cached.lock().await;
                if let Some((token, expires)) = guard.as_ref()
                    && Instant::now() < *expires
                {
                    return Ok(token.clone());
                }

                let resp = client
                    .get(TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(ProviderError::Auth(format!(
                        "metadata server returned {}",
                        resp.status()
                    )));
                }
                let token: TokenResponse = resp
                    .json()
                    .await
                    .map_err(|e| ProviderError::Auth(format!("token response: {e}")))?;

                // Refresh a minute early.
                let ttl = Duration::from_secs(token.expires_in.saturating_sub(60));
                *guard = Some((token.access_token.clone(), Instant::now() + ttl));
                debug!(ttl_secs = ttl.as_secs(), "refreshed access token");
                Ok(token.access_token)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

// ─── Provider ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ComputeProvider {
    project: String,
    base_url: String,
    token: AccessToken,
    client: reqwest::Client,
}

impl ComputeProvider {
    pub fn new(project: impl Into<String>, token: AccessToken) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            project: project.into(),
            base_url: API_BASE.to_string(),
            token,
            client,
        })
    }

    /// Point the adapter at a different API root (emulators, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn zone_url(&self, zone: &str) -> String {
        format!("{}/projects/{}/zones/{}", self.base_url, self.project, zone)
    }

    fn instance_url(&self, zone: &str, name: &str) -> String {
        format!("{}/instances/{}", self.zone_url(zone), name)
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> ProviderResult<Value> {
        let bearer = self.token.bearer(&self.client).await?;
        let resp = req.bearer_auth(bearer).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                code: status.as_u16(),
                body,
            });
        }
        resp.json()
            .await
            .map_err(|e| ProviderError::Decode(format!("{what}: {e}")))
    }

    async fn instance_action(&self, zone: &str, name: &str, action: &str) -> ProviderResult<()> {
        let url = format!("{}/{}", self.instance_url(zone, name), action);
        self.send(self.client.post(url), &format!("{action} {zone}/{name}"))
            .await?;
        info!(zone, instance = name, action, "instance action submitted");
        Ok(())
    }

    fn insert_body(&self, zone: &str, req: &CreateInstanceRequest) -> Value {
        let metadata_items: Vec<Value> = req
            .metadata
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v }))
            .collect();
        let mut labels = req.labels.clone();
        labels.insert(MANAGED_BY_LABEL.0.to_string(), MANAGED_BY_LABEL.1.to_string());

        json!({
            "name": req.name,
            "machineType": format!("zones/{zone}/machineTypes/{}", req.machine_type),
            "scheduling": {
                "preemptible": req.preemptible,
                "automaticRestart": !req.preemptible,
                "onHostMaintenance": if req.preemptible { "TERMINATE" } else { "MIGRATE" },
            },
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "initializeParams": {
                    "sourceImage": req.source_image,
                    "diskSizeGb": req.disk_size_gb.to_string(),
                },
            }],
            "networkInterfaces": [{
                "network": "global/networks/default",
                "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }],
            }],
            "serviceAccounts": [{
                "email": "default",
                "scopes": req.scopes,
            }],
            "metadata": { "items": metadata_items },
            "labels": labels,
        })
    }
}

#[async_trait]
impl Provider for ComputeProvider {
    fn name(&self) -> &str {
        "compute"
    }

    async fn list_instances(&self, zone: &str, page_token: Option<&str>) -> ProviderResult<InstancePage> {
        let mut req = self.client.get(format!("{}/instances", self.zone_url(zone)));
        if let Some(token) = page_token {
            req = req.query(&[("pageToken", token)]);
        }
        let value = self.send(req, &format!("list instances {zone}")).await?;
        let list: ListInstancesResponse = serde_json::from_value(value)
            .map_err(|e| ProviderError::Decode(format!("instance list: {e}")))?;

        Ok(InstancePage {
            instances: list.items.into_iter().map(RawInstance::into_instance).collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn list_zone_operations(&self, zone: &str) -> ProviderResult<Vec<ZoneOperation>> {
        let mut all = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .get(format!("{}/operations", self.zone_url(zone)))
                .query(&[("maxResults", "500")]);
            if let Some(token) = page_token.as_deref() {
                req = req.query(&[("pageToken", token)]);
            }
            let value = self.send(req, &format!("list operations {zone}")).await?;
            let page: ListOperationsResponse = serde_json::from_value(value)
                .map_err(|e| ProviderError::Decode(format!("operation list: {e}")))?;
            all.extend(page.items);

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(zone, count = all.len(), "listed zone operations");
        Ok(all)
    }

    async fn start_instance(&self, zone: &str, name: &str) -> ProviderResult<()> {
        self.instance_action(zone, name, "start").await
    }

    async fn reset_instance(&self, zone: &str, name: &str) -> ProviderResult<()> {
        self.instance_action(zone, name, "reset").await
    }

    async fn stop_instance(&self, zone: &str, name: &str) -> ProviderResult<()> {
        self.instance_action(zone, name, "stop").await
    }

    async fn delete_instance(&self, zone: &str, name: &str) -> ProviderResult<()> {
        self.send(
            self.client.delete(self.instance_url(zone, name)),
            &format!("delete {zone}/{name}"),
        )
        .await?;
        info!(zone, instance = name, "instance delete submitted");
        Ok(())
    }

    async fn create_instance(&self, zone: &str, req: &CreateInstanceRequest) -> ProviderResult<()> {
        let body = self.insert_body(zone, req);
        self.send(
            self.client
                .post(format!("{}/instances", self.zone_url(zone)))
                .json(&body),
            &format!("insert {zone}/{}", req.name),
        )
        .await?;
        info!(zone, instance = %req.name, machine_type = %req.machine_type, "instance insert submitted");
        Ok(())
    }

    async fn get_instance_status(&self, zone: &str, name: &str) -> ProviderResult<InstanceStatus> {
        let value = self
            .send(self.client.get(self.instance_url(zone, name)), &format!("get {zone}/{name}"))
            .await?;
        serde_json::from_value(value["status"].clone())
            .map_err(|e| ProviderError::Decode(format!("instance status: {e}")))
    }

    async fn get_image(&self, image: &ImageRef) -> ProviderResult<String> {
        let url = format!(
            "{}/projects/{}/global/images/family/{}",
            self.base_url, image.project, image.family
        );
        let value = self.send(self.client.get(url), &format!("image {image}")).await?;
        value["selfLink"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::Decode(format!("image {image} has no selfLink")))
    }
}

// ─── API types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListInstancesResponse {
    #[serde(default)]
    items: Vec<RawInstance>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListOperationsResponse {
    #[serde(default)]
    items: Vec<ZoneOperation>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    name: String,
    zone: String,
    #[serde(default)]
    status: InstanceStatus,
    #[serde(default)]
    metadata: Option<RawMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    items: Vec<RawMetadataItem>,
}

#[derive(Debug, Deserialize)]
struct RawMetadataItem {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

impl RawInstance {
    fn into_instance(self) -> ProviderInstance {
        let metadata: BTreeMap<String, String> = self
            .metadata
            .map(|m| {
                m.items
                    .into_iter()
                    .filter_map(|item| item.value.map(|v| (item.key, v)))
                    .collect()
            })
            .unwrap_or_default();
        ProviderInstance {
            name: self.name,
            zone: self.zone,
            status: self.status,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_list_decoding() {
        let raw = json!({
            "items": [{
                "name": "site-a-p-0",
                "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-west1-a",
                "status": "TERMINATED",
                "metadata": { "items": [
                    { "key": "max_run_seconds", "value": "700" },
                    { "key": "startup-script", "value": "#!/bin/bash" }
                ]}
            }, {
                "name": "bare",
                "zone": "projects/p/zones/us-west1-a",
                "status": "RUNNING"
            }],
            "nextPageToken": "abc"
        });
        let list: ListInstancesResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(list.next_page_token.as_deref(), Some("abc"));
        let instances: Vec<ProviderInstance> =
            list.items.into_iter().map(RawInstance::into_instance).collect();
        assert_eq!(instances[0].status, InstanceStatus::Terminated);
        assert_eq!(instances[0].metadata["max_run_seconds"], "700");
        assert!(instances[1].metadata.is_empty());
    }

    #[test]
    fn test_operation_list_decoding() {
        let raw = json!({
            "items": [{
                "targetLink": "https://www.googleapis.com/compute/v1/projects/p/zones/us-west1-a/instances/site-a-p-0",
                "targetId": "42",
                "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-west1-a",
                "operationType": "compute.instances.preempted",
                "endTime": "2016-10-12T07:43:51.345-07:00",
                "status": "DONE",
                "progress": 100
            }]
        });
        let list: ListOperationsResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].operation_type, "compute.instances.preempted");
        assert!(list.next_page_token.is_none());
    }

    #[test]
    fn test_insert_body_shape() {
        let provider =
            ComputeProvider::new("wrf-proj", AccessToken::Static("t".to_string())).unwrap();
        let req = CreateInstanceRequest {
            name: "site-a-p-0".to_string(),
            machine_type: "n1-highcpu-16".to_string(),
            source_image: "projects/cos-cloud/global/images/cos-1".to_string(),
            disk_size_gb: 20,
            preemptible: true,
            metadata: BTreeMap::from([("TZ".to_string(), "UTC".to_string())]),
            labels: BTreeMap::new(),
            scopes: vec!["https://www.googleapis.com/auth/devstorage.read_write".to_string()],
        };
        let body = provider.insert_body("us-west1-a", &req);
        assert_eq!(body["machineType"], "zones/us-west1-a/machineTypes/n1-highcpu-16");
        assert_eq!(body["scheduling"]["preemptible"], true);
        assert_eq!(body["scheduling"]["automaticRestart"], false);
        assert_eq!(body["scheduling"]["onHostMaintenance"], "TERMINATE");
        assert_eq!(body["labels"]["managed_by"], "spotctl");
        assert_eq!(body["metadata"]["items"][0]["key"], "TZ");
    }

    #[test]
    fn test_urls() {
        let provider = ComputeProvider::new("p", AccessToken::Static("t".to_string()))
            .unwrap()
            .with_base_url("http://localhost:9000");
        assert_eq!(
            provider.instance_url("us-west1-a", "x"),
            "http://localhost:9000/projects/p/zones/us-west1-a/instances/x"
        );
    }
}
