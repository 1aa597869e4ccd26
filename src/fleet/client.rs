//! Control plane API
//!
//! Request and response shapes for the checkin and ack calls, the traits the
//! gateway and ackers are written against, and the reqwest implementation.

use super::action::{deserialize_actions, RawAction};
use super::reporter::ReportedEvent;
use crate::config::FleetSettings;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckinRequest {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
    #[serde(default)]
    pub events: Vec<ReportedEvent>,
    #[serde(default)]
    pub local_metadata: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckinResponse {
    #[serde(default, deserialize_with = "deserialize_actions")]
    pub actions: Vec<RawAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
}

/// One acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub subtype: String,
    pub timestamp: DateTime<Utc>,
    pub action_id: String,
    pub agent_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AckRequest {
    pub events: Vec<AckEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AckResponse {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub success: bool,
}

#[async_trait]
pub trait CheckinClient: Send + Sync {
    async fn checkin(&self, request: &CheckinRequest) -> Result<CheckinResponse>;
}

#[async_trait]
pub trait AckClient: Send + Sync {
    async fn ack(&self, request: &AckRequest) -> Result<AckResponse>;
}

/// Connectivity check against a single host
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn probe(&self, host: &str) -> Result<()>;
}

/// Control plane hosts shared between the client and the hosts reconciler
#[derive(Clone, Default)]
pub struct HostList {
    hosts: Arc<RwLock<Vec<String>>>,
}

impl HostList {
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts: Arc::new(RwLock::new(normalize_hosts(hosts))),
        }
    }

    pub async fn get(&self) -> Vec<String> {
        self.hosts.read().await.clone()
    }

    /// Replace the hosts, returning the previous list.
    pub async fn replace(&self, hosts: Vec<String>) -> Vec<String> {
        std::mem::replace(&mut *self.hosts.write().await, normalize_hosts(hosts))
    }
}

pub(crate) fn normalize_hosts(hosts: Vec<String>) -> Vec<String> {
    hosts
        .into_iter()
        .map(|h| h.trim().trim_end_matches('/').to_string())
        .filter(|h| !h.is_empty())
        .collect()
}

/// reqwest client for the fleet API
pub struct HttpFleetClient {
    client: Client,
    hosts: HostList,
    agent_id: String,
    api_key: Option<String>,
}

impl HttpFleetClient {
    pub fn new(settings: &FleetSettings, agent_id: impl Into<String>, hosts: HostList) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(concat!("fleet-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            hosts,
            agent_id: agent_id.into(),
            api_key: Some(settings.access_api_key.clone()).filter(|k| !k.is_empty()),
        })
    }

    pub fn hosts(&self) -> &HostList {
        &self.hosts
    }

    fn agent_path(&self, suffix: &str) -> String {
        format!("/api/fleet/agents/{}/{}", self.agent_id, suffix)
    }

    /// POST `body` to `path`, trying each host in order.
    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let hosts = self.hosts.get().await;
        if hosts.is_empty() {
            bail!("no fleet hosts configured");
        }

        let mut last_error = None;
        for host in &hosts {
            let url = format!("{}{}", host, path);
            let mut request = self.client.post(&url).json(body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("ApiKey {}", key));
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!("POST {} -> {}", url, status);
                        return response
                            .json::<R>()
                            .await
                            .with_context(|| format!("Invalid response from {}", url));
                    }
                    let text = response.text().await.unwrap_or_default();
                    warn!("POST {} failed with {}: {}", url, status, text);
                    last_error = Some(anyhow!("{} returned {}: {}", url, status, text));
                }
                Err(e) => {
                    warn!("POST {} failed: {}", url, e);
                    last_error = Some(anyhow!(e).context(format!("Request to {} failed", url)));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("no fleet host reachable")))
    }
}

#[async_trait]
impl CheckinClient for HttpFleetClient {
    async fn checkin(&self, request: &CheckinRequest) -> Result<CheckinResponse> {
        self.post(&self.agent_path("checkin"), request).await
    }
}

#[async_trait]
impl AckClient for HttpFleetClient {
    async fn ack(&self, request: &AckRequest) -> Result<AckResponse> {
        self.post(&self.agent_path("acks"), request).await
    }
}

#[async_trait]
impl HostProbe for HttpFleetClient {
    async fn probe(&self, host: &str) -> Result<()> {
        let url = format!("{}/api/status", host.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        if !response.status().is_success() {
            bail!("{} returned {}", url, response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::action::{decode_actions, Action, ActionKind};
    use serde_json::json;

    #[tokio::test]
    async fn test_host_list_replace() {
        let hosts = HostList::new(vec!["https://a:8220/".into(), " ".into()]);
        assert_eq!(hosts.get().await, vec!["https://a:8220"]);

        let previous = hosts.replace(vec!["https://b:8220".into()]).await;
        assert_eq!(previous, vec!["https://a:8220"]);
        assert_eq!(hosts.get().await, vec!["https://b:8220"]);
    }

    #[test]
    fn test_checkin_response_defaults() {
        let response: CheckinResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.actions.is_empty());
        assert!(response.ack_token.is_none());

        let response: CheckinResponse = serde_json::from_value(json!({
            "ack_token": "t1",
            "actions": [{"id": "1", "type": "POLICY_REASSIGN", "data": null}]
        }))
        .unwrap();
        assert_eq!(response.ack_token.as_deref(), Some("t1"));
        assert_eq!(response.actions[0].action_type, "POLICY_REASSIGN");
    }

    #[test]
    fn test_malformed_action_does_not_fail_checkin() {
        let response: CheckinResponse = serde_json::from_value(json!({
            "actions": [
                {"id": "1", "type": "POLICY_REASSIGN", "data": {}},
                {"type": "SETTINGS", "data": {}},
                {"id": 7, "type": "UNENROLL"},
                {"id": "4", "type": ["UNENROLL"]}
            ],
            "ack_token": "t"
        }))
        .unwrap();
        assert_eq!(response.ack_token.as_deref(), Some("t"));

        let actions = decode_actions(response.actions);
        assert_eq!(actions.len(), 4);
        assert_eq!(actions[0], Action::PolicyReassign { id: "1".into() });
        assert_eq!(
            actions[1],
            Action::Unknown {
                id: String::new(),
                original_type: "SETTINGS".into()
            }
        );
        assert_eq!(actions[2].kind(), ActionKind::Unknown);
        assert_eq!(actions[3].kind(), ActionKind::Unknown);
        assert_eq!(actions[3].id(), "4");
    }

    #[test]
    fn test_ack_event_omits_empty_fields() {
        let event = AckEvent {
            event_type: "ACTION_RESULT".into(),
            subtype: "ACKNOWLEDGED".into(),
            timestamp: Utc::now(),
            action_id: "1".into(),
            agent_id: "agent".into(),
            message: "ok".into(),
            action_input_type: None,
            action_data: None,
            action_response: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "ACTION_RESULT");
        assert!(value.get("error").is_none());
        assert!(value.get("started_at").is_none());
    }

    #[tokio::test]
    async fn test_post_without_hosts_fails() {
        let client =
            HttpFleetClient::new(&FleetSettings::default(), "agent", HostList::default()).unwrap();
        let request = AckRequest::default();
        assert!(client.ack(&request).await.is_err());
    }
}
