//! Acknowledgement of handled actions
//!
//! [`FleetAcker`] sends ack events right away. [`LazyAcker`] queues them and
//! sends the whole queue as one batch on [`Acker::commit`]; a failed batch
//! stays queued and is sent again by the next commit, so the control plane
//! may see an ack more than once.

use super::action::Action;
use super::client::{AckClient, AckEvent, AckRequest};
use super::store::SharedStateStore;
use crate::metrics::AgentMetrics;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self, action: &Action) -> Result<()>;

    /// Deliver anything that is still queued.
    async fn commit(&self) -> Result<()>;
}

/// Acker that can deliver several acks in one request
#[async_trait]
pub trait BatchAcker: Acker {
    async fn ack_batch(&self, actions: &[Action]) -> Result<()>;
}

pub struct FleetAcker {
    agent_id: String,
    client: Arc<dyn AckClient>,
    metrics: Option<Arc<AgentMetrics>>,
}

impl FleetAcker {
    pub fn new(agent_id: impl Into<String>, client: Arc<dyn AckClient>) -> Self {
        Self {
            agent_id: agent_id.into(),
            client,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn event(&self, action: &Action) -> AckEvent {
        let mut event = AckEvent {
            event_type: "ACTION_RESULT".to_string(),
            subtype: "ACKNOWLEDGED".to_string(),
            timestamp: Utc::now(),
            action_id: action.id().to_string(),
            agent_id: self.agent_id.clone(),
            message: format!(
                "Action '{}' of type '{}' acknowledged.",
                action.id(),
                action.action_type()
            ),
            action_input_type: None,
            action_data: None,
            action_response: None,
            started_at: None,
            completed_at: None,
            error: None,
        };
        if let Action::App(app) = action {
            event.action_input_type = Some(app.input_type.clone());
            event.action_data = Some(app.params.clone());
            event.action_response = app.response.clone();
            event.started_at = app.started_at;
            event.completed_at = app.completed_at;
            event.error = app.error.clone();
        }
        event
    }
}

#[async_trait]
impl Acker for FleetAcker {
    async fn ack(&self, action: &Action) -> Result<()> {
        self.ack_batch(std::slice::from_ref(action)).await
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl BatchAcker for FleetAcker {
    async fn ack_batch(&self, actions: &[Action]) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let request = AckRequest {
            events: actions.iter().map(|a| self.event(a)).collect(),
        };
        let response = self
            .client
            .ack(&request)
            .await
            .with_context(|| format!("Failed to ack {} actions", actions.len()))?;
        if !response.success {
            bail!("control plane rejected ack of {} actions", actions.len());
        }
        if let Some(metrics) = &self.metrics {
            metrics.acks_committed.inc_by(actions.len() as u64);
        }
        debug!("Acked {} actions", actions.len());
        Ok(())
    }
}

/// Queues acks until commit; forced actions commit immediately.
pub struct LazyAcker {
    inner: Arc<dyn BatchAcker>,
    queue: Mutex<Vec<Action>>,
}

impl LazyAcker {
    pub fn new(inner: Arc<dyn BatchAcker>) -> Self {
        Self {
            inner,
            queue: Mutex::new(Vec::new()),
        }
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl Acker for LazyAcker {
    async fn ack(&self, action: &Action) -> Result<()> {
        self.queue.lock().await.push(action.clone());
        if action.force_ack() {
            return self.commit().await;
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return Ok(());
        }
        self.inner.ack_batch(&queue).await?;
        queue.clear();
        Ok(())
    }
}

/// Records policy changes and unenrolls in the state store before acking.
pub struct StateStoreActionAcker {
    inner: Arc<dyn Acker>,
    store: SharedStateStore,
}

impl StateStoreActionAcker {
    pub fn new(inner: Arc<dyn Acker>, store: SharedStateStore) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl Acker for StateStoreActionAcker {
    async fn ack(&self, action: &Action) -> Result<()> {
        {
            let mut store = self.store.lock().await;
            store.add(action);
            store
                .save()
                .with_context(|| format!("Failed to persist action {}", action.id()))?;
        }
        self.inner.ack(action).await
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }
}

/// Acker that drops everything, used when replaying stored actions.
pub struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self, _action: &Action) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }
}
