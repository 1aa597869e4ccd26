//! Action dispatch
//!
//! Actions of one checkin are handled one after the other in the order the
//! control plane sent them. A reassign is expected ahead of the policy change
//! it authorizes, so dispatch must never be reordered or run in parallel.

use super::acker::Acker;
use super::action::{Action, ActionKind};
use crate::metrics::AgentMetrics;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, instrument};

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Handle `action`. Returning an error leaves it unacknowledged so the
    /// control plane delivers it again.
    async fn handle(&self, action: Action, acker: &dyn Acker) -> Result<()>;
}

pub struct ActionDispatcher {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
    default: Arc<dyn ActionHandler>,
    metrics: Option<Arc<AgentMetrics>>,
}

impl ActionDispatcher {
    /// Dispatcher sending every action kind to `default`.
    pub fn new(default: Arc<dyn ActionHandler>) -> Self {
        Self {
            handlers: HashMap::new(),
            default,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) -> Result<()> {
        if self.handlers.contains_key(&kind) {
            bail!("a handler for {} is already registered", kind);
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Handle `actions` in order, then commit `acker`.
    ///
    /// The first failing action stops the batch. Acks of the actions handled
    /// before it are still committed.
    #[instrument(skip_all, fields(actions = actions.len()))]
    pub async fn dispatch(&self, acker: &dyn Acker, actions: Vec<Action>) -> Result<()> {
        let mut outcome = Ok(());
        for action in actions {
            let kind = action.kind();
            let id = action.id().to_string();
            let handler = self.handlers.get(&kind).unwrap_or(&self.default);
            debug!("Dispatching action {} ({})", id, kind);
            if let Some(metrics) = &self.metrics {
                metrics
                    .actions_dispatched
                    .with_label_values(&[kind.as_str()])
                    .inc();
            }
            if let Err(e) = handler.handle(action, acker).await {
                outcome = Err(e).with_context(|| format!("Failed to handle action {} ({})", id, kind));
                break;
            }
        }

        if let Err(e) = acker.commit().await {
            if outcome.is_ok() {
                return Err(e).context("Failed to commit acks");
            }
            error!("Failed to commit acks: {:#}", e);
        }
        outcome
    }
}
