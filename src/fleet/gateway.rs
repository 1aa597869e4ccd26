//! Checkin loop
//!
//! On every scheduler tick the gateway sends the pending events and the ack
//! token, then dispatches the actions it got back. A failed checkin is
//! retried with backoff until it succeeds or the loop is cancelled; the
//! scheduler does not advance meanwhile.

use super::acker::Acker;
use super::action::{decode_actions, Action};
use super::backoff::Backoff;
use super::client::{CheckinClient, CheckinRequest};
use super::dispatcher::ActionDispatcher;
use super::reporter::Reporter;
use super::scheduler::PeriodicJitter;
use super::store::SharedStateStore;
use crate::config::GatewaySettings;
use crate::info::AgentInfo;
use crate::metrics::AgentMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Idle,
    Waiting,
    Executing,
    BackingOff(Duration),
    Stopped,
}

pub struct FleetGateway {
    agent: Arc<AgentInfo>,
    client: Arc<dyn CheckinClient>,
    dispatcher: Arc<ActionDispatcher>,
    acker: Arc<dyn Acker>,
    reporter: Arc<Reporter>,
    store: SharedStateStore,
    scheduler: PeriodicJitter,
    backoff: Backoff,
    metrics: Option<Arc<AgentMetrics>>,
    state: watch::Sender<GatewayState>,
}

impl FleetGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent: Arc<AgentInfo>,
        settings: &GatewaySettings,
        client: Arc<dyn CheckinClient>,
        dispatcher: Arc<ActionDispatcher>,
        acker: Arc<dyn Acker>,
        reporter: Arc<Reporter>,
        store: SharedStateStore,
    ) -> Self {
        let (state, _) = watch::channel(GatewayState::Idle);
        Self {
            agent,
            client,
            dispatcher,
            acker,
            reporter,
            store,
            scheduler: PeriodicJitter::new(settings.period(), settings.jitter()),
            backoff: Backoff::new(settings.backoff.init(), settings.backoff.max()),
            metrics: None,
            state,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayState> {
        self.state.subscribe()
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    /// Run until `token` is cancelled.
    #[instrument(skip_all)]
    pub async fn run(mut self, token: CancellationToken) {
        info!("Fleet gateway started");
        loop {
            self.state.send_replace(GatewayState::Waiting);
            if !self.scheduler.tick(&token).await {
                break;
            }

            let Some(actions) = self.execute(&token).await else {
                break;
            };

            if !actions.is_empty() {
                debug!("Checkin returned {} actions", actions.len());
                if let Err(e) = self.dispatcher.dispatch(self.acker.as_ref(), actions).await {
                    error!("Failed to dispatch actions: {:#}", e);
                }
            }
            self.state.send_replace(GatewayState::Idle);
        }
        self.state.send_replace(GatewayState::Stopped);
        info!("Fleet gateway stopped");
    }

    /// One checkin, retried until it succeeds. `None` once cancelled.
    async fn execute(&mut self, token: &CancellationToken) -> Option<Vec<Action>> {
        self.backoff.reset();
        loop {
            self.state.send_replace(GatewayState::Executing);
            match self.checkin().await {
                Ok(actions) => return Some(actions),
                Err(e) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.checkin_failures.inc();
                    }
                    let delay = self.backoff.next_delay();
                    warn!("Checkin failed, retrying in {:?}: {:#}", delay, e);
                    self.state.send_replace(GatewayState::BackingOff(delay));
                    if !Backoff::wait(delay, token).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn checkin(&self) -> anyhow::Result<Vec<Action>> {
        let pending = self.reporter.pending();
        let ack_token = self.store.lock().await.ack_token().to_string();
        let request = CheckinRequest {
            status: "online".to_string(),
            ack_token: Some(ack_token).filter(|t| !t.is_empty()),
            events: pending.events,
            local_metadata: serde_json::json!({
                "elastic": {
                    "agent": {
                        "id": self.agent.agent_id,
                        "version": self.agent.version,
                        "snapshot": self.agent.snapshot,
                    }
                },
                "host": { "hostname": self.agent.hostname },
            }),
        };

        let response = self.client.checkin(&request).await?;
        self.reporter.ack(pending.up_to);
        if let Some(metrics) = &self.metrics {
            metrics.checkins.inc();
        }

        if let Some(token) = response.ack_token.filter(|t| !t.is_empty()) {
            let mut store = self.store.lock().await;
            store.set_ack_token(&token);
            // The token stays dirty in the store and is written by the next
            // save. The actions are already ours, so dispatch goes ahead.
            if let Err(e) = store.save() {
                warn!("Failed to persist ack token, continuing: {:#}", e);
            }
        }
        Ok(decode_actions(response.actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffSettings;
    use crate::fleet::acker::NoopAcker;
    use crate::fleet::action::RawAction;
    use crate::fleet::client::CheckinResponse;
    use crate::fleet::handlers::DefaultHandler;
    use crate::fleet::reporter::ReportedEvent;
    use crate::fleet::store::tests::MemoryStorage;
    use crate::fleet::store::StateStore;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    /// Replays scripted responses, then answers with empty checkins.
    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<CheckinResponse>>>,
        requests: Mutex<Vec<CheckinRequest>>,
    }

    #[async_trait]
    impl CheckinClient for ScriptedClient {
        async fn checkin(&self, request: &CheckinRequest) -> Result<CheckinResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CheckinResponse::default()))
        }
    }

    fn settings() -> GatewaySettings {
        GatewaySettings {
            period_ms: 1,
            jitter_ms: 0,
            backoff: BackoffSettings {
                init_ms: 1,
                max_ms: 4,
            },
        }
    }

    fn build_gateway(client: Arc<ScriptedClient>, reporter: Arc<Reporter>) -> (FleetGateway, SharedStateStore) {
        build_gateway_on(client, reporter, MemoryStorage::default())
    }

    fn build_gateway_on(
        client: Arc<ScriptedClient>,
        reporter: Arc<Reporter>,
        storage: MemoryStorage,
    ) -> (FleetGateway, SharedStateStore) {
        let store = Arc::new(tokio::sync::Mutex::new(StateStore::new(Box::new(storage)).unwrap()));
        let gateway = FleetGateway::new(
            Arc::new(AgentInfo::with_id("agent-1")),
            &settings(),
            client,
            Arc::new(ActionDispatcher::new(Arc::new(DefaultHandler))),
            Arc::new(NoopAcker),
            reporter,
            store.clone(),
        );
        (gateway, store)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_retries_then_stores_token_and_acks_events() {
        let client = Arc::new(ScriptedClient::default());
        {
            let mut responses = client.responses.lock().unwrap();
            responses.push_back(Err(anyhow!("connection refused")));
            responses.push_back(Err(anyhow!("connection refused")));
            responses.push_back(Ok(CheckinResponse {
                actions: vec![RawAction {
                    id: "1".into(),
                    action_type: "SETTINGS".into(),
                    data: serde_json::Value::Null,
                    input_type: None,
                }],
                ack_token: Some("token-1".into()),
            }));
        }
        let reporter = Arc::new(Reporter::default());
        reporter.report(ReportedEvent::state("RUNNING", "started"));

        let (gateway, store) = build_gateway(client.clone(), reporter.clone());
        let metrics = Arc::new(AgentMetrics::new().unwrap());
        let gateway = gateway.with_metrics(metrics.clone());
        let token = CancellationToken::new();
        let handle = gateway.spawn(token.clone());

        wait_for(|| client.requests.lock().unwrap().len() >= 4).await;
        token.cancel();
        handle.await.unwrap();

        let requests = client.requests.lock().unwrap().clone();
        assert_eq!(requests[0].events.len(), 1);
        assert_eq!(requests[2].events.len(), 1);
        assert!(requests[3].events.is_empty());
        assert_eq!(requests[3].ack_token.as_deref(), Some("token-1"));
        assert_eq!(store.lock().await.ack_token(), "token-1");
        assert!(reporter.is_empty());
        assert_eq!(metrics.checkin_failures.get(), 2);
        assert!(metrics.checkins.get() >= 2);
    }

    #[tokio::test]
    async fn test_token_save_failure_still_returns_actions() {
        let client = Arc::new(ScriptedClient::default());
        client.responses.lock().unwrap().push_back(Ok(CheckinResponse {
            actions: vec![RawAction {
                id: "1".into(),
                action_type: "POLICY_REASSIGN".into(),
                ..RawAction::default()
            }],
            ack_token: Some("token-1".into()),
        }));
        let storage = MemoryStorage::default();
        storage.fail.store(true, Ordering::SeqCst);
        let (gateway, store) =
            build_gateway_on(client, Arc::new(Reporter::default()), storage.clone());

        let actions = gateway.checkin().await.unwrap();
        assert_eq!(actions, vec![Action::PolicyReassign { id: "1".into() }]);
        {
            let store = store.lock().await;
            assert_eq!(store.ack_token(), "token-1");
            assert!(store.is_dirty());
        }

        storage.fail.store(false, Ordering::SeqCst);
        store.lock().await.save().unwrap();
        let reloaded = StateStore::new(Box::new(storage)).unwrap();
        assert_eq!(reloaded.ack_token(), "token-1");
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let client = Arc::new(ScriptedClient::default());
        client
            .responses
            .lock()
            .unwrap()
            .push_back(Err(anyhow!("down")));

        let store = Arc::new(tokio::sync::Mutex::new(
            StateStore::new(Box::new(MemoryStorage::default())).unwrap(),
        ));
        let mut slow = settings();
        slow.backoff = BackoffSettings {
            init_ms: 3_600_000,
            max_ms: 3_600_000,
        };
        let gateway = FleetGateway::new(
            Arc::new(AgentInfo::with_id("agent-1")),
            &slow,
            client.clone(),
            Arc::new(ActionDispatcher::new(Arc::new(DefaultHandler))),
            Arc::new(NoopAcker),
            Arc::new(Reporter::default()),
            store,
        );
        let mut state = gateway.subscribe();
        let token = CancellationToken::new();
        let handle = gateway.spawn(token.clone());

        state
            .wait_for(|s| matches!(s, GatewayState::BackingOff(_)))
            .await
            .unwrap();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*state.borrow(), GatewayState::Stopped);
    }
}
