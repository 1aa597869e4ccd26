//! Agent wiring
//!
//! Builds the emitter and router, then runs in one of two modes:
//!
//! - standalone: the policy comes from local files and is re-emitted when
//!   they change
//! - managed: the policy comes from the control plane through the fleet
//!   gateway; the last stored policy is replayed before the first checkin
//!
//! Every background task derives from one cancellation token so [`Agent::stop`]
//! tears everything down.

use crate::config::{AgentSettings, Environment};
use crate::emitter::{CapabilitiesFilter, ConfigEmitter, Emitter, EmitterHandle};
use crate::fleet::{
    Action, ActionDispatcher, ActionKind, AppActionHandler, DefaultHandler, DiskStore, FleetAcker,
    FleetGateway, FleetHostsReconciler, GatewayState, HostList, HttpFleetClient, LazyAcker,
    NoopAcker, PolicyChangeHandler, PolicyReassignHandler, Reporter, SharedStateStore,
    StagedUpgrader, StateStore, StateStoreActionAcker, UnenrollHandler, UpgradeHandler,
};
use crate::info::AgentInfo;
use crate::metrics::AgentMetrics;
use crate::policy;
use crate::program::RoutingTable;
use crate::router::{FileStreamFactory, Router, RouterView};
use anyhow::{bail, Context, Result};
use notify::RecommendedWatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Agent {
    settings: AgentSettings,
    env: Arc<Environment>,
    info: Arc<AgentInfo>,
    metrics: Arc<AgentMetrics>,
    metrics_port: Option<u16>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    emitter: Option<EmitterHandle>,
    policy_watcher: Option<RecommendedWatcher>,
    store: Option<SharedStateStore>,
    gateway_state: Option<watch::Receiver<GatewayState>>,
    running: bool,
}

/// Wiring shared by both modes
struct Pipeline {
    emitter: EmitterHandle,
    view: RouterView,
    task: JoinHandle<()>,
}

impl Agent {
    /// Load or create the agent identity and prepare metrics.
    pub fn new(settings: AgentSettings, env: Environment) -> Result<Self> {
        let info = AgentInfo::load_or_create(&env.agent_info_path())?;
        let metrics_port = settings.metrics.enabled.then_some(settings.metrics.port);
        Ok(Self {
            settings,
            env: Arc::new(env),
            info: Arc::new(info),
            metrics: Arc::new(AgentMetrics::new()?),
            metrics_port,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            emitter: None,
            policy_watcher: None,
            store: None,
            gateway_state: None,
            running: false,
        })
    }

    /// Serve metrics on `port` regardless of the settings.
    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    pub fn metrics(&self) -> Arc<AgentMetrics> {
        self.metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Emitter of the running agent
    pub fn emitter(&self) -> Option<Arc<dyn ConfigEmitter>> {
        self.emitter
            .clone()
            .map(|e| Arc::new(e) as Arc<dyn ConfigEmitter>)
    }

    /// Gateway state, in managed mode once started
    pub fn gateway_state(&self) -> Option<watch::Receiver<GatewayState>> {
        self.gateway_state.clone()
    }

    pub fn state_store(&self) -> Option<SharedStateStore> {
        self.store.clone()
    }

    fn build_emitter(&self) -> (Emitter, RouterView) {
        let router = Router::new(Arc::new(FileStreamFactory::new(self.env.programs_dir())));
        let view = router.view();
        let emitter = Emitter::new(self.env.clone(), self.info.clone(), Box::new(router))
            .with_filter(Box::new(CapabilitiesFilter::new(
                self.settings.capabilities.clone(),
            )))
            .with_metrics(self.metrics.clone());
        (emitter, view)
    }

    fn start_pipeline(&self) -> Pipeline {
        let (emitter, view) = self.build_emitter();
        let (emitter, task) = EmitterHandle::spawn(emitter, self.shutdown.child_token());
        Pipeline {
            emitter,
            view,
            task,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            bail!("Agent is already running");
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }
        info!(
            "Starting fleet-agent {} (id {})",
            self.info.version, self.info.agent_id
        );

        let pipeline = self.start_pipeline();
        self.tasks.push(pipeline.task);
        self.emitter = Some(pipeline.emitter.clone());

        let started = if self.settings.fleet.enabled {
            self.start_managed(pipeline.emitter, pipeline.view).await
        } else {
            self.start_standalone(pipeline.emitter).await
        };
        if let Err(e) = started {
            self.shutdown.cancel();
            self.emitter = None;
            self.tasks.clear();
            return Err(e);
        }

        if let Some(port) = self.metrics_port {
            self.tasks
                .push(self.metrics.clone().spawn_server(port, self.shutdown.child_token()));
        }

        self.running = true;
        info!("Agent started");
        Ok(())
    }

    async fn start_standalone(&mut self, emitter: EmitterHandle) -> Result<()> {
        let root = self.env.config().to_path_buf();
        let patterns = self.settings.policy.patterns.clone();
        info!("Running standalone from {}", root.display());

        if let Err(e) = apply_local_policy(&emitter, &root, &patterns).await {
            error!("Failed to apply local policy: {:#}", e);
        }

        if !self.settings.policy.reload {
            return Ok(());
        }
        if !root.exists() {
            warn!("{} does not exist, policy reload disabled", root.display());
            return Ok(());
        }

        let (watcher, mut changes) = policy::watch(&root)?;
        self.policy_watcher = Some(watcher);
        let token = self.shutdown.child_token();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    change = changes.recv() => {
                        if change.is_none() {
                            break;
                        }
                        info!("Policy files changed, reloading");
                        if let Err(e) = apply_local_policy(&emitter, &root, &patterns).await {
                            error!("Policy reload failed, keeping the running configuration: {:#}", e);
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    async fn start_managed(&mut self, emitter: EmitterHandle, view: RouterView) -> Result<()> {
        let store = StateStore::with_migration(
            Box::new(DiskStore::new(self.env.legacy_action_store_path())),
            Box::new(DiskStore::new(self.env.state_path())),
        )
        .context("Failed to open state store")?;
        let store: SharedStateStore = Arc::new(Mutex::new(store));
        self.store = Some(store.clone());

        let hosts = HostList::new(self.settings.fleet.hosts.clone());
        let client = Arc::new(HttpFleetClient::new(
            &self.settings.fleet,
            self.info.agent_id.clone(),
            hosts.clone(),
        )?);
        let reporter = Arc::new(Reporter::default());
        let gateway_token = self.shutdown.child_token();

        let emitter: Arc<dyn ConfigEmitter> = Arc::new(emitter);
        let mut dispatcher =
            ActionDispatcher::new(Arc::new(DefaultHandler)).with_metrics(self.metrics.clone());
        dispatcher.register(
            ActionKind::PolicyChange,
            Arc::new(
                PolicyChangeHandler::new(emitter.clone())
                    .with_reconciler(Arc::new(FleetHostsReconciler::new(hosts, client.clone())))
                    .with_reporter(reporter.clone()),
            ),
        )?;
        dispatcher.register(
            ActionKind::Unenroll,
            Arc::new(UnenrollHandler::new(emitter.clone(), gateway_token.clone())),
        )?;
        dispatcher.register(ActionKind::PolicyReassign, Arc::new(PolicyReassignHandler))?;
        dispatcher.register(
            ActionKind::Upgrade,
            Arc::new(UpgradeHandler::new(Arc::new(StagedUpgrader::new(
                self.env.data().join("upgrade"),
                self.info.version.clone(),
            )))),
        )?;
        dispatcher.register(
            ActionKind::App,
            Arc::new(AppActionHandler::new(
                view,
                self.settings.app_action_timeout(),
            )),
        )?;
        let dispatcher = Arc::new(dispatcher);

        let stored = store.lock().await.actions();
        if stored.iter().any(|a| matches!(a, Action::Unenroll { .. })) {
            warn!("Agent is unenrolled, not checking in");
            return Ok(());
        }
        if !stored.is_empty() {
            info!("Replaying {} stored actions", stored.len());
            if let Err(e) = dispatcher.dispatch(&NoopAcker, stored).await {
                error!("Failed to replay stored actions: {:#}", e);
            }
        }

        let acker = Arc::new(StateStoreActionAcker::new(
            Arc::new(LazyAcker::new(Arc::new(
                FleetAcker::new(self.info.agent_id.clone(), client.clone())
                    .with_metrics(self.metrics.clone()),
            ))),
            store.clone(),
        ));
        let gateway = FleetGateway::new(
            self.info.clone(),
            &self.settings.fleet.checkin,
            client,
            dispatcher,
            acker,
            reporter,
            store,
        )
        .with_metrics(self.metrics.clone());
        self.gateway_state = Some(gateway.subscribe());
        self.tasks.push(gateway.spawn(gateway_token));
        info!("Managed mode, checking in with {:?}", self.settings.fleet.hosts);
        Ok(())
    }

    /// Cancel every task and wait for them to finish. Safe to call twice.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        info!("Stopping agent");
        self.shutdown.cancel();
        self.policy_watcher = None;
        self.emitter = None;

        for task in self.tasks.drain(..) {
            match tokio::time::timeout(STOP_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Agent task failed: {}", e),
                Err(_) => warn!("Agent task did not stop within {:?}", STOP_TIMEOUT),
            }
        }

        self.running = false;
        info!("Agent stopped");
        Ok(())
    }

    /// Run until Ctrl-C, then stop.
    pub async fn run_until_signal(&mut self) -> Result<()> {
        if !self.running {
            bail!("Agent must be started before waiting for a signal");
        }
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {}
        }
        self.stop().await
    }
}

async fn apply_local_policy(
    emitter: &EmitterHandle,
    root: &std::path::Path,
    patterns: &[String],
) -> Result<()> {
    let loaded = policy::load(root, patterns)?;
    if loaded.files.is_empty() {
        warn!("No policy files matched {:?} in {}", patterns, root.display());
    }
    emitter.emit(loaded.policy).await
}

/// Compile the local policy without starting anything.
pub fn render_local_policy(settings: &AgentSettings, env: Environment) -> Result<RoutingTable> {
    let info = AgentInfo::load_or_create(&env.agent_info_path())?;
    let loaded = policy::load(env.config(), &settings.policy.patterns)?;
    let env = Arc::new(env);
    let router = Router::new(Arc::new(FileStreamFactory::new(env.programs_dir())));
    let emitter = Emitter::new(env, Arc::new(info), Box::new(router)).with_filter(Box::new(
        CapabilitiesFilter::new(settings.capabilities.clone()),
    ));
    let (_, table) = emitter.compile(loaded.policy)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const POLICY: &str = r#"
outputs:
  default:
    type: elasticsearch
    hosts: [127.0.0.1:9200]
inputs:
  - type: log
    streams:
      - paths: /var/log/syslog
"#;

    fn standalone(temp_dir: &TempDir, reload: bool) -> Agent {
        let env = Environment::rooted_at(temp_dir.path());
        fs::create_dir_all(env.config()).unwrap();
        fs::write(env.config().join("fleet-agent.yml"), POLICY).unwrap();
        let mut settings = AgentSettings::default();
        settings.policy.reload = reload;
        Agent::new(settings, env).unwrap()
    }

    #[tokio::test]
    async fn test_standalone_start_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut agent = standalone(&temp_dir, false);
        agent.start().await.unwrap();
        assert!(agent.is_running());
        assert!(agent.start().await.is_err());

        let written = temp_dir
            .path()
            .join("data/programs/default/filebeat.yml");
        assert!(written.exists());
        assert_eq!(agent.metrics().emissions.get(), 1);

        agent.stop().await.unwrap();
        assert!(!agent.is_running());
        agent.stop().await.unwrap();
        assert!(!temp_dir.path().join("data/programs/default").exists());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut agent = standalone(&temp_dir, false);
        agent.start().await.unwrap();
        agent.stop().await.unwrap();
        agent.start().await.unwrap();
        assert!(agent.is_running());
        agent.stop().await.unwrap();
    }

    #[test]
    fn test_render_local_policy() {
        let temp_dir = TempDir::new().unwrap();
        let env = Environment::rooted_at(temp_dir.path());
        fs::create_dir_all(env.config()).unwrap();
        fs::write(env.config().join("fleet-agent.yml"), POLICY).unwrap();

        let table = render_local_policy(&AgentSettings::default(), env).unwrap();
        let keys: Vec<&str> = table.keys().collect();
        assert_eq!(keys, vec!["default"]);
        let names: Vec<&str> = table
            .get("default")
            .unwrap()
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, vec!["filebeat", "monitoring"]);
    }

    #[tokio::test]
    async fn test_stored_unenroll_blocks_gateway() {
        let temp_dir = TempDir::new().unwrap();
        let env = Environment::rooted_at(temp_dir.path());
        let mut store =
            StateStore::new(Box::new(DiskStore::new(env.state_path()))).unwrap();
        store.add(&Action::Unenroll {
            id: "u".into(),
            is_detected: false,
        });
        store.save().unwrap();

        let mut settings = AgentSettings::default();
        settings.fleet.enabled = true;
        settings.fleet.hosts = vec!["http://127.0.0.1:1".into()];
        let mut agent = Agent::new(settings, env).unwrap();
        agent.start().await.unwrap();
        assert!(agent.gateway_state().is_none());
        assert_eq!(agent.state_store().unwrap().lock().await.actions().len(), 1);
        agent.stop().await.unwrap();
    }
}
