//! One handler per action kind

use super::acker::Acker;
use super::action::{Action, AppAction};
use super::client::{normalize_hosts, HostList, HostProbe};
use super::dispatcher::ActionHandler;
use super::reporter::{ReportedEvent, Reporter};
use super::store::{DiskStore, Storage};
use crate::emitter::ConfigEmitter;
use crate::router::RouterView;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn unexpected(handler: &str, action: &Action) -> anyhow::Error {
    anyhow!(
        "{} handler received action {} of type {}",
        handler,
        action.id(),
        action.action_type()
    )
}

/// Applies control plane host changes carried by a policy.
#[async_trait]
pub trait HostsReconciler: Send + Sync {
    /// Switch to the hosts in `policy`. On error the previous hosts are in
    /// place again.
    async fn reconcile(&self, policy: &Value) -> Result<()>;
}

/// Swaps the shared [`HostList`] and keeps the change only if one of the
/// new hosts answers.
pub struct FleetHostsReconciler {
    hosts: HostList,
    probe: Arc<dyn HostProbe>,
}

impl FleetHostsReconciler {
    pub fn new(hosts: HostList, probe: Arc<dyn HostProbe>) -> Self {
        Self { hosts, probe }
    }
}

fn policy_hosts(policy: &Value) -> Result<Option<Vec<String>>> {
    let Some(hosts) = policy.pointer("/fleet/hosts") else {
        return Ok(None);
    };
    let hosts = hosts
        .as_array()
        .ok_or_else(|| anyhow!("fleet.hosts must be a list"))?
        .iter()
        .map(|h| {
            h.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("fleet.hosts entries must be strings"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(hosts))
}

#[async_trait]
impl HostsReconciler for FleetHostsReconciler {
    async fn reconcile(&self, policy: &Value) -> Result<()> {
        let Some(hosts) = policy_hosts(policy)? else {
            return Ok(());
        };
        let hosts = normalize_hosts(hosts);
        if hosts.is_empty() || hosts == self.hosts.get().await {
            return Ok(());
        }

        let previous = self.hosts.replace(hosts).await;
        let candidates = self.hosts.get().await;
        let mut last_error = None;
        for host in &candidates {
            match self.probe.probe(host).await {
                Ok(()) => {
                    info!("Fleet hosts updated to {:?}", candidates);
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        self.hosts.replace(previous).await;
        Err(last_error
            .unwrap_or_else(|| anyhow!("no usable fleet host"))
            .context("Failed to reach updated fleet hosts, keeping the previous ones"))
    }
}

/// Emits the embedded policy, then acks.
pub struct PolicyChangeHandler {
    emitter: Arc<dyn ConfigEmitter>,
    reconciler: Option<Arc<dyn HostsReconciler>>,
    reporter: Option<Arc<Reporter>>,
}

impl PolicyChangeHandler {
    pub fn new(emitter: Arc<dyn ConfigEmitter>) -> Self {
        Self {
            emitter,
            reconciler: None,
            reporter: None,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn HostsReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    async fn apply(&self, id: &str, policy: &Value) -> Result<()> {
        if let Some(reconciler) = &self.reconciler {
            reconciler.reconcile(policy).await?;
        }
        let policy = serde_yaml::to_value(policy)
            .with_context(|| format!("Policy of action {} is not a valid tree", id))?;
        self.emitter.emit(policy).await
    }
}

#[async_trait]
impl ActionHandler for PolicyChangeHandler {
    async fn handle(&self, action: Action, acker: &dyn Acker) -> Result<()> {
        let Action::PolicyChange { id, policy } = &action else {
            return Err(unexpected("policy change", &action));
        };
        info!("Applying policy of action {}", id);

        let result = self.apply(id, policy).await;
        if let Some(reporter) = &self.reporter {
            match &result {
                Ok(()) => reporter.report(ReportedEvent::state(
                    "RUNNING",
                    format!("Policy of action {} applied", id),
                )),
                Err(e) => reporter.report(ReportedEvent::error(format!(
                    "Policy of action {} failed: {:#}",
                    id, e
                ))),
            }
        }
        result?;
        acker.ack(&action).await
    }
}

/// Stops every program, acks, and stops the agent.
///
/// Programs are stopped through the emitter's queue, so in-flight emissions
/// finish first. The ack is committed before `stop` is cancelled.
pub struct UnenrollHandler {
    emitter: Arc<dyn ConfigEmitter>,
    stop: CancellationToken,
}

impl UnenrollHandler {
    pub fn new(emitter: Arc<dyn ConfigEmitter>, stop: CancellationToken) -> Self {
        Self { emitter, stop }
    }
}

#[async_trait]
impl ActionHandler for UnenrollHandler {
    async fn handle(&self, action: Action, acker: &dyn Acker) -> Result<()> {
        let Action::Unenroll { id, is_detected } = &action else {
            return Err(unexpected("unenroll", &action));
        };
        warn!("Unenrolling (action {}, detected: {})", id, is_detected);
        self.emitter
            .clear()
            .await
            .context("Failed to stop programs")?;
        acker.ack(&action).await?;
        acker.commit().await?;
        self.stop.cancel();
        Ok(())
    }
}

/// Acks and commits right away.
pub struct PolicyReassignHandler;

#[async_trait]
impl ActionHandler for PolicyReassignHandler {
    async fn handle(&self, action: Action, acker: &dyn Acker) -> Result<()> {
        if !matches!(action, Action::PolicyReassign { .. }) {
            return Err(unexpected("policy reassign", &action));
        }
        info!("Policy reassigned by action {}", action.id());
        acker.ack(&action).await?;
        acker.commit().await
    }
}

#[async_trait]
pub trait Upgrader: Send + Sync {
    async fn upgrade(&self, action_id: &str, version: &str, source_uri: Option<&str>) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct UpgradeMarker<'a> {
    action_id: &'a str,
    from_version: &'a str,
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_uri: Option<&'a str>,
    staged_at: chrono::DateTime<Utc>,
}

/// Stages an upgrade by writing a marker under `<data>/upgrade`.
///
/// Fetching and swapping the binary is left to whatever watches the marker.
pub struct StagedUpgrader {
    dir: PathBuf,
    current_version: String,
}

impl StagedUpgrader {
    pub fn new(dir: PathBuf, current_version: impl Into<String>) -> Self {
        Self {
            dir,
            current_version: current_version.into(),
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join("marker.yml")
    }
}

#[async_trait]
impl Upgrader for StagedUpgrader {
    async fn upgrade(&self, action_id: &str, version: &str, source_uri: Option<&str>) -> Result<()> {
        if version == self.current_version {
            bail!("already running version {}", version);
        }
        let marker = UpgradeMarker {
            action_id,
            from_version: &self.current_version,
            version,
            source_uri,
            staged_at: Utc::now(),
        };
        let data = serde_yaml::to_string(&marker)?;
        DiskStore::new(self.marker_path()).save(data.as_bytes())?;
        info!("Staged upgrade to {}", version);
        Ok(())
    }
}

/// Acks only once the upgrade has been staged.
pub struct UpgradeHandler {
    upgrader: Arc<dyn Upgrader>,
}

impl UpgradeHandler {
    pub fn new(upgrader: Arc<dyn Upgrader>) -> Self {
        Self { upgrader }
    }
}

#[async_trait]
impl ActionHandler for UpgradeHandler {
    async fn handle(&self, action: Action, acker: &dyn Acker) -> Result<()> {
        let Action::Upgrade {
            id,
            version,
            source_uri,
        } = &action
        else {
            return Err(unexpected("upgrade", &action));
        };
        self.upgrader
            .upgrade(id, version, source_uri.as_deref())
            .await
            .with_context(|| format!("Upgrade to {} failed", version))?;
        acker.ack(&action).await
    }
}

/// Forwards an action to the running program that handles its input type.
///
/// The outcome, including a missing target or a timeout, goes into the ack.
pub struct AppActionHandler {
    view: RouterView,
    timeout: Duration,
}

impl AppActionHandler {
    pub fn new(view: RouterView, timeout: Duration) -> Self {
        Self { view, timeout }
    }

    async fn perform(&self, app: &mut AppAction) {
        app.started_at = Some(Utc::now());
        let outcome = match self.view.find_action_target(&app.input_type) {
            None => Err(anyhow!(
                "no running program handles input type {}",
                app.input_type
            )),
            Some((stream, program)) => {
                match tokio::time::timeout(
                    self.timeout,
                    stream.perform_action(&program, app.params.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("action timed out after {:?}", self.timeout)),
                }
            }
        };
        app.completed_at = Some(Utc::now());
        match outcome {
            Ok(response) => app.response = Some(response),
            Err(e) => {
                warn!("Action {} failed: {:#}", app.id, e);
                app.error = Some(format!("{:#}", e));
            }
        }
    }
}

#[async_trait]
impl ActionHandler for AppActionHandler {
    async fn handle(&self, action: Action, acker: &dyn Acker) -> Result<()> {
        let mut app = match action {
            Action::App(app) => app,
            other => return Err(unexpected("app action", &other)),
        };
        self.perform(&mut app).await;
        acker.ack(&Action::App(app)).await
    }
}

/// Logs actions nothing else handles; they are not acked.
pub struct DefaultHandler;

#[async_trait]
impl ActionHandler for DefaultHandler {
    async fn handle(&self, action: Action, _acker: &dyn Acker) -> Result<()> {
        warn!(
            "No handler for action {} of type {}, ignoring",
            action.id(),
            action.action_type()
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fleet::acker::NoopAcker;
    use crate::program::{find_spec, Program, RoutingTable};
    use crate::router::tests::RecordingFactory;
    use crate::router::{ProgramRouter, Router, Stream, StreamFactory};
    use crate::transpiler::Ast;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Emitter that records what it was given.
    #[derive(Default)]
    pub(crate) struct RecordingEmitter {
        pub emitted: Mutex<Vec<serde_yaml::Value>>,
        pub clears: Mutex<usize>,
        pub fail: bool,
    }

    #[async_trait]
    impl ConfigEmitter for RecordingEmitter {
        async fn emit(&self, policy: serde_yaml::Value) -> Result<()> {
            self.emitted.lock().unwrap().push(policy);
            if self.fail {
                bail!("invalid policy");
            }
            Ok(())
        }

        async fn clear(&self) -> Result<()> {
            *self.clears.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingAcker {
        pub acked: Mutex<Vec<Action>>,
        pub commits: Mutex<usize>,
    }

    #[async_trait]
    impl Acker for RecordingAcker {
        async fn ack(&self, action: &Action) -> Result<()> {
            self.acked.lock().unwrap().push(action.clone());
            Ok(())
        }

        async fn commit(&self) -> Result<()> {
            *self.commits.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct FixedProbe {
        reachable: Vec<String>,
    }

    #[async_trait]
    impl HostProbe for FixedProbe {
        async fn probe(&self, host: &str) -> Result<()> {
            if self.reachable.iter().any(|h| h == host) {
                Ok(())
            } else {
                Err(anyhow!("{} unreachable", host))
            }
        }
    }

    fn policy_change(id: &str, policy: Value) -> Action {
        Action::PolicyChange {
            id: id.into(),
            policy,
        }
    }

    #[tokio::test]
    async fn test_policy_change_emits_and_acks() {
        let emitter = Arc::new(RecordingEmitter::default());
        let reporter = Arc::new(Reporter::default());
        let handler = PolicyChangeHandler::new(emitter.clone()).with_reporter(reporter.clone());
        let acker = RecordingAcker::default();

        handler
            .handle(policy_change("2", json!({"hello": "world"})), &acker)
            .await
            .unwrap();

        let emitted = emitter.emitted.lock().unwrap().clone();
        assert_eq!(emitted, vec![serde_yaml::from_str::<serde_yaml::Value>("hello: world").unwrap()]);
        assert_eq!(acker.acked.lock().unwrap().len(), 1);
        assert_eq!(reporter.pending().events[0].subtype, "RUNNING");
    }

    #[tokio::test]
    async fn test_failed_policy_is_not_acked() {
        let emitter = Arc::new(RecordingEmitter {
            fail: true,
            ..Default::default()
        });
        let handler = PolicyChangeHandler::new(emitter);
        let acker = RecordingAcker::default();
        assert!(handler
            .handle(policy_change("2", json!({})), &acker)
            .await
            .is_err());
        assert!(acker.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hosts_rollback_on_unreachable() {
        let hosts = HostList::new(vec!["https://old:8220".into()]);
        let reconciler = Arc::new(FleetHostsReconciler::new(
            hosts.clone(),
            Arc::new(FixedProbe {
                reachable: vec!["https://old:8220".into()],
            }),
        ));
        let emitter = Arc::new(RecordingEmitter::default());
        let handler = PolicyChangeHandler::new(emitter.clone()).with_reconciler(reconciler);
        let acker = RecordingAcker::default();

        let result = handler
            .handle(
                policy_change("3", json!({"fleet": {"hosts": ["https://new:8220"]}})),
                &acker,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(hosts.get().await, vec!["https://old:8220"]);
        assert!(emitter.emitted.lock().unwrap().is_empty());
        assert!(acker.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hosts_switch_when_reachable() {
        let hosts = HostList::new(vec!["https://old:8220".into()]);
        let reconciler = FleetHostsReconciler::new(
            hosts.clone(),
            Arc::new(FixedProbe {
                reachable: vec!["https://new:8220".into()],
            }),
        );
        reconciler
            .reconcile(&json!({"fleet": {"hosts": ["https://new:8220/"]}}))
            .await
            .unwrap();
        assert_eq!(hosts.get().await, vec!["https://new:8220"]);

        assert!(reconciler
            .reconcile(&json!({"fleet": {"hosts": "https://x"}}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unenroll_clears_acks_and_stops() {
        let emitter = Arc::new(RecordingEmitter::default());
        let stop = CancellationToken::new();
        let handler = UnenrollHandler::new(emitter.clone(), stop.clone());
        let acker = RecordingAcker::default();

        handler
            .handle(
                Action::Unenroll {
                    id: "u".into(),
                    is_detected: false,
                },
                &acker,
            )
            .await
            .unwrap();
        assert_eq!(*emitter.clears.lock().unwrap(), 1);
        assert_eq!(acker.acked.lock().unwrap().len(), 1);
        assert_eq!(*acker.commits.lock().unwrap(), 1);
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_reassign_acks_and_commits() {
        let acker = RecordingAcker::default();
        PolicyReassignHandler
            .handle(Action::PolicyReassign { id: "1".into() }, &acker)
            .await
            .unwrap();
        assert_eq!(acker.acked.lock().unwrap().len(), 1);
        assert_eq!(*acker.commits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_kind_rejected() {
        let acker = RecordingAcker::default();
        assert!(PolicyReassignHandler
            .handle(
                Action::Unenroll {
                    id: "u".into(),
                    is_detected: false
                },
                &acker
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_upgrade_staged_then_acked() {
        let temp_dir = TempDir::new().unwrap();
        let upgrader = Arc::new(StagedUpgrader::new(
            temp_dir.path().join("upgrade"),
            "8.0.0",
        ));
        let handler = UpgradeHandler::new(upgrader.clone());
        let acker = RecordingAcker::default();

        handler
            .handle(
                Action::Upgrade {
                    id: "up".into(),
                    version: "8.1.0".into(),
                    source_uri: Some("https://artifacts".into()),
                },
                &acker,
            )
            .await
            .unwrap();
        let marker = std::fs::read_to_string(upgrader.marker_path()).unwrap();
        assert!(marker.contains("version: 8.1.0"));
        assert_eq!(acker.acked.lock().unwrap().len(), 1);

        let same = handler
            .handle(
                Action::Upgrade {
                    id: "up2".into(),
                    version: "8.0.0".into(),
                    source_uri: None,
                },
                &acker,
            )
            .await;
        assert!(same.is_err());
        assert_eq!(acker.acked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_app_action_without_target_acks_error() {
        let router = Router::new(Arc::new(RecordingFactory::default()));
        let handler = AppActionHandler::new(router.view(), Duration::from_secs(1));
        let acker = RecordingAcker::default();

        handler
            .handle(
                Action::App(AppAction::new("a", "endpoint", json!({}))),
                &acker,
            )
            .await
            .unwrap();

        let acked = acker.acked.lock().unwrap().clone();
        let Action::App(app) = &acked[0] else {
            panic!("expected app action");
        };
        assert!(app.error.as_deref().unwrap().contains("endpoint"));
        assert!(app.started_at.is_some() && app.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_app_action_reaches_program() {
        let factory = Arc::new(RecordingFactory::default());
        let mut router = Router::new(factory.clone());
        let view = router.view();
        let mut table = RoutingTable::new();
        table.push(
            "default",
            vec![Program::new(
                find_spec("endpoint-security").unwrap(),
                Ast::from_yaml_str("inputs: [{type: endpoint}]\n").unwrap(),
            )],
        );
        router.route(&table.hash(), &table).await.unwrap();

        let handler = AppActionHandler::new(view, Duration::from_secs(1));
        let acker = RecordingAcker::default();
        handler
            .handle(
                Action::App(AppAction::new("a", "endpoint", json!({"cmd": "isolate"}))),
                &acker,
            )
            .await
            .unwrap();

        let acked = acker.acked.lock().unwrap().clone();
        let Action::App(app) = &acked[0] else {
            panic!("expected app action");
        };
        assert!(app.error.is_none());
        assert_eq!(app.response, Some(json!({"echo": {"cmd": "isolate"}})));
        assert!(factory
            .calls
            .lock()
            .unwrap()
            .contains(&"action default endpoint-security".to_string()));
    }

    /// Streams whose actions never finish
    struct StalledFactory;

    struct StalledStream;

    #[async_trait]
    impl Stream for StalledStream {
        async fn execute(&self, _programs: &[Program]) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn perform_action(&self, _program: &str, _params: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({}))
        }
    }

    impl StreamFactory for StalledFactory {
        fn create(&self, _key: &str) -> Result<Arc<dyn Stream>> {
            Ok(Arc::new(StalledStream))
        }
    }

    #[tokio::test]
    async fn test_app_action_timeout_acks_error() {
        let mut router = Router::new(Arc::new(StalledFactory));
        let view = router.view();
        let mut table = RoutingTable::new();
        table.push(
            "default",
            vec![Program::new(
                find_spec("endpoint-security").unwrap(),
                Ast::from_yaml_str("inputs: [{type: endpoint}]\n").unwrap(),
            )],
        );
        router.route(&table.hash(), &table).await.unwrap();

        let handler = AppActionHandler::new(view, Duration::from_millis(50));
        let acker = RecordingAcker::default();
        tokio::time::timeout(
            Duration::from_secs(5),
            handler.handle(
                Action::App(AppAction::new("a", "endpoint", json!({"cmd": "isolate"}))),
                &acker,
            ),
        )
        .await
        .unwrap()
        .unwrap();

        let acked = acker.acked.lock().unwrap().clone();
        let Action::App(app) = &acked[0] else {
            panic!("expected app action");
        };
        assert!(app.error.as_deref().unwrap().contains("timed out"));
        assert!(app.response.is_none());
        let (started, completed) = (app.started_at.unwrap(), app.completed_at.unwrap());
        assert!(completed >= started);
    }

    #[tokio::test]
    async fn test_default_handler_does_not_ack() {
        let acker = RecordingAcker::default();
        DefaultHandler
            .handle(
                Action::Unknown {
                    id: "x".into(),
                    original_type: "SETTINGS".into(),
                },
                &acker,
            )
            .await
            .unwrap();
        assert!(acker.acked.lock().unwrap().is_empty());
        NoopAcker.commit().await.unwrap();
    }
}
