//! Policy emitter
//!
//! Compiles a raw policy into a [`RoutingTable`] and hands it to a
//! [`ProgramRouter`]:
//!
//! 1. inject process-wide paths and overrides
//! 2. convert to a configuration tree
//! 3. run the filters
//! 4. build variable contexts, render inputs, resolve programs per output
//! 5. run the decorators per routing key
//! 6. route the table, keyed by its content hash
//!
//! Any failing step aborts the emission; the router keeps running what it
//! had. Emissions go through [`EmitterHandle`], which serializes them on a
//! single task.

pub mod decorators;
pub mod filters;

pub use decorators::{Decorator, FleetMetadataDecorator, MonitoringDecorator, MonitoringSettings};
pub use filters::{CapabilitiesFilter, Filter, InputsValidator};

use crate::config::Environment;
use crate::info::AgentInfo;
use crate::metrics::AgentMetrics;
use crate::program::{self, RoutingTable, Spec};
use crate::providers;
use crate::router::ProgramRouter;
use crate::transpiler::{render_inputs, Ast, Node};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_yaml::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Anything that accepts policies
#[async_trait]
pub trait ConfigEmitter: Send + Sync {
    /// Compile and route `policy`.
    async fn emit(&self, policy: Value) -> Result<()>;

    /// Route an empty table, stopping every program.
    async fn clear(&self) -> Result<()>;
}

/// Compilation pipeline plus the router it feeds
pub struct Emitter {
    env: Arc<Environment>,
    agent: Arc<AgentInfo>,
    specs: Vec<Arc<Spec>>,
    filters: Vec<Box<dyn Filter>>,
    decorators: Vec<Box<dyn Decorator>>,
    router: Box<dyn ProgramRouter>,
    metrics: Option<Arc<AgentMetrics>>,
}

impl Emitter {
    /// Emitter with the built-in specs, the inputs validator and the
    /// monitoring and fleet metadata decorators.
    pub fn new(env: Arc<Environment>, agent: Arc<AgentInfo>, router: Box<dyn ProgramRouter>) -> Self {
        Self {
            env,
            agent,
            specs: program::supported_specs(),
            filters: vec![Box::new(InputsValidator)],
            decorators: vec![Box::new(MonitoringDecorator), Box::new(FleetMetadataDecorator)],
            router,
            metrics: None,
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_decorator(mut self, decorator: Box<dyn Decorator>) -> Self {
        self.decorators.push(decorator);
        self
    }

    pub fn with_specs(mut self, specs: Vec<Arc<Spec>>) -> Self {
        self.specs = specs;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run steps 1 to 5 and return the content hash and routing table.
    pub fn compile(&self, raw: Value) -> Result<(String, RoutingTable)> {
        let mut raw = raw;
        self.env.inject(&mut raw)?;
        let mut ast = Ast::from_yaml_value(&raw).context("Failed to parse policy")?;

        for filter in &self.filters {
            filter
                .filter(&mut ast)
                .with_context(|| format!("Filter {} rejected the policy", filter.name()))?;
        }

        let vars = providers::build_vars(&mut ast, &self.env, &self.agent)?;
        if let Some(inputs) = ast.root_mut().remove("inputs") {
            let rendered = render_inputs(&inputs, &vars)?;
            debug!("Rendered {} inputs over {} contexts", rendered.len(), vars.len());
            substitute_globals(&mut ast, &vars)?;
            ast.insert("inputs", Node::List(rendered))?;
        } else {
            substitute_globals(&mut ast, &vars)?;
        }

        let mut table = program::resolve(self.agent.as_ref(), &ast, &self.specs)?;
        for (key, programs) in table.iter_mut() {
            for decorator in &self.decorators {
                let names: Vec<String> = programs.iter().map(|p| p.name().to_string()).collect();
                let decorated = decorator
                    .decorate(&self.agent, key, &ast, std::mem::take(programs))
                    .with_context(|| {
                        format!("Decorator {} failed for {}", decorator.name(), key)
                    })?;
                if let Some(missing) = names
                    .iter()
                    .find(|name| !decorated.iter().any(|p| p.name() == name.as_str()))
                {
                    bail!(
                        "decorator {} removed program {} from {}",
                        decorator.name(),
                        missing,
                        key
                    );
                }
                *programs = decorated;
            }
        }

        Ok((table.hash(), table))
    }

    /// Compile `raw` and route the result.
    #[instrument(skip_all)]
    pub async fn emit(&mut self, raw: Value) -> Result<()> {
        let result = match self.compile(raw) {
            Ok((hash, table)) => {
                info!("Routing {} groups ({})", table.len(), &hash[..12]);
                self.router.route(&hash, &table).await
            }
            Err(e) => Err(e),
        };
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(()) => metrics.emissions.inc(),
                Err(_) => metrics.emission_failures.inc(),
            }
        }
        result
    }

    /// Route an empty table.
    pub async fn clear(&mut self) -> Result<()> {
        let empty = RoutingTable::new();
        self.router.route(&empty.hash(), &empty).await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.router.shutdown().await
    }
}

/// Substitute variables outside `inputs` from the first context.
fn substitute_globals(ast: &mut Ast, vars: &[crate::transpiler::Vars]) -> Result<()> {
    let Some(base) = vars.first() else {
        return Ok(());
    };
    for (key, node) in ast.root_mut().iter_mut() {
        *node = node
            .apply(base, &mut None)
            .with_context(|| format!("Failed to substitute variables in {}", key))?;
    }
    Ok(())
}

enum Request {
    Emit(Value, oneshot::Sender<Result<()>>),
    Clear(oneshot::Sender<Result<()>>),
}

/// Cloneable front of an [`Emitter`] running on its own task.
///
/// Requests are processed one at a time in arrival order. Cancelling the
/// token shuts the router down and ends the task.
#[derive(Clone)]
pub struct EmitterHandle {
    tx: mpsc::Sender<Request>,
}

impl EmitterHandle {
    pub fn spawn(mut emitter: Emitter, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Request>(16);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(Request::Emit(policy, reply)) => {
                            let result = emitter.emit(policy).await;
                            if let Err(e) = &result {
                                error!("Emission failed: {:#}", e);
                            }
                            let _ = reply.send(result);
                        }
                        Some(Request::Clear(reply)) => {
                            let _ = reply.send(emitter.clear().await);
                        }
                        None => break,
                    },
                }
            }
            if let Err(e) = emitter.shutdown().await {
                error!("Failed to stop streams: {:#}", e);
            }
            debug!("Emitter stopped");
        });
        (Self { tx }, handle)
    }

    async fn request(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> Request) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| anyhow!("emitter is stopped"))?;
        reply_rx.await.map_err(|_| anyhow!("emitter is stopped"))?
    }
}

#[async_trait]
impl ConfigEmitter for EmitterHandle {
    async fn emit(&self, policy: Value) -> Result<()> {
        self.request(|reply| Request::Emit(policy, reply)).await
    }

    async fn clear(&self) -> Result<()> {
        self.request(Request::Clear).await
    }
}
