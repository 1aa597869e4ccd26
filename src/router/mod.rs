//! Routing of compiled programs to running streams
//!
//! Each routing key owns one [`Stream`]. On every dispatch the router starts
//! streams for new keys, reconfigures streams whose programs changed and
//! closes streams whose key disappeared. Stream operations run
//! concurrently; a failing stream does not hold back the others.

pub mod file_stream;

pub use file_stream::{FileStream, FileStreamFactory};

use crate::program::{Program, RoutingTable};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

/// Control loop for the programs of one routing key
#[async_trait]
pub trait Stream: Send + Sync {
    /// Start or reconfigure the stream with `programs`.
    async fn execute(&self, programs: &[Program]) -> Result<()>;

    /// Stop every program of the stream.
    async fn close(&self) -> Result<()>;

    /// Invoke an action on a running program.
    async fn perform_action(
        &self,
        program: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Creates the stream for a routing key
pub trait StreamFactory: Send + Sync {
    fn create(&self, key: &str) -> Result<Arc<dyn Stream>>;
}

/// Receiver of routing tables
#[async_trait]
pub trait ProgramRouter: Send + Sync {
    /// Apply `table`; a repeated `hash` is a no-op.
    async fn route(&mut self, hash: &str, table: &RoutingTable) -> Result<()>;

    /// Close every stream.
    async fn shutdown(&mut self) -> Result<()>;
}

/// A routing key and what is running under it
#[derive(Clone)]
pub struct RunningGroup {
    pub key: String,
    pub programs: Vec<Program>,
    pub stream: Arc<dyn Stream>,
}

/// Read-only view of the running groups, updated after every dispatch.
#[derive(Clone)]
pub struct RouterView {
    rx: watch::Receiver<Arc<Vec<RunningGroup>>>,
}

impl RouterView {
    pub fn groups(&self) -> Arc<Vec<RunningGroup>> {
        self.rx.borrow().clone()
    }

    /// First running program whose spec handles actions for `input_type`.
    pub fn find_action_target(&self, input_type: &str) -> Option<(Arc<dyn Stream>, String)> {
        self.groups().iter().find_map(|group| {
            group
                .programs
                .iter()
                .find(|p| p.spec.handles_app_action(input_type))
                .map(|p| (group.stream.clone(), p.name().to_string()))
        })
    }
}

struct Route {
    stream: Arc<dyn Stream>,
    programs: Vec<Program>,
    hash: String,
}

/// Diffing router over a [`StreamFactory`]
pub struct Router {
    factory: Arc<dyn StreamFactory>,
    routes: HashMap<String, Route>,
    order: Vec<String>,
    last_hash: Option<String>,
    view: watch::Sender<Arc<Vec<RunningGroup>>>,
}

impl Router {
    pub fn new(factory: Arc<dyn StreamFactory>) -> Self {
        let (view, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            factory,
            routes: HashMap::new(),
            order: Vec::new(),
            last_hash: None,
            view,
        }
    }

    pub fn view(&self) -> RouterView {
        RouterView {
            rx: self.view.subscribe(),
        }
    }

    /// Routing keys currently running, in dispatch order
    pub fn keys(&self) -> &[String] {
        &self.order
    }

    fn publish(&self) {
        let groups: Vec<RunningGroup> = self
            .order
            .iter()
            .filter_map(|key| {
                self.routes.get(key).map(|route| RunningGroup {
                    key: key.clone(),
                    programs: route.programs.clone(),
                    stream: route.stream.clone(),
                })
            })
            .collect();
        self.view.send_replace(Arc::new(groups));
    }
}

fn programs_hash(programs: &[Program]) -> String {
    let mut hasher = Sha256::new();
    for program in programs {
        hasher.update(program.name().as_bytes());
        hasher.update([0]);
        hasher.update(program.hash().as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl ProgramRouter for Router {
    #[instrument(skip(self, table), fields(groups = table.len()))]
    async fn route(&mut self, hash: &str, table: &RoutingTable) -> Result<()> {
        if self.last_hash.as_deref() == Some(hash) {
            debug!("Routing table unchanged, nothing to do");
            return Ok(());
        }

        let mut failures = Vec::new();
        let mut pending = Vec::new();
        for (key, programs) in table.iter() {
            let group_hash = programs_hash(programs);
            let stream = match self.routes.get(key) {
                Some(route) if route.hash == group_hash => continue,
                Some(route) => route.stream.clone(),
                None => match self.factory.create(key) {
                    Ok(stream) => stream,
                    Err(e) => {
                        failures.push(format!("{}: {:#}", key, e));
                        continue;
                    }
                },
            };
            pending.push((key.to_string(), programs.to_vec(), group_hash, stream));
        }

        let results = join_all(
            pending
                .iter()
                .map(|(_, programs, _, stream)| stream.execute(programs)),
        )
        .await;
        for ((key, programs, group_hash, stream), result) in pending.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    info!("Routing key {} configured with {} programs", key, programs.len());
                    self.routes.insert(
                        key,
                        Route {
                            stream,
                            programs,
                            hash: group_hash,
                        },
                    );
                }
                Err(e) => {
                    error!("Failed to configure routing key {}: {:#}", key, e);
                    failures.push(format!("{}: {:#}", key, e));
                }
            }
        }

        let removed: Vec<String> = self
            .routes
            .keys()
            .filter(|key| table.get(key).is_none())
            .cloned()
            .collect();
        let closing: Vec<(String, Route)> = removed
            .into_iter()
            .filter_map(|key| self.routes.remove(&key).map(|route| (key, route)))
            .collect();
        let results = join_all(closing.iter().map(|(_, route)| route.stream.close())).await;
        for ((key, _), result) in closing.iter().zip(results) {
            match result {
                Ok(()) => info!("Routing key {} stopped", key),
                Err(e) => {
                    error!("Failed to stop routing key {}: {:#}", key, e);
                    failures.push(format!("{}: {:#}", key, e));
                }
            }
        }

        self.order = table
            .keys()
            .filter(|key| self.routes.contains_key(*key))
            .map(str::to_string)
            .collect();
        self.publish();

        if failures.is_empty() {
            self.last_hash = Some(hash.to_string());
            Ok(())
        } else {
            self.last_hash = None;
            Err(anyhow!("routing failed for {}", failures.join("; ")))
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        let routes: Vec<(String, Route)> = self.routes.drain().collect();
        let results = join_all(routes.iter().map(|(_, route)| route.stream.close())).await;
        self.order.clear();
        self.last_hash = None;
        self.publish();

        let failures: Vec<String> = routes
            .iter()
            .zip(results)
            .filter_map(|((key, _), r)| r.err().map(|e| format!("{}: {:#}", key, e)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("failed to stop {}", failures.join("; ")))
        }
    }
}
