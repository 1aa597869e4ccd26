//! Prometheus metrics for the agent
//!
//! Counters live in a private registry owned by [`AgentMetrics`]; the
//! optional HTTP endpoint serves them in the text exposition format.

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Agent counters
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    pub emissions: IntCounter,
    pub emission_failures: IntCounter,
    pub checkins: IntCounter,
    pub checkin_failures: IntCounter,
    pub actions_dispatched: IntCounterVec,
    pub acks_committed: IntCounter,
}

impl AgentMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let emissions = IntCounter::new(
            "fleet_agent_emissions_total",
            "Policies compiled and routed successfully",
        )?;
        let emission_failures = IntCounter::new(
            "fleet_agent_emission_failures_total",
            "Policies rejected during compilation or routing",
        )?;
        let checkins = IntCounter::new("fleet_agent_checkins_total", "Successful checkins")?;
        let checkin_failures =
            IntCounter::new("fleet_agent_checkin_failures_total", "Failed checkin attempts")?;
        let actions_dispatched = IntCounterVec::new(
            Opts::new(
                "fleet_agent_actions_dispatched_total",
                "Actions handed to a handler, by type",
            ),
            &["type"],
        )?;
        let acks_committed = IntCounter::new(
            "fleet_agent_acks_committed_total",
            "Acknowledgement events delivered to the control plane",
        )?;

        registry.register(Box::new(emissions.clone()))?;
        registry.register(Box::new(emission_failures.clone()))?;
        registry.register(Box::new(checkins.clone()))?;
        registry.register(Box::new(checkin_failures.clone()))?;
        registry.register(Box::new(actions_dispatched.clone()))?;
        registry.register(Box::new(acks_committed.clone()))?;

        Ok(Self {
            registry,
            emissions,
            emission_failures,
            checkins,
            checkin_failures,
            actions_dispatched,
            acks_committed,
        })
    }

    /// Render every registered metric in the text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve `/metrics` on `port` until `shutdown` is cancelled.
    pub async fn serve(self: Arc<Self>, port: u16, shutdown: CancellationToken) -> Result<()> {
        use axum::{http::StatusCode, routing::get, Router};
        use tower_http::cors::CorsLayer;

        let metrics = self.clone();
        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let metrics = metrics.clone();
                    async move {
                        match metrics.render() {
                            Ok(body) => (StatusCode::OK, body),
                            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        }
                    }
                }),
            )
            .layer(CorsLayer::permissive());

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics endpoint on {}", addr))?;
        info!("Serving metrics on http://{}/metrics", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }

    /// Run [`AgentMetrics::serve`] in the background, logging failures.
    pub fn spawn_server(
        self: Arc<Self>,
        port: u16,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.serve(port, shutdown).await {
                error!("Metrics endpoint stopped: {:#}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.emissions.inc();
        metrics.actions_dispatched.with_label_values(&["POLICY_CHANGE"]).inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("fleet_agent_emissions_total 1"));
        assert!(text.contains("fleet_agent_actions_dispatched_total{type=\"POLICY_CHANGE\"} 1"));
    }

    #[test]
    fn test_independent_registries() {
        let first = AgentMetrics::new().unwrap();
        let second = AgentMetrics::new().unwrap();
        first.checkins.inc();
        assert_eq!(second.checkins.get(), 0);
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let metrics = Arc::new(AgentMetrics::new().unwrap());
        let token = CancellationToken::new();
        let handle = metrics.spawn_server(0, token.clone());
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
