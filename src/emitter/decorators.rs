//! Decorators run per routing key after programs are resolved.
//!
//! A decorator may change program configurations or add synthetic programs,
//! never drop the ones it was given.

use crate::info::AgentInfo;
use crate::program::{monitoring_spec, output_section, Program};
use crate::transpiler::{Ast, Dict, Node};
use anyhow::{anyhow, bail, Context, Result};

pub trait Decorator: Send + Sync {
    fn name(&self) -> &'static str;

    fn decorate(
        &self,
        agent: &AgentInfo,
        key: &str,
        ast: &Ast,
        programs: Vec<Program>,
    ) -> Result<Vec<Program>>;
}

/// Settings read from `agent.monitoring`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringSettings {
    pub enabled: bool,
    pub logs: bool,
    pub metrics: bool,
    pub use_output: String,
}

impl MonitoringSettings {
    /// Read the settings, defaulting the output to the routing key.
    pub fn from_ast(ast: &Ast, key: &str) -> Result<Self> {
        let flag = |name: &str| -> Result<bool> {
            let path = format!("agent.monitoring.{}", name);
            match ast.lookup(&path) {
                None => Ok(true),
                Some(node) => node
                    .as_bool()
                    .ok_or_else(|| anyhow!("{} must be a bool, found {}", path, node.kind())),
            }
        };
        let use_output = match ast.lookup("agent.monitoring.use_output") {
            None => key.to_string(),
            Some(Node::Str(name)) => name.clone(),
            Some(other) => bail!(
                "agent.monitoring.use_output must be a string, found {}",
                other.kind()
            ),
        };
        Ok(Self {
            enabled: flag("enabled")?,
            logs: flag("logs")?,
            metrics: flag("metrics")?,
            use_output,
        })
    }

    fn to_node(&self) -> Node {
        let mut monitoring = Dict::new();
        monitoring.insert("enabled", Node::Bool(self.enabled));
        monitoring.insert("logs", Node::Bool(self.logs));
        monitoring.insert("metrics", Node::Bool(self.metrics));
        monitoring.insert("use_output", Node::from(self.use_output.as_str()));
        Node::Dict(monitoring)
    }
}

/// Appends the `monitoring` program to every routing key.
///
/// The program is added even when monitoring is disabled, carrying
/// `enabled: false`, so the supervisor can stop a running monitor.
pub struct MonitoringDecorator;

impl Decorator for MonitoringDecorator {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    fn decorate(
        &self,
        _agent: &AgentInfo,
        key: &str,
        ast: &Ast,
        mut programs: Vec<Program>,
    ) -> Result<Vec<Program>> {
        let settings = MonitoringSettings::from_ast(ast, key)?;
        let outputs = ast
            .lookup("outputs")
            .and_then(Node::as_dict)
            .ok_or_else(|| anyhow!("outputs are required for monitoring"))?;
        if !outputs.contains_key(&settings.use_output) {
            bail!(
                "monitoring output '{}' is not declared in outputs",
                settings.use_output
            );
        }
        let output = output_section(outputs, &settings.use_output)?
            .ok_or_else(|| anyhow!("monitoring output '{}' is disabled", settings.use_output))?;

        let spec = monitoring_spec();
        if let Some(output_type) = output.as_dict().and_then(|o| o.keys().next()) {
            if !spec.supports_output(output_type) {
                bail!("monitoring cannot ship to output type {}", output_type);
            }
        }

        let monitored: Vec<Node> = programs
            .iter()
            .map(|p| {
                let mut entry = Dict::new();
                entry.insert("name", Node::from(p.name()));
                entry.insert("hash", Node::from(p.hash()));
                Node::Dict(entry)
            })
            .collect();

        let mut config = Ast::new();
        config.insert("output", output)?;
        config.insert("agent.monitoring", settings.to_node())?;
        config.insert("programs", Node::List(monitored))?;

        programs.push(Program::new(spec, config));
        Ok(programs)
    }
}

/// Injects the policy's `fleet` section into programs that ask for it.
pub struct FleetMetadataDecorator;

impl Decorator for FleetMetadataDecorator {
    fn name(&self) -> &'static str {
        "fleet_metadata"
    }

    fn decorate(
        &self,
        agent: &AgentInfo,
        _key: &str,
        ast: &Ast,
        mut programs: Vec<Program>,
    ) -> Result<Vec<Program>> {
        let Some(fleet) = ast.lookup("fleet") else {
            return Ok(programs);
        };
        for program in programs
            .iter_mut()
            .filter(|p| p.spec.capabilities.fleet_metadata)
        {
            let name = program.name().to_string();
            program
                .config
                .insert("fleet", fleet.clone())
                .and_then(|_| {
                    program
                        .config
                        .insert("agent.id", Node::from(agent.agent_id.as_str()))
                })
                .with_context(|| format!("Failed to inject fleet metadata into {}", name))?;
        }
        Ok(programs)
    }
}
