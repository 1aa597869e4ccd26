//! Programs and routing
//!
//! A policy is split into one group per output actually used by an input.
//! Every group is then matched against the spec catalogue; each spec that
//! finds work in the group yields a [`Program`]. Groups are keyed by output
//! name and kept in first-seen order in a [`RoutingTable`].

pub mod spec;

pub use spec::{find_spec, monitoring_spec, supported_specs, Capabilities, Spec, MONITORING_NAME};

use crate::transpiler::{AgentIdentity, Ast, Dict, Node, TranspilerError, TranspilerResult};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

const OUTPUTS_KEY: &str = "outputs";
const INPUTS_KEY: &str = "inputs";
const USE_OUTPUT_KEY: &str = "use_output";
/// Output used by inputs without `use_output`.
pub const DEFAULT_OUTPUT: &str = "default";

/// One runnable component and its configuration slice
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub spec: Arc<Spec>,
    pub config: Ast,
}

impl Program {
    pub fn new(spec: Arc<Spec>, config: Ast) -> Self {
        Self { spec, config }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn cmd(&self) -> &str {
        &self.spec.cmd
    }

    /// Hash of the program configuration
    pub fn hash(&self) -> String {
        self.config.hash()
    }
}

/// Programs per routing key, in first-seen key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingTable {
    groups: Vec<(String, Vec<Program>)>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Program])> {
        self.groups.iter().map(|(k, p)| (k.as_str(), p.as_slice()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Vec<Program>)> {
        self.groups.iter_mut().map(|(k, p)| (k.as_str(), p))
    }

    pub fn get(&self, key: &str) -> Option<&[Program]> {
        self.groups
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, p)| p.as_slice())
    }

    /// Add programs under `key`, appending when the key already exists.
    pub fn push(&mut self, key: impl Into<String>, programs: Vec<Program>) {
        let key = key.into();
        match self.groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => existing.extend(programs),
            None => self.groups.push((key, programs)),
        }
    }

    /// Every program across all keys
    pub fn programs(&self) -> impl Iterator<Item = &Program> {
        self.groups.iter().flat_map(|(_, p)| p.iter())
    }

    /// Content hash over keys, program names and program hashes.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, programs) in &self.groups {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            for program in programs {
                hasher.update(program.name().as_bytes());
                hasher.update([0]);
                hasher.update(program.hash().as_bytes());
                hasher.update([0]);
            }
            hasher.update([1]);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Split a policy into one configuration per output used by its inputs.
///
/// Each group holds `output: {<type>: <settings>}`, the inputs routed to it
/// and every other top-level key of the policy. A policy with no inputs
/// yields no groups.
pub fn group_by_outputs(ast: &Ast) -> TranspilerResult<Vec<(String, Ast)>> {
    let inputs = match ast.lookup(INPUTS_KEY) {
        None => return Ok(Vec::new()),
        Some(Node::List(inputs)) if inputs.is_empty() => return Ok(Vec::new()),
        Some(Node::List(inputs)) => inputs,
        Some(other) => {
            return Err(TranspilerError::InvalidType {
                path: INPUTS_KEY.to_string(),
                expected: "list",
                found: other.kind(),
            })
        }
    };
    let outputs = match ast.lookup(OUTPUTS_KEY) {
        Some(Node::Dict(outputs)) => outputs,
        Some(other) => {
            return Err(TranspilerError::InvalidType {
                path: OUTPUTS_KEY.to_string(),
                expected: "dict",
                found: other.kind(),
            })
        }
        None => {
            return Err(TranspilerError::InvalidPath(format!(
                "{} is required when inputs are declared",
                OUTPUTS_KEY
            )))
        }
    };

    let mut routed: Vec<(String, Vec<Node>)> = Vec::new();
    for input in inputs {
        let mut input = input.clone();
        let target = match input.as_dict_mut().and_then(|d| d.remove(USE_OUTPUT_KEY)) {
            Some(Node::Str(name)) => name,
            Some(other) => {
                return Err(TranspilerError::InvalidType {
                    path: format!("{}.{}", INPUTS_KEY, USE_OUTPUT_KEY),
                    expected: "string",
                    found: other.kind(),
                })
            }
            None => DEFAULT_OUTPUT.to_string(),
        };
        if !outputs.contains_key(&target) {
            return Err(TranspilerError::InvalidPath(format!(
                "input references unknown output '{}'",
                target
            )));
        }
        match routed.iter_mut().find(|(k, _)| *k == target) {
            Some((_, list)) => list.push(input),
            None => routed.push((target, vec![input])),
        }
    }

    let mut shared = ast.root().clone();
    shared.remove(OUTPUTS_KEY);
    shared.remove(INPUTS_KEY);

    let mut groups = Vec::with_capacity(routed.len());
    for (name, inputs) in routed {
        let Some(output) = output_section(outputs, &name)? else {
            debug!("Output {} is disabled, skipping its inputs", name);
            continue;
        };
        let mut group = Dict::new();
        group.insert("output", output);
        group.insert(INPUTS_KEY, Node::List(inputs));
        for (key, value) in shared.iter() {
            group.insert(key, value.clone());
        }
        groups.push((name, Ast::from_dict(group)));
    }
    Ok(groups)
}

/// `{<type>: <settings>}` for the output called `name`, `None` when disabled.
pub fn output_section(outputs: &Dict, name: &str) -> TranspilerResult<Option<Node>> {
    let path = format!("{}.{}", OUTPUTS_KEY, name);
    let Some(Node::Dict(settings)) = outputs.get(name) else {
        return Err(TranspilerError::InvalidType {
            path,
            expected: "dict",
            found: outputs.get(name).map(Node::kind).unwrap_or("nothing"),
        });
    };
    let mut settings = settings.clone();
    if settings.remove("enabled").and_then(|e| e.as_bool()) == Some(false) {
        return Ok(None);
    }
    let output_type = match settings.remove("type") {
        Some(Node::Str(t)) if !t.is_empty() => t,
        other => {
            return Err(TranspilerError::InvalidType {
                path: format!("{}.type", path),
                expected: "string",
                found: other.as_ref().map(Node::kind).unwrap_or("nothing"),
            })
        }
    };
    let mut section = Dict::new();
    section.insert(output_type, Node::Dict(settings));
    Ok(Some(Node::Dict(section)))
}

/// Resolve the programs of every group against `specs`.
///
/// Groups in which no spec finds work are left out.
pub fn resolve(
    agent: &dyn AgentIdentity,
    ast: &Ast,
    specs: &[Arc<Spec>],
) -> TranspilerResult<RoutingTable> {
    let mut table = RoutingTable::new();
    for (key, group) in group_by_outputs(ast)? {
        let mut programs = Vec::new();
        for spec in specs {
            if let Some(config) = spec.detect(agent, &group)? {
                programs.push(Program::new(spec.clone(), config));
            }
        }
        if programs.is_empty() {
            debug!("No program handles the inputs routed to {}", key);
            continue;
        }
        table.push(key, programs);
    }
    Ok(table)
}
