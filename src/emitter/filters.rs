//! Filters run over the policy tree before programs are resolved.

use crate::config::{CapabilityDecision, CapabilityRule};
use crate::program::DEFAULT_OUTPUT;
use crate::transpiler::{Ast, Node};
use anyhow::{anyhow, bail, Result};
use tracing::info;

/// A validation or rewriting step over the whole policy
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    fn filter(&self, ast: &mut Ast) -> Result<()>;
}

/// Checks the shape of `inputs`, their `streams` and `outputs`.
pub struct InputsValidator;

impl Filter for InputsValidator {
    fn name(&self) -> &'static str {
        "inputs_validator"
    }

    fn filter(&self, ast: &mut Ast) -> Result<()> {
        if let Some(inputs) = ast.lookup("inputs") {
            let inputs = inputs
                .as_list()
                .ok_or_else(|| anyhow!("inputs must be a list, found {}", inputs.kind()))?;
            for (idx, input) in inputs.iter().enumerate() {
                let Node::Dict(input) = input else {
                    bail!("inputs.{} must be a dict, found {}", idx, input.kind());
                };
                match input.get("type") {
                    Some(Node::Str(t)) if !t.is_empty() => {}
                    Some(other) => bail!(
                        "inputs.{}.type must be a non-empty string, found {}",
                        idx,
                        other.kind()
                    ),
                    None => bail!("inputs.{}.type is required", idx),
                }
                if let Some(streams) = input.get("streams") {
                    let Node::List(streams) = streams else {
                        bail!("inputs.{}.streams must be a list, found {}", idx, streams.kind());
                    };
                    if let Some((sidx, stream)) = streams
                        .iter()
                        .enumerate()
                        .find(|(_, s)| s.as_dict().is_none())
                    {
                        bail!(
                            "inputs.{}.streams.{} must be a dict, found {}",
                            idx,
                            sidx,
                            stream.kind()
                        );
                    }
                }
            }
        }

        if let Some(outputs) = ast.lookup("outputs") {
            let outputs = outputs
                .as_dict()
                .ok_or_else(|| anyhow!("outputs must be a dict, found {}", outputs.kind()))?;
            for (name, output) in outputs.iter() {
                match output.lookup("type") {
                    Some(Node::Str(t)) if !t.is_empty() => {}
                    _ => bail!("outputs.{}.type is required", name),
                }
            }
        }
        Ok(())
    }
}

/// Applies allow/deny rules to input and output types.
///
/// Rules are checked in order and the first match decides; a type that no
/// rule matches is allowed. Denied outputs take the inputs routed to them
/// along.
pub struct CapabilitiesFilter {
    rules: Vec<CapabilityRule>,
}

impl CapabilitiesFilter {
    pub fn new(rules: Vec<CapabilityRule>) -> Self {
        Self { rules }
    }

    fn allows(&self, pick: impl Fn(&CapabilityRule) -> Option<&String>, value: &str) -> bool {
        self.rules
            .iter()
            .find(|rule| pick(rule).is_some_and(|pattern| pattern_matches(pattern, value)))
            .map(|rule| rule.rule == CapabilityDecision::Allow)
            .unwrap_or(true)
    }

    fn allows_input(&self, input_type: &str) -> bool {
        self.allows(|r| r.input.as_ref(), input_type)
    }

    fn allows_output(&self, output_type: &str) -> bool {
        self.allows(|r| r.output.as_ref(), output_type)
    }
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

impl Filter for CapabilitiesFilter {
    fn name(&self) -> &'static str {
        "capabilities"
    }

    fn filter(&self, ast: &mut Ast) -> Result<()> {
        if self.rules.is_empty() {
            return Ok(());
        }

        let mut denied_outputs = Vec::new();
        if let Some(Node::Dict(outputs)) = ast.lookup_mut("outputs") {
            let names: Vec<String> = outputs.keys().map(str::to_string).collect();
            for name in names {
                let output_type = outputs
                    .get(&name)
                    .and_then(|o| o.lookup("type"))
                    .and_then(Node::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !self.allows_output(&output_type) {
                    info!("Output {} of type {} denied by capabilities", name, output_type);
                    outputs.remove(&name);
                    denied_outputs.push(name);
                }
            }
        }

        if let Some(Node::List(inputs)) = ast.lookup_mut("inputs") {
            inputs.retain(|input| {
                let input_type = input.lookup("type").and_then(Node::as_str).unwrap_or_default();
                if !self.allows_input(input_type) {
                    info!("Input of type {} denied by capabilities", input_type);
                    return false;
                }
                let target = input
                    .lookup("use_output")
                    .and_then(Node::as_str)
                    .unwrap_or(DEFAULT_OUTPUT);
                !denied_outputs.iter().any(|o| o == target)
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ast(yaml: &str) -> Ast {
        Ast::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn test_valid_policy_passes() {
        let mut policy = ast(
            "outputs:\n  default: {type: elasticsearch}\ninputs:\n  - type: log\n    streams:\n      - paths: /x\n",
        );
        InputsValidator.filter(&mut policy).unwrap();
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        for yaml in [
            "inputs: nope\n",
            "inputs:\n  - nope\n",
            "inputs:\n  - streams: []\n",
            "inputs:\n  - type: ''\n",
            "inputs:\n  - type: log\n    streams: {a: b}\n",
            "inputs:\n  - type: log\n    streams: [x]\n",
            "outputs: [a]\n",
            "outputs:\n  default: {hosts: [a]}\n",
        ] {
            let mut policy = ast(yaml);
            assert!(InputsValidator.filter(&mut policy).is_err(), "{}", yaml);
        }
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("system/*", "system/metrics"));
        assert!(pattern_matches("log", "log"));
        assert!(!pattern_matches("log", "logfile"));
        assert!(pattern_matches("*", "anything"));
    }

    #[test]
    fn test_capabilities_deny_inputs_and_outputs() {
        let rules: Vec<CapabilityRule> = serde_yaml::from_str(
            r#"
- rule: allow
  input: system/cpu
- rule: deny
  input: "system/*"
- rule: deny
  output: kafka
"#,
        )
        .unwrap();
        let filter = CapabilitiesFilter::new(rules);
        let mut policy = ast(
            r#"
outputs:
  default: {type: elasticsearch}
  queue: {type: kafka}
inputs:
  - type: system/cpu
  - type: system/metrics
  - type: log
    use_output: queue
  - type: log
"#,
        );
        filter.filter(&mut policy).unwrap();

        let types: Vec<&str> = policy
            .lookup("inputs")
            .unwrap()
            .as_list()
            .unwrap()
            .iter()
            .map(|i| i.lookup("type").and_then(Node::as_str).unwrap())
            .collect();
        assert_eq!(types, vec!["system/cpu", "log"]);
        assert!(!policy.contains("outputs.queue"));
        assert!(policy.contains("outputs.default"));
    }
}
