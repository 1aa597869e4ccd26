//! Program specifications
//!
//! A [`Spec`] describes one runnable component: the command that runs it,
//! the output types it can ship to, what it is capable of, and the rules
//! that cut its slice out of a group configuration.

use crate::transpiler::{AgentIdentity, Ast, Node, OnConflict, Rule, RuleList, TranspilerResult};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing::error;

/// Name of the synthetic program injected by the monitoring decorator.
pub const MONITORING_NAME: &str = "monitoring";

/// Optional behaviour a program declares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Receives the policy's `fleet` section
    pub fleet_metadata: bool,
    /// Input types whose application actions this program handles
    pub app_action_inputs: Vec<String>,
}

/// Execution contract of a program
#[derive(Debug, Clone, PartialEq)]
pub struct Spec {
    pub name: String,
    pub cmd: String,
    /// Where the program's inputs live once its rules ran
    pub inputs_path: String,
    /// Supported output types
    pub outputs: Vec<String>,
    pub capabilities: Capabilities,
    pub rules: RuleList,
}

impl Spec {
    pub fn new(name: &str, inputs_path: &str, outputs: &[&str], rules: Vec<Rule>) -> Self {
        Self {
            name: name.to_string(),
            cmd: name.to_string(),
            inputs_path: inputs_path.to_string(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            capabilities: Capabilities::default(),
            rules: RuleList::new(rules),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn supports_output(&self, output_type: &str) -> bool {
        self.outputs.iter().any(|o| o == output_type)
    }

    pub fn handles_app_action(&self, input_type: &str) -> bool {
        self.capabilities
            .app_action_inputs
            .iter()
            .any(|t| t == input_type)
    }

    /// Cut this spec's slice out of a group configuration.
    ///
    /// Returns `None` when nothing in the group is for this spec or the
    /// group's output type is not supported.
    pub fn detect(&self, agent: &dyn AgentIdentity, group: &Ast) -> TranspilerResult<Option<Ast>> {
        let Some(output_type) = output_type(group) else {
            return Ok(None);
        };
        if !self.supports_output(output_type) {
            return Ok(None);
        }

        let mut config = group.clone();
        self.rules.apply(agent, &mut config)?;
        let has_inputs = matches!(
            config.lookup(&self.inputs_path),
            Some(Node::List(inputs)) if !inputs.is_empty()
        );
        Ok(has_inputs.then_some(config))
    }
}

/// Type of the single output of a group configuration.
pub fn output_type(group: &Ast) -> Option<&str> {
    group
        .lookup("output")
        .and_then(Node::as_dict)
        .and_then(|outputs| outputs.keys().next())
}

const BEAT_OUTPUTS: &[&str] = &["elasticsearch", "logstash", "kafka", "redis"];

static SUPPORTED: Lazy<Vec<Arc<Spec>>> = Lazy::new(|| {
    let mut specs = Vec::new();
    for (name, spec) in [
        ("filebeat", filebeat()),
        ("metricbeat", metricbeat()),
        ("heartbeat", heartbeat()),
        ("endpoint-security", endpoint_security()),
    ] {
        match spec {
            Ok(spec) => specs.push(Arc::new(spec)),
            Err(e) => error!("Built-in spec {} is invalid: {}", name, e),
        }
    }
    specs
});

/// The built-in program catalogue, in detection order.
pub fn supported_specs() -> Vec<Arc<Spec>> {
    SUPPORTED.clone()
}

/// Look up a built-in spec by name.
pub fn find_spec(name: &str) -> Option<Arc<Spec>> {
    SUPPORTED.iter().find(|s| s.name == name).cloned()
}

/// Spec of the monitoring program; it has no rules of its own.
pub fn monitoring_spec() -> Arc<Spec> {
    static MONITORING: Lazy<Arc<Spec>> =
        Lazy::new(|| Arc::new(Spec::new(MONITORING_NAME, "programs", BEAT_OUTPUTS, Vec::new())));
    MONITORING.clone()
}

fn data_stream_rules(stream_type: &str) -> Vec<Rule> {
    vec![
        Rule::FixStream {},
        Rule::inject_index(stream_type),
        Rule::inject_stream_processor(stream_type, OnConflict::InsertAfter),
        Rule::InjectAgentInfo {},
    ]
}

fn filebeat() -> TranspilerResult<Spec> {
    let mut rules = data_stream_rules("logs");
    rules.extend([
        Rule::filter_values(
            "inputs",
            "type",
            &["log", "logfile", "filestream", "syslog", "tcp", "udp", "container"],
        ),
        Rule::copy("inputs", "filebeat"),
        Rule::filter(&["filebeat", "output", "keystore"]),
    ]);
    Ok(Spec::new("filebeat", "filebeat.inputs", BEAT_OUTPUTS, rules))
}

fn metricbeat() -> TranspilerResult<Spec> {
    let mut rules = data_stream_rules("metrics");
    rules.extend([
        Rule::filter_values_with_regexp("inputs", "type", "^.+/metrics$")?,
        Rule::Map {
            path: "inputs".to_string(),
            rules: RuleList::new(vec![
                Rule::TranslateWithRegexp {
                    path: "type".to_string(),
                    re: crate::transpiler::rules::Pattern::new("^(.+)/metrics$")?,
                    with: "$1".to_string(),
                },
                Rule::rename("type", "module"),
            ]),
        },
        Rule::copy("inputs", "metricbeat"),
        Rule::rename("metricbeat.inputs", "modules"),
        Rule::filter(&["metricbeat", "output", "keystore"]),
    ]);
    Ok(Spec::new("metricbeat", "metricbeat.modules", BEAT_OUTPUTS, rules))
}

fn heartbeat() -> TranspilerResult<Spec> {
    let mut rules = data_stream_rules("synthetics");
    rules.extend([
        Rule::filter_values_with_regexp("inputs", "type", "^synthetics/.+$")?,
        Rule::copy("inputs", "heartbeat"),
        Rule::filter(&["heartbeat", "output", "keystore"]),
    ]);
    Ok(Spec::new("heartbeat", "heartbeat.inputs", BEAT_OUTPUTS, rules))
}

fn endpoint_security() -> TranspilerResult<Spec> {
    let rules = vec![
        Rule::FixStream {},
        Rule::filter_values("inputs", "type", &["endpoint"]),
        Rule::filter(&["inputs", "output", "revision"]),
    ];
    Ok(
        Spec::new("endpoint-security", "inputs", &["elasticsearch"], rules).with_capabilities(
            Capabilities {
                fleet_metadata: true,
                app_action_inputs: vec!["endpoint".to_string()],
            },
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::AgentInfo;

    fn group(yaml: &str) -> Ast {
        Ast::from_yaml_str(yaml).unwrap()
    }

    #[test]
    fn test_catalogue_is_complete() {
        let names: Vec<String> = supported_specs().iter().map(|s| s.name.clone()).collect();
        assert_eq!(
            names,
            vec!["filebeat", "metricbeat", "heartbeat", "endpoint-security"]
        );
        assert!(find_spec("endpoint-security")
            .unwrap()
            .handles_app_action("endpoint"));
        assert!(find_spec("nope").is_none());
    }

    #[test]
    fn test_filebeat_detection() {
        let agent = AgentInfo::with_id("id");
        let config = group(
            r#"
output:
  elasticsearch: {hosts: ["localhost:9200"]}
inputs:
  - type: log
    streams:
      - paths: /var/log/*.log
  - type: system/metrics
    streams:
      - metricsets: [cpu]
"#,
        );
        let spec = find_spec("filebeat").unwrap();
        let rendered = spec.detect(&agent, &config).unwrap().unwrap();
        let inputs = rendered.lookup("filebeat.inputs").unwrap().as_list().unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(
            rendered.lookup_str("filebeat.inputs.0.streams.0.index"),
            Some("logs-generic-default")
        );
        assert!(rendered.contains("output.elasticsearch"));
        assert!(!rendered.contains("inputs"));
    }

    #[test]
    fn test_metricbeat_module_translation() {
        let agent = AgentInfo::with_id("id");
        let config = group(
            "output:\n  elasticsearch: {}\ninputs:\n  - type: system/metrics\n    streams:\n      - metricsets: [cpu]\n",
        );
        let spec = find_spec("metricbeat").unwrap();
        let rendered = spec.detect(&agent, &config).unwrap().unwrap();
        assert_eq!(rendered.lookup_str("metricbeat.modules.0.module"), Some("system"));
    }

    #[test]
    fn test_no_matching_inputs_or_output() {
        let agent = AgentInfo::with_id("id");
        let config = group("output:\n  elasticsearch: {}\ninputs:\n  - type: log\n");
        assert!(find_spec("heartbeat").unwrap().detect(&agent, &config).unwrap().is_none());

        let config = group("output:\n  logstash: {}\ninputs:\n  - type: endpoint\n");
        assert!(find_spec("endpoint-security")
            .unwrap()
            .detect(&agent, &config)
            .unwrap()
            .is_none());
    }
}
