use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fleet_agent::config::Environment;
use fleet_agent::emitter::Emitter;
use fleet_agent::info::AgentInfo;
use fleet_agent::program::group_by_outputs;
use fleet_agent::router::{FileStreamFactory, Router};
use fleet_agent::transpiler::{Ast, Node, OnConflict, Rule, RuleList, Vars};
use std::sync::Arc;

const POLICY: &str = r#"
outputs:
  default:
    type: elasticsearch
    hosts: [127.0.0.1:9200]
    username: elastic
  monitoring:
    type: elasticsearch
    hosts: [127.0.0.1:9201]
inputs:
  - type: log
    streams:
      - paths: /var/log/syslog
      - paths: /var/log/auth.log
  - type: system/metrics
    use_output: monitoring
    streams:
      - metricsets: [cpu, memory]
        period: 10s
"#;

/// Benchmark parsing a policy into a configuration tree
fn bench_parse(c: &mut Criterion) {
    c.bench_function("ast_parse", |b| {
        b.iter(|| {
            black_box(Ast::from_yaml_str(black_box(POLICY)).unwrap());
        });
    });
}

/// Benchmark variable substitution over the whole tree
fn bench_substitution(c: &mut Criterion) {
    let vars = Vars::new(Ast::from_yaml_str("host:\n  name: bench-host\n  ip: 10.0.0.1\n").unwrap());
    let node = Node::from("${host.name}:${host.ip|'127.0.0.1'}");

    c.bench_function("vars_apply", |b| {
        b.iter(|| {
            black_box(node.apply(&vars, &mut None).unwrap());
        });
    });
}

/// Benchmark a program rule list
fn bench_rules(c: &mut Criterion) {
    let agent = AgentInfo::with_id("bench-agent");
    let policy = Ast::from_yaml_str(POLICY).unwrap();
    let (_, ast) = group_by_outputs(&policy).unwrap().remove(0);
    let rules = RuleList::new(vec![
        Rule::FixStream {},
        Rule::inject_index("logs"),
        Rule::inject_stream_processor("logs", OnConflict::InsertAfter),
        Rule::InjectAgentInfo {},
        Rule::filter_values("inputs", "type", &["log"]),
        Rule::copy("inputs", "filebeat"),
        Rule::filter(&["filebeat", "output"]),
    ]);

    c.bench_function("rule_list_apply", |b| {
        b.iter(|| {
            let mut tree = ast.clone();
            rules.apply(&agent, &mut tree).unwrap();
            black_box(tree);
        });
    });
}

/// Benchmark full policy compilation without routing
fn bench_compile(c: &mut Criterion) {
    let temp_dir = tempfile::tempdir().unwrap();
    let env = Arc::new(Environment::rooted_at(temp_dir.path()));
    let router = Router::new(Arc::new(FileStreamFactory::new(env.programs_dir())));
    let emitter = Emitter::new(env, Arc::new(AgentInfo::with_id("bench-agent")), Box::new(router));
    let policy: serde_yaml::Value = serde_yaml::from_str(POLICY).unwrap();

    c.bench_function("emitter_compile", |b| {
        b.iter(|| {
            black_box(emitter.compile(policy.clone()).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_parse,
    bench_substitution,
    bench_rules,
    bench_compile
);
criterion_main!(benches);
