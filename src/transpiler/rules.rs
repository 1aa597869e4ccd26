//! Declarative rewrite rules.
//!
//! A [`RuleList`] is applied in order over one tree; every rule observes the
//! output of the rules before it. Rule lists deserialize from YAML as a list
//! of single-key maps:
//!
//! ```yaml
//! - fix_stream: {}
//! - inject_index:
//!     type: logs
//! - copy:
//!     from: inputs
//!     to: filebeat
//! - filter:
//!     selectors: [filebeat, output]
//! ```

use super::ast::{split_path, Ast, Dict, Node};
use super::{TranspilerError, TranspilerResult};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_DATASET: &str = "generic";

/// Identity of the running agent, injected into rendered inputs.
pub trait AgentIdentity {
    fn agent_id(&self) -> &str;
    fn version(&self) -> &str;
    fn snapshot(&self) -> bool;
}

/// How injected values combine with values already present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnConflict {
    /// Injected values go after existing ones.
    #[default]
    InsertAfter,
    /// Injected values go before existing ones.
    InsertBefore,
    /// Existing values are left untouched.
    Noop,
}

/// A compiled regular expression that (de)serializes as its source string.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(re: &str) -> TranspilerResult<Self> {
        Ok(Self(Regex::new(re)?))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Regex::new(&raw)
            .map(Pattern)
            .map_err(serde::de::Error::custom)
    }
}

/// A single tree rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// Copy the selected nodes, keyed by their last segment, into a dict at `path`.
    SelectInto { selectors: Vec<String>, path: String },
    /// Insert the `from` node, keyed by its last segment, under `to`.
    Copy { from: String, to: String },
    /// Copy `item` into every dict of the list at `to`.
    CopyToList {
        item: String,
        to: String,
        #[serde(default)]
        on_conflict: OnConflict,
    },
    /// Copy every top-level key except `except` into every dict of the list at `to`.
    CopyAllToList {
        to: String,
        #[serde(default)]
        except: Vec<String>,
        #[serde(default)]
        on_conflict: OnConflict,
    },
    /// Rename the last key of `from`. A dotted `to` moves the node to that path.
    Rename { from: String, to: String },
    /// Replace the value at `path` when it matches a key of `mapper`.
    Translate {
        path: String,
        mapper: BTreeMap<String, serde_yaml::Value>,
    },
    /// Regex replacement on the string at `path`.
    TranslateWithRegexp {
        path: String,
        re: Pattern,
        with: String,
    },
    /// Apply nested rules to the dict at `path`, or to every dict of the list there.
    Map { path: String, rules: RuleList },
    /// Keep only the selected branches.
    Filter { selectors: Vec<String> },
    /// Drop list items whose `key` is present and not one of `values`.
    FilterValues {
        selector: String,
        key: String,
        values: Vec<serde_yaml::Value>,
    },
    /// Keep list items whose string `key` matches `re`.
    FilterValuesWithRegexp {
        selector: String,
        key: String,
        re: Pattern,
    },
    /// Collect `item` from every entry of the list at `path` into a list at `to`.
    ExtractListItems {
        path: String,
        item: String,
        to: String,
    },
    /// Add `index: {type}-{dataset}-{namespace}` to every stream.
    InjectIndex {
        #[serde(rename = "type")]
        index_type: String,
    },
    /// Add `add_fields` processors describing the data stream to every stream.
    InjectStreamProcessor {
        #[serde(rename = "type")]
        stream_type: String,
        #[serde(default)]
        on_conflict: OnConflict,
    },
    /// Add an `add_fields` processor with the agent identity to every input.
    InjectAgentInfo {},
    /// Wrap the node at `item` into a one-element list at `to`.
    MakeArray { item: String, to: String },
    /// Remove a top-level key.
    RemoveKey { key: String },
    /// Default missing or empty data stream namespaces and datasets.
    FixStream {},
}

impl Rule {
    pub fn copy(from: &str, to: &str) -> Self {
        Rule::Copy {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn rename(from: &str, to: &str) -> Self {
        Rule::Rename {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn filter(selectors: &[&str]) -> Self {
        Rule::Filter {
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn filter_values(selector: &str, key: &str, values: &[&str]) -> Self {
        Rule::FilterValues {
            selector: selector.to_string(),
            key: key.to_string(),
            values: values
                .iter()
                .map(|v| serde_yaml::Value::String(v.to_string()))
                .collect(),
        }
    }

    pub fn filter_values_with_regexp(selector: &str, key: &str, re: &str) -> TranspilerResult<Self> {
        Ok(Rule::FilterValuesWithRegexp {
            selector: selector.to_string(),
            key: key.to_string(),
            re: Pattern::new(re)?,
        })
    }

    pub fn inject_index(index_type: &str) -> Self {
        Rule::InjectIndex {
            index_type: index_type.to_string(),
        }
    }

    pub fn inject_stream_processor(stream_type: &str, on_conflict: OnConflict) -> Self {
        Rule::InjectStreamProcessor {
            stream_type: stream_type.to_string(),
            on_conflict,
        }
    }

    /// Rule name as written in YAML.
    pub fn name(&self) -> &'static str {
        match self {
            Rule::SelectInto { .. } => "select_into",
            Rule::Copy { .. } => "copy",
            Rule::CopyToList { .. } => "copy_to_list",
            Rule::CopyAllToList { .. } => "copy_all_to_list",
            Rule::Rename { .. } => "rename",
            Rule::Translate { .. } => "translate",
            Rule::TranslateWithRegexp { .. } => "translate_with_regexp",
            Rule::Map { .. } => "map",
            Rule::Filter { .. } => "filter",
            Rule::FilterValues { .. } => "filter_values",
            Rule::FilterValuesWithRegexp { .. } => "filter_values_with_regexp",
            Rule::ExtractListItems { .. } => "extract_list_items",
            Rule::InjectIndex { .. } => "inject_index",
            Rule::InjectStreamProcessor { .. } => "inject_stream_processor",
            Rule::InjectAgentInfo {} => "inject_agent_info",
            Rule::MakeArray { .. } => "make_array",
            Rule::RemoveKey { .. } => "remove_key",
            Rule::FixStream {} => "fix_stream",
        }
    }

    /// Apply this rule to `ast` in place.
    pub fn apply(&self, agent: &dyn AgentIdentity, ast: &mut Ast) -> TranspilerResult<()> {
        match self {
            Rule::SelectInto { selectors, path } => {
                let mut target = Dict::new();
                for selector in selectors {
                    if let Some(node) = ast.lookup(selector) {
                        target.insert(last_segment(selector), node.clone());
                    }
                }
                if !target.is_empty() {
                    ast.insert(path, Node::Dict(target))?;
                }
                Ok(())
            }
            Rule::Copy { from, to } => {
                let Some(node) = ast.lookup(from).cloned() else {
                    return Ok(());
                };
                ast.insert(&join_path(to, last_segment(from)), node)
            }
            Rule::CopyToList {
                item,
                to,
                on_conflict,
            } => copy_to_list(ast, item, to, *on_conflict),
            Rule::CopyAllToList {
                to,
                except,
                on_conflict,
            } => {
                let keys: Vec<String> = ast
                    .root()
                    .keys()
                    .filter(|k| !except.iter().any(|e| e.as_str() == *k))
                    .map(str::to_string)
                    .collect();
                for key in keys {
                    copy_to_list(ast, &key, to, *on_conflict)?;
                }
                Ok(())
            }
            Rule::Rename { from, to } => rename(ast, from, to),
            Rule::Translate { path, mapper } => {
                let Some(node) = ast.lookup_mut(path) else {
                    return Ok(());
                };
                let Some(current) = node.scalar_string() else {
                    return Ok(());
                };
                if let Some(replacement) = mapper.get(&current) {
                    if let Some(replacement) = Node::from_yaml(replacement)? {
                        *node = replacement;
                    }
                }
                Ok(())
            }
            Rule::TranslateWithRegexp { path, re, with } => {
                let Some(node) = ast.lookup_mut(path) else {
                    return Ok(());
                };
                let candidate = node.as_str().ok_or_else(|| TranspilerError::InvalidType {
                    path: path.clone(),
                    expected: "string",
                    found: node.kind(),
                })?;
                let replaced = re.0.replace_all(candidate, with.as_str()).into_owned();
                *node = Node::Str(replaced);
                Ok(())
            }
            Rule::Map { path, rules } => {
                let Some(node) = ast.lookup_mut(path) else {
                    return Ok(());
                };
                match node {
                    Node::List(items) => {
                        for (idx, item) in items.iter_mut().enumerate() {
                            match item {
                                Node::Dict(dict) => {
                                    let mut sub = Ast::from_dict(std::mem::take(dict));
                                    rules.apply(agent, &mut sub)?;
                                    *dict = sub.into_root();
                                }
                                other => {
                                    return Err(TranspilerError::InvalidType {
                                        path: format!("{}.{}", path, idx),
                                        expected: "dict",
                                        found: other.kind(),
                                    })
                                }
                            }
                        }
                        Ok(())
                    }
                    Node::Dict(dict) => {
                        let mut sub = Ast::from_dict(std::mem::take(dict));
                        rules.apply(agent, &mut sub)?;
                        *dict = sub.into_root();
                        Ok(())
                    }
                    other => Err(TranspilerError::InvalidType {
                        path: path.clone(),
                        expected: "list or dict",
                        found: other.kind(),
                    }),
                }
            }
            Rule::Filter { selectors } => {
                let mut filtered = Ast::new();
                for selector in selectors {
                    if let Some(node) = ast.lookup(selector) {
                        filtered.insert(selector, node.clone())?;
                    }
                }
                *ast = filtered;
                Ok(())
            }
            Rule::FilterValues {
                selector,
                key,
                values,
            } => {
                let wanted = values
                    .iter()
                    .filter_map(|v| Node::from_yaml(v).transpose())
                    .collect::<TranspilerResult<Vec<_>>>()?;
                retain_list_items(ast, selector, |item| match item.lookup(key) {
                    None => Ok(true),
                    Some(value) => Ok(wanted.contains(value)),
                })
            }
            Rule::FilterValuesWithRegexp { selector, key, re } => {
                retain_list_items(ast, selector, |item| match item.lookup(key) {
                    None => Ok(false),
                    Some(Node::Str(candidate)) => Ok(re.0.is_match(candidate)),
                    Some(other) => Err(TranspilerError::InvalidType {
                        path: key.clone(),
                        expected: "string",
                        found: other.kind(),
                    }),
                })
            }
            Rule::ExtractListItems { path, item, to } => {
                let Some(Node::List(entries)) = ast.lookup(path) else {
                    return Ok(());
                };
                let mut extracted = Vec::new();
                for entry in entries {
                    match entry.find(item) {
                        Some(Node::List(values)) => extracted.extend(values.iter().cloned()),
                        Some(value) => extracted.push(value.clone()),
                        None => {}
                    }
                }
                ast.insert(to, Node::List(extracted))
            }
            Rule::InjectIndex { index_type } => {
                for_each_stream(ast, |input, stream| {
                    let index = format!(
                        "{}-{}-{}",
                        datastream_type(input, index_type),
                        dataset(stream),
                        namespace(input)
                    );
                    if let Node::Dict(stream) = stream {
                        stream.insert("index", Node::Str(index));
                    }
                    Ok(())
                })
            }
            Rule::InjectStreamProcessor {
                stream_type,
                on_conflict,
            } => for_each_stream(ast, |input, stream| {
                let ds_type = datastream_type(input, stream_type);
                let ns = namespace(input);
                let ds = dataset(stream);
                let Node::Dict(stream) = stream else {
                    return Ok(());
                };
                let processors = processors_list(stream, "inject_stream_processor")?;
                inject_item(
                    processors,
                    add_fields(
                        "data_stream",
                        vec![("type", ds_type.into()), ("namespace", ns.into()), ("dataset", ds.clone().into())],
                    ),
                    *on_conflict,
                );
                inject_item(
                    processors,
                    add_fields("event", vec![("dataset", ds.into())]),
                    *on_conflict,
                );
                Ok(())
            }),
            Rule::InjectAgentInfo {} => {
                let Some(Node::List(inputs)) = ast.lookup_mut("inputs") else {
                    return Ok(());
                };
                for input in inputs.iter_mut() {
                    let Node::Dict(input) = input else {
                        continue;
                    };
                    let processors = processors_list(input, "inject_agent_info")?;
                    inject_item(
                        processors,
                        add_fields(
                            "elastic_agent",
                            vec![
                                ("id", agent.agent_id().into()),
                                ("version", agent.version().into()),
                                ("snapshot", Node::Bool(agent.snapshot())),
                            ],
                        ),
                        OnConflict::InsertAfter,
                    );
                }
                Ok(())
            }
            Rule::MakeArray { item, to } => {
                let Some(node) = ast.lookup(item).cloned() else {
                    return Ok(());
                };
                ast.insert(to, Node::List(vec![node]))
            }
            Rule::RemoveKey { key } => {
                ast.root_mut().remove(key);
                Ok(())
            }
            Rule::FixStream {} => {
                let Some(Node::List(inputs)) = ast.lookup_mut("inputs") else {
                    return Ok(());
                };
                for input in inputs.iter_mut() {
                    let Node::Dict(input) = input else {
                        continue;
                    };
                    default_field(input, "data_stream", "namespace", DEFAULT_NAMESPACE)?;
                    let Some(Node::List(streams)) = input.get_mut("streams") else {
                        continue;
                    };
                    for stream in streams.iter_mut() {
                        if let Node::Dict(stream) = stream {
                            default_field(stream, "data_stream", "dataset", DEFAULT_DATASET)?;
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// Ordered list of rules applied over the same tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleList {
    rules: Vec<Rule>,
}

impl RuleList {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Apply every rule in order, stopping at the first failure.
    pub fn apply(&self, agent: &dyn AgentIdentity, ast: &mut Ast) -> TranspilerResult<()> {
        for rule in &self.rules {
            rule.apply(agent, ast).map_err(|e| match e {
                e @ TranspilerError::Rule { .. } => e,
                other => TranspilerError::Rule {
                    rule: rule.name(),
                    reason: other.to_string(),
                },
            })?;
        }
        Ok(())
    }
}

impl From<Vec<Rule>> for RuleList {
    fn from(rules: Vec<Rule>) -> Self {
        Self::new(rules)
    }
}

fn last_segment(path: &str) -> &str {
    split_path(path).last().copied().unwrap_or(path)
}

fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}.{}", parent, child)
    }
}

fn rename(ast: &mut Ast, from: &str, to: &str) -> TranspilerResult<()> {
    if to.contains('.') {
        let Some(node) = ast.remove(from) else {
            return Ok(());
        };
        return ast.insert(to, node);
    }

    let segments = split_path(from);
    let Some((last, parents)) = segments.split_last() else {
        return Err(TranspilerError::InvalidPath(from.to_string()));
    };
    let parent = if parents.is_empty() {
        Some(ast.root_mut())
    } else {
        ast.lookup_mut(&parents.join(".")).and_then(Node::as_dict_mut)
    };
    if let Some(dict) = parent {
        dict.rename(last, to);
    }
    Ok(())
}

fn copy_to_list(ast: &mut Ast, item: &str, to: &str, on_conflict: OnConflict) -> TranspilerResult<()> {
    let Some(source) = ast.lookup(item).cloned() else {
        return Ok(());
    };
    let key = last_segment(item);
    let Some(Node::List(targets)) = ast.lookup_mut(to) else {
        return Ok(());
    };
    for target in targets.iter_mut() {
        let Node::Dict(target) = target else {
            continue;
        };
        if !target.contains_key(key) {
            target.insert(key, source.clone());
            continue;
        }
        match (target.get_mut(key), &source) {
            (Some(Node::List(existing)), Node::List(incoming)) => {
                merge_lists(existing, incoming, on_conflict);
            }
            (Some(Node::Dict(existing)), Node::Dict(incoming)) => {
                merge_dicts(existing, incoming, on_conflict);
            }
            _ => {}
        }
    }
    Ok(())
}

fn merge_lists(existing: &mut Vec<Node>, incoming: &[Node], on_conflict: OnConflict) {
    match on_conflict {
        OnConflict::InsertAfter => existing.extend(incoming.iter().cloned()),
        OnConflict::InsertBefore => {
            let mut merged = incoming.to_vec();
            merged.append(existing);
            *existing = merged;
        }
        OnConflict::Noop => {}
    }
}

/// Existing keys always win; new keys go before or after them.
fn merge_dicts(existing: &mut Dict, incoming: &Dict, on_conflict: OnConflict) {
    let missing: Vec<(String, Node)> = incoming
        .iter()
        .filter(|(k, _)| !existing.contains_key(k))
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    match on_conflict {
        OnConflict::InsertAfter => {
            for (k, v) in missing {
                existing.insert(k, v);
            }
        }
        OnConflict::InsertBefore => {
            let current = std::mem::take(existing);
            *existing = missing.into_iter().chain(current).collect();
        }
        OnConflict::Noop => {}
    }
}

fn inject_item(list: &mut Vec<Node>, item: Node, on_conflict: OnConflict) {
    match on_conflict {
        OnConflict::InsertBefore => list.insert(0, item),
        OnConflict::InsertAfter | OnConflict::Noop => list.push(item),
    }
}

fn retain_list_items<F>(ast: &mut Ast, selector: &str, mut keep: F) -> TranspilerResult<()>
where
    F: FnMut(&Node) -> TranspilerResult<bool>,
{
    let Some(node) = ast.lookup_mut(selector) else {
        return Ok(());
    };
    let Node::List(items) = node else {
        return Err(TranspilerError::InvalidType {
            path: selector.to_string(),
            expected: "list",
            found: node.kind(),
        });
    };
    let mut kept = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if keep(&item)? {
            kept.push(item);
        }
    }
    *items = kept;
    Ok(())
}

/// Call `f` for every stream of every input, with a snapshot of the input.
fn for_each_stream<F>(ast: &mut Ast, mut f: F) -> TranspilerResult<()>
where
    F: FnMut(&Node, &mut Node) -> TranspilerResult<()>,
{
    let Some(Node::List(inputs)) = ast.lookup_mut("inputs") else {
        return Ok(());
    };
    for input in inputs.iter_mut() {
        let snapshot = input.clone();
        let Some(Node::List(streams)) = input.as_dict_mut().and_then(|d| d.get_mut("streams"))
        else {
            continue;
        };
        for stream in streams.iter_mut() {
            f(&snapshot, stream)?;
        }
    }
    Ok(())
}

fn processors_list<'a>(dict: &'a mut Dict, rule: &'static str) -> TranspilerResult<&'a mut Vec<Node>> {
    if !dict.contains_key("processors") {
        dict.insert("processors", Node::List(Vec::new()));
    }
    match dict.get_mut("processors") {
        Some(Node::List(list)) => Ok(list),
        _ => Err(TranspilerError::Rule {
            rule,
            reason: "processors is not a list".to_string(),
        }),
    }
}

fn add_fields(target: &str, fields: Vec<(&str, Node)>) -> Node {
    let mut processor = Dict::new();
    processor.insert("target", Node::from(target));
    processor.insert(
        "fields",
        Node::Dict(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
    );
    let mut wrapper = Dict::new();
    wrapper.insert("add_fields", Node::Dict(processor));
    Node::Dict(wrapper)
}

/// Non-empty string (or scalar) at `path`.
fn non_empty(node: &Node, path: &str) -> Option<String> {
    node.lookup(path)
        .and_then(Node::scalar_string)
        .filter(|s| !s.is_empty())
}

fn namespace(input: &Node) -> String {
    non_empty(input, "data_stream.namespace").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

fn datastream_type(input: &Node, default: &str) -> String {
    non_empty(input, "data_stream.type").unwrap_or_else(|| default.to_string())
}

fn dataset(stream: &Node) -> String {
    non_empty(stream, "data_stream.dataset").unwrap_or_else(|| DEFAULT_DATASET.to_string())
}

/// Set `section.field` to `default` when it is missing or empty.
///
/// Leaves `section` alone when it exists but is not a dict.
fn default_field(dict: &mut Dict, section: &str, field: &str, default: &str) -> TranspilerResult<()> {
    match dict.get(section) {
        Some(Node::Dict(d)) => {
            let empty = d
                .get(field)
                .map(|v| v.scalar_string().is_some_and(|s| s.is_empty()))
                .unwrap_or(true);
            if !empty {
                return Ok(());
            }
        }
        Some(_) => return Ok(()),
        None => {}
    }
    dict.insert_path(&format!("{}.{}", section, field), Node::from(default))
}
