//! Order-preserving configuration tree.
//!
//! Every policy document is loaded into an [`Ast`] before anything else
//! touches it. Dicts keep their keys in insertion order so that serialized
//! output and content hashes are deterministic across emissions. The tree is
//! value-typed: transformations work on clones and never share nodes.

use super::{TranspilerError, TranspilerResult};
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use sha2::{Digest, Sha256};

/// Separator between path segments.
pub const PATH_SEPARATOR: char = '.';

/// Processor fragments spliced into rendered inputs by variable substitution.
pub type Processors = Vec<Node>;

/// A single value in the configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Dict(Dict),
    List(Vec<Node>),
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

/// Ordered mapping of unique string keys to nodes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dict {
    entries: Vec<(String, Node)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Node)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Insert or replace a key. A replaced key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, node: Node) -> Option<Node> {
        let key = key.into();
        match self.get_mut(&key) {
            Some(existing) => Some(std::mem::replace(existing, node)),
            None => {
                self.entries.push((key, node));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Node> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Rename `from` to `to` in place. An existing `to` key is replaced.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        if from == to {
            return self.contains_key(from);
        }
        if !self.contains_key(from) {
            return false;
        }
        if let Some(other) = self.entries.iter().position(|(k, _)| k == to) {
            self.entries.remove(other);
        }
        match self.entries.iter_mut().find(|(k, _)| k == from) {
            Some(entry) => {
                entry.0 = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Resolve a dotted path below this dict.
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        let segments = split_path(path);
        let (first, rest) = segments.split_first()?;
        rest.iter()
            .try_fold(self.get(first)?, |current, segment| current.find(segment))
    }

    pub fn lookup_mut(&mut self, path: &str) -> Option<&mut Node> {
        let segments = split_path(path);
        let (first, rest) = segments.split_first()?;
        let mut current = self.get_mut(first)?;
        for segment in rest {
            current = current.find_mut(segment)?;
        }
        Some(current)
    }

    /// Place `node` at a dotted path, creating intermediate dicts as needed.
    ///
    /// Fails when an intermediate segment holds something other than a dict.
    pub fn insert_path(&mut self, path: &str, node: Node) -> TranspilerResult<()> {
        let segments = split_path(path);
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| TranspilerError::InvalidPath(path.to_string()))?;
        let mut current = self;
        for segment in parents {
            current = current.child_dict_mut(segment, path)?;
        }
        current.insert(*last, node);
        Ok(())
    }

    /// Get the dict stored under `key`, creating an empty one when absent.
    fn child_dict_mut(&mut self, key: &str, path: &str) -> TranspilerResult<&mut Dict> {
        if !self.contains_key(key) {
            self.entries.push((key.to_string(), Node::Dict(Dict::new())));
        }
        match self.get_mut(key) {
            Some(Node::Dict(d)) => Ok(d),
            Some(other) => Err(TranspilerError::NotAContainer {
                path: path.to_string(),
                segment: key.to_string(),
                found: other.kind(),
            }),
            None => Err(TranspilerError::InvalidPath(path.to_string())),
        }
    }
}

impl FromIterator<(String, Node)> for Dict {
    fn from_iter<I: IntoIterator<Item = (String, Node)>>(iter: I) -> Self {
        let mut dict = Dict::new();
        for (k, v) in iter {
            dict.insert(k, v);
        }
        dict
    }
}

impl IntoIterator for Dict {
    type Item = (String, Node);
    type IntoIter = std::vec::IntoIter<(String, Node)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::Str(value.to_string())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::Str(value)
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Bool(value)
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Int(value)
    }
}

impl From<Dict> for Node {
    fn from(value: Dict) -> Self {
        Node::Dict(value)
    }
}

impl From<Vec<Node>> for Node {
    fn from(value: Vec<Node>) -> Self {
        Node::List(value)
    }
}

impl Node {
    /// Short name of the node type, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Dict(_) => "dict",
            Node::List(_) => "list",
            Node::Str(_) => "string",
            Node::Int(_) => "int",
            Node::UInt(_) => "uint",
            Node::Float(_) => "float",
            Node::Bool(_) => "bool",
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Node::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dict_mut(&mut self) -> Option<&mut Dict> {
        match self {
            Node::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Node>> {
        match self {
            Node::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Node>> {
        match self {
            Node::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Node::Bool(b) => Some(*b),
            Node::Str(s) if s == "true" => Some(true),
            Node::Str(s) if s == "false" => Some(false),
            _ => None,
        }
    }

    /// Scalar rendered as a string; collections return `None`.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Node::Str(s) => Some(s.clone()),
            Node::Int(i) => Some(i.to_string()),
            Node::UInt(u) => Some(u.to_string()),
            Node::Float(f) => Some(f.to_string()),
            Node::Bool(b) => Some(b.to_string()),
            Node::Dict(_) | Node::List(_) => None,
        }
    }

    /// Find a direct child: a dict key, or a list index.
    pub fn find(&self, segment: &str) -> Option<&Node> {
        match self {
            Node::Dict(d) => d.get(segment),
            Node::List(l) => segment.parse::<usize>().ok().and_then(|i| l.get(i)),
            _ => None,
        }
    }

    fn find_mut(&mut self, segment: &str) -> Option<&mut Node> {
        match self {
            Node::Dict(d) => d.get_mut(segment),
            Node::List(l) => segment
                .parse::<usize>()
                .ok()
                .and_then(move |i| l.get_mut(i)),
            _ => None,
        }
    }

    /// Resolve a dotted path below this node.
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        split_path(path)
            .iter()
            .try_fold(self, |current, segment| current.find(segment))
    }

    pub fn lookup_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut current = self;
        for segment in split_path(path) {
            current = current.find_mut(segment)?;
        }
        Some(current)
    }

    /// Load a YAML value. `null` loads as `None`.
    pub fn from_yaml(value: &YamlValue) -> TranspilerResult<Option<Node>> {
        let node = match value {
            YamlValue::Null => return Ok(None),
            YamlValue::Bool(b) => Node::Bool(*b),
            YamlValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Node::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Node::UInt(u)
                } else {
                    Node::Float(n.as_f64().unwrap_or_default())
                }
            }
            YamlValue::String(s) => Node::Str(s.clone()),
            YamlValue::Sequence(seq) => {
                let mut items = Vec::with_capacity(seq.len());
                for item in seq {
                    if let Some(node) = Node::from_yaml(item)? {
                        items.push(node);
                    }
                }
                Node::List(items)
            }
            YamlValue::Mapping(map) => {
                let mut dict = Dict::new();
                for (key, value) in map {
                    let key = yaml_key(key)?;
                    if let Some(node) = Node::from_yaml(value)? {
                        insert_dotted(&mut dict, &key, node)?;
                    }
                }
                Node::Dict(dict)
            }
            YamlValue::Tagged(tagged) => return Node::from_yaml(&tagged.value),
        };
        Ok(Some(node))
    }

    /// Load a JSON value. `null` loads as `None`.
    pub fn from_json(value: &JsonValue) -> TranspilerResult<Option<Node>> {
        let node = match value {
            JsonValue::Null => return Ok(None),
            JsonValue::Bool(b) => Node::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Node::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Node::UInt(u)
                } else {
                    Node::Float(n.as_f64().unwrap_or_default())
                }
            }
            JsonValue::String(s) => Node::Str(s.clone()),
            JsonValue::Array(items) => {
                let mut nodes = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(node) = Node::from_json(item)? {
                        nodes.push(node);
                    }
                }
                Node::List(nodes)
            }
            JsonValue::Object(map) => {
                let mut dict = Dict::new();
                for (key, value) in map {
                    if let Some(node) = Node::from_json(value)? {
                        insert_dotted(&mut dict, key, node)?;
                    }
                }
                Node::Dict(dict)
            }
        };
        Ok(Some(node))
    }

    pub fn to_yaml(&self) -> YamlValue {
        match self {
            Node::Dict(d) => {
                let mut map = serde_yaml::Mapping::new();
                for (k, v) in d.iter() {
                    map.insert(YamlValue::String(k.to_string()), v.to_yaml());
                }
                YamlValue::Mapping(map)
            }
            Node::List(l) => YamlValue::Sequence(l.iter().map(Node::to_yaml).collect()),
            Node::Str(s) => YamlValue::String(s.clone()),
            Node::Int(i) => YamlValue::Number((*i).into()),
            Node::UInt(u) => YamlValue::Number((*u).into()),
            Node::Float(f) => YamlValue::Number((*f).into()),
            Node::Bool(b) => YamlValue::Bool(*b),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Node::Dict(d) => JsonValue::Object(
                d.iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
            Node::List(l) => JsonValue::Array(l.iter().map(Node::to_json).collect()),
            Node::Str(s) => JsonValue::String(s.clone()),
            Node::Int(i) => JsonValue::from(*i),
            Node::UInt(u) => JsonValue::from(*u),
            Node::Float(f) => JsonValue::from(*f),
            Node::Bool(b) => JsonValue::Bool(*b),
        }
    }

    /// Hex SHA-256 of the node's canonical encoding.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        self.feed(&mut hasher);
        format!("{:x}", hasher.finalize())
    }

    fn feed(&self, hasher: &mut Sha256) {
        fn bytes(hasher: &mut Sha256, tag: u8, data: &[u8]) {
            hasher.update([tag]);
            hasher.update((data.len() as u64).to_le_bytes());
            hasher.update(data);
        }

        match self {
            Node::Dict(d) => {
                hasher.update([b'd']);
                hasher.update((d.len() as u64).to_le_bytes());
                for (k, v) in d.iter() {
                    bytes(hasher, b'k', k.as_bytes());
                    v.feed(hasher);
                }
            }
            Node::List(l) => {
                hasher.update([b'l']);
                hasher.update((l.len() as u64).to_le_bytes());
                for item in l {
                    item.feed(hasher);
                }
            }
            Node::Str(s) => bytes(hasher, b's', s.as_bytes()),
            Node::Int(i) => bytes(hasher, b'i', &i.to_le_bytes()),
            Node::UInt(u) => bytes(hasher, b'u', &u.to_le_bytes()),
            Node::Float(f) => bytes(hasher, b'f', &f.to_bits().to_le_bytes()),
            Node::Bool(b) => bytes(hasher, b'b', &[*b as u8]),
        }
    }
}

/// Root of a configuration tree. The root is always a dict.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ast {
    root: Dict,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dict(root: Dict) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Dict {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Dict {
        &mut self.root
    }

    pub fn into_root(self) -> Dict {
        self.root
    }

    pub fn from_yaml_value(value: &YamlValue) -> TranspilerResult<Self> {
        match Node::from_yaml(value)? {
            Some(Node::Dict(root)) => Ok(Self { root }),
            None => Ok(Self::new()),
            Some(other) => Err(TranspilerError::InvalidRoot {
                found: other.kind(),
            }),
        }
    }

    pub fn from_yaml_str(raw: &str) -> TranspilerResult<Self> {
        let value: YamlValue = serde_yaml::from_str(raw)?;
        Self::from_yaml_value(&value)
    }

    pub fn from_json_value(value: &JsonValue) -> TranspilerResult<Self> {
        match Node::from_json(value)? {
            Some(Node::Dict(root)) => Ok(Self { root }),
            None => Ok(Self::new()),
            Some(other) => Err(TranspilerError::InvalidRoot {
                found: other.kind(),
            }),
        }
    }

    pub fn to_yaml_value(&self) -> YamlValue {
        let mut map = serde_yaml::Mapping::new();
        for (k, v) in self.root.iter() {
            map.insert(YamlValue::String(k.to_string()), v.to_yaml());
        }
        YamlValue::Mapping(map)
    }

    pub fn to_json_value(&self) -> JsonValue {
        JsonValue::Object(
            self.root
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_json()))
                .collect(),
        )
    }

    pub fn to_yaml_string(&self) -> TranspilerResult<String> {
        Ok(serde_yaml::to_string(&self.to_yaml_value())?)
    }

    /// Resolve a dotted path. Numeric segments index into lists.
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        self.root.lookup(path)
    }

    pub fn lookup_mut(&mut self, path: &str) -> Option<&mut Node> {
        self.root.lookup_mut(path)
    }

    pub fn lookup_str(&self, path: &str) -> Option<&str> {
        self.lookup(path).and_then(Node::as_str)
    }

    pub fn lookup_bool(&self, path: &str) -> Option<bool> {
        self.lookup(path).and_then(Node::as_bool)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Place `node` at `path`, creating intermediate dicts as needed.
    ///
    /// Fails when an intermediate segment holds something other than a dict.
    pub fn insert(&mut self, path: &str, node: Node) -> TranspilerResult<()> {
        self.root.insert_path(path, node)
    }

    /// Remove the node at `path`, returning it when it existed.
    pub fn remove(&mut self, path: &str) -> Option<Node> {
        let segments = split_path(path);
        let (last, parents) = segments.split_last()?;
        if parents.is_empty() {
            return self.root.remove(last);
        }
        match self.lookup_mut(&parents.join("."))? {
            Node::Dict(d) => d.remove(last),
            Node::List(l) => {
                let idx = last.parse::<usize>().ok().filter(|i| *i < l.len())?;
                Some(l.remove(idx))
            }
            _ => None,
        }
    }

    /// A new tree holding only the branch at `path`, nested under its full path.
    pub fn select(&self, path: &str) -> Option<Ast> {
        let node = self.lookup(path)?.clone();
        let mut selected = Ast::new();
        selected.insert(path, node).ok()?;
        Some(selected)
    }

    /// Hex SHA-256 of the whole tree.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update([b'd']);
        hasher.update((self.root.len() as u64).to_le_bytes());
        for (k, v) in self.root.iter() {
            hasher.update([b'k']);
            hasher.update((k.len() as u64).to_le_bytes());
            hasher.update(k.as_bytes());
            v.feed(&mut hasher);
        }
        format!("{:x}", hasher.finalize())
    }
}

impl From<Ast> for Node {
    fn from(value: Ast) -> Self {
        Node::Dict(value.root)
    }
}

/// Split a dotted path into its segments. An empty path has no segments.
pub fn split_path(path: &str) -> Vec<&str> {
    if path.is_empty() {
        return Vec::new();
    }
    path.split(PATH_SEPARATOR).collect()
}

fn yaml_key(key: &YamlValue) -> TranspilerResult<String> {
    match key {
        YamlValue::String(s) => Ok(s.clone()),
        YamlValue::Bool(b) => Ok(b.to_string()),
        YamlValue::Number(n) => Ok(n.to_string()),
        other => Err(TranspilerError::InvalidType {
            path: format!("{:?}", other),
            expected: "scalar key",
            found: "collection",
        }),
    }
}

/// Insert a possibly dotted key into `dict`, merging into existing dicts.
fn insert_dotted(dict: &mut Dict, key: &str, node: Node) -> TranspilerResult<()> {
    let segments: Vec<&str> = key.split(PATH_SEPARATOR).collect();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Err(TranspilerError::InvalidPath(key.to_string())),
    };
    if segments.iter().any(|s| s.is_empty()) {
        return Err(TranspilerError::InvalidPath(key.to_string()));
    }

    let mut current = dict;
    for segment in parents {
        current = current.child_dict_mut(segment, key)?;
    }
    if let Node::Dict(incoming) = node {
        if let Some(Node::Dict(existing)) = current.get_mut(last) {
            for (k, v) in incoming {
                insert_dotted(existing, &k, v)?;
            }
            return Ok(());
        }
        current.insert(*last, Node::Dict(incoming));
    } else {
        current.insert(*last, node);
    }
    Ok(())
}
