//! Local policy files
//!
//! In standalone mode the policy is read from files under the config
//! directory that match the configured patterns. Files are merged in pattern
//! order, then path order: mappings merge recursively, lists concatenate and
//! scalars from later files win.

use crate::config::{merge_values, ListMerge};
use anyhow::{bail, Context, Result};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;
use wildmatch::WildMatch;

/// Merged policy and the files it came from
#[derive(Debug, Clone)]
pub struct LocalPolicy {
    pub policy: Value,
    pub files: Vec<PathBuf>,
}

/// File pattern: `*` and `?` match within one path segment.
struct FilePattern {
    segments: Vec<WildMatch>,
}

impl FilePattern {
    fn new(pattern: &str) -> Self {
        Self {
            segments: pattern
                .trim_start_matches("./")
                .split('/')
                .map(WildMatch::new)
                .collect(),
        }
    }

    /// `name` is `/` separated and relative to the policy root.
    fn matches(&self, name: &str) -> bool {
        let parts: Vec<&str> = name.split('/').collect();
        parts.len() == self.segments.len()
            && self
                .segments
                .iter()
                .zip(&parts)
                .all(|(segment, part)| segment.matches(part))
    }
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Files under `root` matching `patterns`, in pattern then path order.
pub fn discover(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let patterns: Vec<FilePattern> = patterns.iter().map(|p| FilePattern::new(p)).collect();
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut candidates: Vec<(String, PathBuf)> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable policy entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            relative_name(root, entry.path()).map(|name| (name, entry.into_path()))
        })
        .collect();
    candidates.sort();

    let mut files: Vec<PathBuf> = Vec::new();
    for pattern in &patterns {
        for (name, path) in &candidates {
            if pattern.matches(name) && !files.contains(path) {
                files.push(path.clone());
            }
        }
    }
    Ok(files)
}

/// Read and merge every policy file under `root` matching `patterns`.
pub fn load(root: &Path, patterns: &[String]) -> Result<LocalPolicy> {
    let files = discover(root, patterns)?;
    let mut merged = Mapping::new();
    for file in &files {
        let contents = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let document: Value = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", file.display()))?;
        match document {
            Value::Null => continue,
            Value::Mapping(mapping) => merge_values(&mut merged, mapping, ListMerge::Concat),
            other => bail!(
                "{} must contain a mapping, found {}",
                file.display(),
                kind(&other)
            ),
        }
        debug!("Merged policy file {}", file.display());
    }
    Ok(LocalPolicy {
        policy: Value::Mapping(merged),
        files,
    })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

/// Watch `root` recursively; a unit is sent after every change.
///
/// Bursts of events collapse into one pending notification. The watcher
/// stops when the returned value is dropped.
pub fn watch(root: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!("Policy watcher error: {}", e),
        },
        Config::default(),
    )?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;
    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn default_patterns() -> Vec<String> {
        vec!["fleet-agent.yml".to_string(), "inputs.d/*.yml".to_string()]
    }

    #[test]
    fn test_file_pattern() {
        let pattern = FilePattern::new("inputs.d/*.yml");
        assert!(pattern.matches("inputs.d/a.yml"));
        assert!(!pattern.matches("inputs.d/nested/a.yml"));
        assert!(!pattern.matches("inputs_d/a.yml"));
        assert!(!pattern.matches("inputs.d/a.yml.bak"));
        assert!(FilePattern::new("./fleet-agent.yml").matches("fleet-agent.yml"));
        assert!(FilePattern::new("agent?.yml").matches("agent1.yml"));
        assert!(!FilePattern::new("*.yml").matches("inputs.d/a.yml"));
    }

    #[test]
    fn test_discover_orders_by_pattern_then_path() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("inputs.d")).unwrap();
        fs::write(root.join("inputs.d/b.yml"), "").unwrap();
        fs::write(root.join("inputs.d/a.yml"), "").unwrap();
        fs::write(root.join("inputs.d/notes.txt"), "").unwrap();
        fs::write(root.join("fleet-agent.yml"), "").unwrap();
        fs::write(root.join("agent.yml"), "").unwrap();

        let files = discover(root, &default_patterns()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| relative_name(root, p).unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["fleet-agent.yml", "inputs.d/a.yml", "inputs.d/b.yml"]
        );
    }

    #[test]
    fn test_load_merges_files() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("inputs.d")).unwrap();
        fs::write(
            root.join("fleet-agent.yml"),
            r#"
outputs:
  default:
    type: elasticsearch
    hosts: [a]
agent.monitoring.enabled: false
inputs:
  - type: log
"#,
        )
        .unwrap();
        fs::write(
            root.join("inputs.d/system.yml"),
            r#"
outputs:
  default:
    username: elastic
inputs:
  - type: system/metrics
"#,
        )
        .unwrap();
        fs::write(root.join("inputs.d/empty.yml"), "").unwrap();

        let loaded = load(root, &default_patterns()).unwrap();
        assert_eq!(loaded.files.len(), 3);
        let expected: Value = serde_yaml::from_str(
            r#"
outputs:
  default:
    type: elasticsearch
    hosts: [a]
    username: elastic
agent.monitoring.enabled: false
inputs:
  - type: log
  - type: system/metrics
"#,
        )
        .unwrap();
        assert_eq!(loaded.policy, expected);
    }

    #[test]
    fn test_non_mapping_file_rejected() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("fleet-agent.yml"), "- a\n- b\n").unwrap();
        assert!(load(temp_dir.path(), &default_patterns()).is_err());
    }

    #[test]
    fn test_missing_root_is_empty() {
        let temp_dir = tempdir().unwrap();
        let loaded = load(&temp_dir.path().join("missing"), &default_patterns()).unwrap();
        assert!(loaded.files.is_empty());
        assert_eq!(loaded.policy, Value::Mapping(Mapping::new()));
    }
}
