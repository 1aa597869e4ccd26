//! Durable agent state
//!
//! The state document holds the last policy change or unenroll action and
//! the control plane's ack token:
//!
//! ```yaml
//! action:
//!   action_id: "2"
//!   action_type: POLICY_CHANGE
//!   policy: {...}
//! ack_token: "token"
//! ```
//!
//! Mutations only mark the store dirty; [`StateStore::save`] is the single
//! write path. Callers share the store behind [`SharedStateStore`] and hold
//! its lock across mutate-and-save sequences.

use super::action::{Action, POLICY_CHANGE, UNENROLL};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Byte storage behind a store
pub trait Storage: Send + Sync {
    /// Contents, or `None` when nothing was stored yet.
    fn load(&self) -> Result<Option<Vec<u8>>>;

    fn save(&self, data: &[u8]) -> Result<()>;

    fn exists(&self) -> Result<bool>;

    fn remove(&self) -> Result<()>;
}

/// File backed storage with atomic replacement
pub struct DiskStore {
    path: PathBuf,
}

impl DiskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for DiskStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    fn save(&self, data: &[u8]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(data)?;
        file.as_file().sync_all()?;
        file.persist(&self.path)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.path.try_exists()?)
    }

    fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

/// In-memory view of the state document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentState {
    pub action: Option<Action>,
    pub ack_token: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    action: Option<StoredAction>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    ack_token: String,
}

/// Persisted action. Also the whole document of the legacy action store.
#[derive(Debug, Serialize, Deserialize)]
struct StoredAction {
    action_id: String,
    #[serde(default)]
    action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    policy: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_detected: Option<bool>,
}

impl StoredAction {
    fn from_action(action: &Action) -> Option<Self> {
        match action {
            Action::PolicyChange { id, policy } => Some(Self {
                action_id: id.clone(),
                action_type: POLICY_CHANGE.to_string(),
                policy: Some(policy.clone()),
                is_detected: None,
            }),
            Action::Unenroll { id, is_detected } => Some(Self {
                action_id: id.clone(),
                action_type: UNENROLL.to_string(),
                policy: None,
                is_detected: Some(*is_detected),
            }),
            _ => None,
        }
    }

    /// Decode by tag; documents written without one fall back to the
    /// fields that are present.
    fn into_action(self) -> Result<Action> {
        match (self.action_type.as_str(), self.policy, self.is_detected) {
            (POLICY_CHANGE, Some(policy), _) | ("", Some(policy), None) => {
                Ok(Action::PolicyChange {
                    id: self.action_id,
                    policy,
                })
            }
            (UNENROLL, _, is_detected) | ("", None, is_detected @ Some(_)) => {
                Ok(Action::Unenroll {
                    id: self.action_id,
                    is_detected: is_detected.unwrap_or(false),
                })
            }
            (POLICY_CHANGE, None, _) => {
                bail!("stored policy change {} has no policy", self.action_id)
            }
            (other, _, _) => bail!(
                "stored action {} has unsupported type '{}'",
                self.action_id,
                other
            ),
        }
    }
}

fn is_stored_kind(action: &Action) -> bool {
    matches!(action, Action::PolicyChange { .. } | Action::Unenroll { .. })
}

pub struct StateStore {
    storage: Box<dyn Storage>,
    state: AgentState,
    dirty: bool,
}

pub type SharedStateStore = Arc<tokio::sync::Mutex<StateStore>>;

impl StateStore {
    /// Load the state from `storage`; an absent or empty document is the
    /// empty state.
    pub fn new(storage: Box<dyn Storage>) -> Result<Self> {
        let state = match storage.load()? {
            Some(data) if !data.iter().all(u8::is_ascii_whitespace) => {
                let document: StateDocument =
                    serde_yaml::from_slice(&data).context("Failed to parse state document")?;
                AgentState {
                    action: document.action.map(StoredAction::into_action).transpose()?,
                    ack_token: document.ack_token,
                }
            }
            _ => AgentState::default(),
        };
        Ok(Self {
            storage,
            state,
            dirty: false,
        })
    }

    /// Open `storage`, first moving the action of a legacy action store
    /// into it when only the legacy store exists.
    ///
    /// Re-running after an interrupted migration is safe: once the new
    /// document exists the legacy file is only deleted.
    pub fn with_migration(legacy: Box<dyn Storage>, storage: Box<dyn Storage>) -> Result<Self> {
        if storage.exists()? {
            if legacy.exists()? {
                debug!("State store exists, removing leftover legacy action store");
                legacy.remove()?;
            }
            return Self::new(storage);
        }
        if !legacy.exists()? {
            return Self::new(storage);
        }

        let action = match legacy.load()? {
            Some(data) if !data.iter().all(u8::is_ascii_whitespace) => {
                let stored: StoredAction = serde_yaml::from_slice(&data)
                    .context("Failed to parse legacy action store")?;
                Some(stored.into_action()?)
            }
            _ => None,
        };

        let mut store = Self::new(storage)?;
        if let Some(action) = &action {
            store.add(action);
        }
        store.dirty = true;
        store.save().context("Failed to save migrated state")?;
        legacy.remove()?;
        info!(
            "Migrated legacy action store ({} action)",
            action.as_ref().map(Action::id).unwrap_or("no")
        );
        Ok(store)
    }

    /// Record `action` if it is a policy change or unenroll with a new id.
    pub fn add(&mut self, action: &Action) {
        if !is_stored_kind(action) {
            return;
        }
        if self
            .state
            .action
            .as_ref()
            .is_some_and(|current| current.id() == action.id())
        {
            return;
        }
        self.state.action = Some(action.clone());
        self.dirty = true;
    }

    pub fn set_ack_token(&mut self, token: &str) {
        if self.state.ack_token == token {
            return;
        }
        self.state.ack_token = token.to_string();
        self.dirty = true;
    }

    /// Write the state if it changed since the last save.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let document = StateDocument {
            action: self.state.action.as_ref().and_then(StoredAction::from_action),
            ack_token: self.state.ack_token.clone(),
        };
        let data = serde_yaml::to_string(&document).context("Failed to serialize state")?;
        self.storage.save(data.as_bytes())?;
        self.dirty = false;
        Ok(())
    }

    /// Zero or one stored action
    pub fn actions(&self) -> Vec<Action> {
        self.state.action.iter().cloned().collect()
    }

    pub fn ack_token(&self) -> &str {
        &self.state.ack_token
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Render a persisted state document for display.
pub fn describe(path: &Path) -> Result<String> {
    let store = StateStore::new(Box::new(DiskStore::new(path)))?;
    let document = StateDocument {
        action: store.state.action.as_ref().and_then(StoredAction::from_action),
        ack_token: store.state.ack_token.clone(),
    };
    Ok(serde_yaml::to_string(&document)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Storage that counts writes and can be switched to fail them
    #[derive(Clone, Default)]
    pub(crate) struct MemoryStorage {
        pub data: Arc<Mutex<Option<Vec<u8>>>>,
        pub writes: Arc<AtomicUsize>,
        pub fail: Arc<AtomicBool>,
    }

    impl Storage for MemoryStorage {
        fn load(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.data.lock().unwrap().clone())
        }

        fn save(&self, data: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            *self.data.lock().unwrap() = Some(data.to_vec());
            Ok(())
        }

        fn exists(&self) -> Result<bool> {
            Ok(self.data.lock().unwrap().is_some())
        }

        fn remove(&self) -> Result<()> {
            *self.data.lock().unwrap() = None;
            Ok(())
        }
    }

    fn policy_change(id: &str) -> Action {
        Action::PolicyChange {
            id: id.into(),
            policy: json!({"outputs": {"default": {"type": "elasticsearch"}}}),
        }
    }

    #[test]
    fn test_only_last_stored_kind_survives() {
        let storage = MemoryStorage::default();
        let mut store = StateStore::new(Box::new(storage.clone())).unwrap();

        store.add(&policy_change("1"));
        store.add(&Action::PolicyReassign { id: "2".into() });
        store.add(&Action::Unenroll {
            id: "3".into(),
            is_detected: false,
        });
        store.add(&Action::Upgrade {
            id: "4".into(),
            version: "8.0.0".into(),
            source_uri: None,
        });
        store.add(&policy_change("5"));

        let actions = store.actions();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id(), "5");
    }

    #[test]
    fn test_duplicate_add_does_not_write() {
        let storage = MemoryStorage::default();
        let mut store = StateStore::new(Box::new(storage.clone())).unwrap();

        store.add(&policy_change("1"));
        store.save().unwrap();
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);

        store.add(&policy_change("1"));
        assert!(!store.is_dirty());
        store.save().unwrap();
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ack_token_single_transition() {
        let storage = MemoryStorage::default();
        let mut store = StateStore::new(Box::new(storage.clone())).unwrap();

        store.set_ack_token("x");
        assert!(store.is_dirty());
        store.save().unwrap();
        store.set_ack_token("x");
        assert!(!store.is_dirty());
        store.save().unwrap();
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.yml");

        let mut store = StateStore::new(Box::new(DiskStore::new(&path))).unwrap();
        store.add(&Action::Unenroll {
            id: "u1".into(),
            is_detected: true,
        });
        store.set_ack_token("token-1");
        store.save().unwrap();

        let reloaded = StateStore::new(Box::new(DiskStore::new(&path))).unwrap();
        assert_eq!(reloaded.state(), store.state());

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("action_type: UNENROLL"));
        assert!(written.contains("is_detected: true"));
        assert!(written.contains("ack_token: token-1"));
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let temp_dir = TempDir::new().unwrap();
        let store =
            StateStore::new(Box::new(DiskStore::new(temp_dir.path().join("none.yml")))).unwrap();
        assert!(store.actions().is_empty());
        assert_eq!(store.ack_token(), "");
    }

    #[test]
    fn test_untagged_documents_decode_by_presence() {
        let storage = MemoryStorage::default();
        storage
            .save(b"action:\n  action_id: u\n  is_detected: false\n")
            .unwrap();
        let store = StateStore::new(Box::new(storage)).unwrap();
        assert_eq!(
            store.actions(),
            vec![Action::Unenroll {
                id: "u".into(),
                is_detected: false
            }]
        );

        let storage = MemoryStorage::default();
        storage.save(b"action:\n  action_id: p\n").unwrap();
        assert!(StateStore::new(Box::new(storage)).is_err());
    }

    #[test]
    fn test_migration_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let legacy_path = temp_dir.path().join("action_store.yml");
        let state_path = temp_dir.path().join("state.yml");
        std::fs::write(
            &legacy_path,
            "action_id: abc\naction_type: POLICY_CHANGE\npolicy:\n  hello: world\n",
        )
        .unwrap();

        let store = StateStore::with_migration(
            Box::new(DiskStore::new(&legacy_path)),
            Box::new(DiskStore::new(&state_path)),
        )
        .unwrap();
        assert_eq!(store.actions()[0].id(), "abc");
        assert!(state_path.exists());
        assert!(!legacy_path.exists());

        // interrupted after save, before delete
        std::fs::write(&legacy_path, "action_id: old\npolicy: {}\n").unwrap();
        let store = StateStore::with_migration(
            Box::new(DiskStore::new(&legacy_path)),
            Box::new(DiskStore::new(&state_path)),
        )
        .unwrap();
        assert_eq!(store.actions()[0].id(), "abc");
        assert!(!legacy_path.exists());
    }
}
