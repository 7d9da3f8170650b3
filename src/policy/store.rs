//! File-backed policy administration point.
//!
//! One JSON document per store, write-through on every mutation. Readers
//! work against immutable copy-on-write snapshots; every published snapshot
//! carries a monotonically increasing version that also keys the decision
//! cache.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::models::{DeclarativePolicy, PolicyBody, PolicyMetadata, PolicyRecord, PolicyStatus, Rule};

/// Version rows retained per policy
pub const POLICY_HISTORY_CAPACITY: usize = 50;

/// The persisted document shape
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyFile {
    pub policies: Vec<PolicyRecord>,
}

/// One row of a policy's version history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyVersionRow {
    pub version: String,
    pub modified_at: DateTime<Utc>,
    pub modified_by: String,
}

/// Immutable view of the active policy set, shared with the PDP and router
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    /// Monotonically increasing publication counter
    pub version: u64,
    /// Active policies, sorted by descending priority
    pub policies: Arc<[PolicyRecord]>,
}

struct StoreInner {
    records: Vec<PolicyRecord>,
    history: HashMap<String, VecDeque<PolicyVersionRow>>,
}

type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// File-backed policy store
pub struct PolicyStore {
    path: PathBuf,
    history_dir: PathBuf,
    inner: RwLock<StoreInner>,
    snapshot: RwLock<Arc<PolicySnapshot>>,
    version_counter: AtomicU64,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl PolicyStore {
    /// Open the store, creating a minimal default policy if the file is
    /// missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let history_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("policy_history");

        let store = Self {
            path,
            history_dir,
            inner: RwLock::new(StoreInner {
                records: Vec::new(),
                history: HashMap::new(),
            }),
            snapshot: RwLock::new(Arc::new(PolicySnapshot {
                version: 0,
                policies: Vec::new().into(),
            })),
            version_counter: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        };
        store.load()?;
        Ok(store)
    }

    /// Register a callback fired after every snapshot publication (policy
    /// change or reload). The PDP hooks its cache invalidation here.
    pub fn on_change(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    /// Load (or re-load) the document from disk, publishing a fresh snapshot.
    pub fn load(&self) -> Result<()> {
        let file = if self.path.exists() {
            let raw = std::fs::read_to_string(&self.path)?;
            serde_json::from_str::<PolicyFile>(&raw)
                .map_err(|e| AppError::Configuration(format!(
                    "policy file {} is not valid: {}",
                    self.path.display(),
                    e
                )))?
        } else {
            tracing::info!(path = %self.path.display(), "Policy file missing, writing default policy");
            let file = PolicyFile {
                policies: vec![default_policy()],
            };
            self.persist_file(&file)?;
            file
        };

        {
            let mut inner = self.inner.write();
            inner.records = file.policies;
            inner.history = self.load_history(&inner.records);
        }
        self.publish();
        Ok(())
    }

    /// Alias for `load`; in-flight requests keep their current snapshot.
    pub fn reload(&self) -> Result<()> {
        self.load()
    }

    /// Current immutable snapshot of the active set
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.read().clone()
    }

    /// Active policies, sorted by descending priority
    pub fn list_active(&self) -> Vec<PolicyRecord> {
        self.snapshot().policies.to_vec()
    }

    /// All policies regardless of status
    pub fn list_all(&self) -> Vec<PolicyRecord> {
        self.inner.read().records.clone()
    }

    pub fn get(&self, id: &str) -> Option<PolicyRecord> {
        self.inner.read().records.iter().find(|p| p.id == id).cloned()
    }

    /// Version history rows for a policy, newest last
    pub fn history(&self, id: &str) -> Vec<PolicyVersionRow> {
        self.inner
            .read()
            .history
            .get(id)
            .map(|rows| rows.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn create(&self, record: PolicyRecord) -> Result<PolicyRecord> {
        record.validate()?;
        {
            let mut inner = self.inner.write();
            if inner.records.iter().any(|p| p.id == record.id) {
                return Err(AppError::Validation(format!(
                    "policy '{}' already exists",
                    record.id
                )));
            }
            inner.records.push(record.clone());
            Self::append_history(
                &mut inner,
                &record.id,
                PolicyVersionRow {
                    version: record.version.clone(),
                    modified_at: record.metadata.created_at,
                    modified_by: record.metadata.created_by.clone(),
                },
            );
        }
        self.persist()?;
        self.publish();
        tracing::info!(policy_id = %record.id, "Policy created");
        Ok(record)
    }

    /// Update a policy in place, bumping the patch version and appending a
    /// version row (ring-buffer capped).
    pub fn update(
        &self,
        id: &str,
        mut updated: PolicyRecord,
        modified_by: &str,
    ) -> Result<PolicyRecord> {
        updated.validate()?;
        let record = {
            let mut inner = self.inner.write();
            let Some(existing) = inner.records.iter_mut().find(|p| p.id == id) else {
                return Err(AppError::NotFound(format!("policy '{}' not found", id)));
            };

            updated.id = existing.id.clone();
            updated.version = bump_patch(&existing.version);
            updated.metadata.created_at = existing.metadata.created_at;
            updated.metadata.created_by = existing.metadata.created_by.clone();
            updated.metadata.last_modified = Some(Utc::now());
            updated.metadata.last_modified_by = Some(modified_by.to_string());
            *existing = updated.clone();

            Self::append_history(
                &mut inner,
                id,
                PolicyVersionRow {
                    version: updated.version.clone(),
                    modified_at: Utc::now(),
                    modified_by: modified_by.to_string(),
                },
            );
            updated
        };
        self.persist()?;
        self.publish();
        tracing::info!(policy_id = %id, version = %record.version, "Policy updated");
        Ok(record)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let before = inner.records.len();
            inner.records.retain(|p| p.id != id);
            if inner.records.len() == before {
                return Err(AppError::NotFound(format!("policy '{}' not found", id)));
            }
            inner.history.remove(id);
        }
        let _ = std::fs::remove_file(self.history_path(id));
        self.persist()?;
        self.publish();
        tracing::info!(policy_id = %id, "Policy deleted");
        Ok(())
    }

    /// Export the full document
    pub fn export(&self) -> PolicyFile {
        PolicyFile {
            policies: self.inner.read().records.clone(),
        }
    }

    /// Replace the store contents with an imported document
    pub fn import(&self, file: PolicyFile) -> Result<usize> {
        for record in &file.policies {
            record.validate()?;
        }
        let count = file.policies.len();
        {
            let mut inner = self.inner.write();
            inner.records = file.policies;
            inner.history.clear();
        }
        self.persist()?;
        self.publish();
        tracing::info!(policies = count, "Policy set imported");
        Ok(count)
    }

    fn append_history(inner: &mut StoreInner, id: &str, row: PolicyVersionRow) {
        let rows = inner.history.entry(id.to_string()).or_default();
        if rows.len() >= POLICY_HISTORY_CAPACITY {
            rows.pop_front();
        }
        rows.push_back(row);
    }

    /// Rebuild and publish the active snapshot, then notify listeners.
    fn publish(&self) {
        let mut active: Vec<PolicyRecord> = self
            .inner
            .read()
            .records
            .iter()
            .filter(|p| p.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| b.priority().cmp(&a.priority()));

        let version = self.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        *self.snapshot.write() = Arc::new(PolicySnapshot {
            version,
            policies: active.into(),
        });

        for listener in self.listeners.read().iter() {
            listener();
        }
    }

    /// Write-through persistence: the document plus per-policy history files.
    fn persist(&self) -> Result<()> {
        let (file, history) = {
            let inner = self.inner.read();
            (
                PolicyFile {
                    policies: inner.records.clone(),
                },
                inner.history.clone(),
            )
        };
        self.persist_file(&file)?;

        std::fs::create_dir_all(&self.history_dir)?;
        for (id, rows) in history {
            let rows: Vec<PolicyVersionRow> = rows.into_iter().collect();
            std::fs::write(self.history_path(&id), serde_json::to_string_pretty(&rows)?)?;
        }
        Ok(())
    }

    fn persist_file(&self, file: &PolicyFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(file)?)?;
        Ok(())
    }

    fn history_path(&self, id: &str) -> PathBuf {
        self.history_dir.join(format!("{}.json", id))
    }

    fn load_history(&self, records: &[PolicyRecord]) -> HashMap<String, VecDeque<PolicyVersionRow>> {
        let mut history = HashMap::new();
        for record in records {
            let path = self.history_path(&record.id);
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(rows) = serde_json::from_str::<Vec<PolicyVersionRow>>(&raw) {
                    history.insert(record.id.clone(), rows.into_iter().collect());
                }
            }
        }
        history
    }
}

/// Bump the patch component of a `major.minor.patch` version string
fn bump_patch(version: &str) -> String {
    let mut parts: Vec<u64> = version.split('.').filter_map(|p| p.parse().ok()).collect();
    while parts.len() < 3 {
        parts.push(0);
    }
    parts[2] += 1;
    format!("{}.{}.{}", parts[0], parts[1], parts[2])
}

/// Minimal policy written when the store file is missing
fn default_policy() -> PolicyRecord {
    PolicyRecord {
        id: "default-policy".to_string(),
        name: "Default baseline".to_string(),
        version: "1.0.0".to_string(),
        status: PolicyStatus::Active,
        description: Some("Permits health checks; everything else requires explicit policy".to_string()),
        policy: PolicyBody::Declarative(DeclarativePolicy {
            uid: "default-policy".to_string(),
            priority: 0,
            permission: vec![Rule {
                action: "health:check".to_string(),
                ..Default::default()
            }],
            prohibition: vec![],
            duty: vec![],
        }),
        metadata: PolicyMetadata {
            priority: 0,
            tags: vec!["default".to_string()],
            created_at: Utc::now(),
            created_by: "system".to_string(),
            last_modified: None,
            last_modified_by: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, priority: i64, status: PolicyStatus) -> PolicyRecord {
        PolicyRecord {
            id: id.to_string(),
            name: format!("policy {}", id),
            version: "1.0.0".to_string(),
            status,
            description: None,
            policy: PolicyBody::Declarative(DeclarativePolicy {
                uid: id.to_string(),
                priority,
                permission: vec![Rule {
                    action: "tool:call".to_string(),
                    ..Default::default()
                }],
                prohibition: vec![],
                duty: vec![],
            }),
            metadata: PolicyMetadata {
                priority,
                tags: vec![],
                created_at: Utc::now(),
                created_by: "test".to_string(),
                last_modified: None,
                last_modified_by: None,
            },
        }
    }

    fn open_store(dir: &TempDir) -> PolicyStore {
        PolicyStore::open(dir.path().join("policies.json")).unwrap()
    }

    #[test]
    fn test_missing_file_creates_default_policy() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(dir.path().join("policies.json").exists());
        assert!(store.get("default-policy").is_some());
        assert_eq!(store.list_active().len(), 1);
    }

    #[test]
    fn test_list_active_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create(record("low", 1, PolicyStatus::Active)).unwrap();
        store.create(record("high", 99, PolicyStatus::Active)).unwrap();
        store.create(record("draft", 50, PolicyStatus::Draft)).unwrap();
        store.create(record("off", 80, PolicyStatus::Inactive)).unwrap();

        let active = store.list_active();
        let ids: Vec<&str> = active.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low", "default-policy"]);
    }

    #[test]
    fn test_update_bumps_patch_and_appends_history() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create(record("p", 1, PolicyStatus::Active)).unwrap();

        let updated = store.update("p", record("p", 2, PolicyStatus::Active), "alice").unwrap();
        assert_eq!(updated.version, "1.0.1");
        assert_eq!(updated.metadata.last_modified_by.as_deref(), Some("alice"));

        let history = store.history("p");
        assert_eq!(history.len(), 2);
        assert_eq!(history.last().unwrap().version, "1.0.1");
    }

    #[test]
    fn test_history_ring_caps_at_fifty() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create(record("p", 1, PolicyStatus::Active)).unwrap();
        for _ in 0..60 {
            store
                .update("p", record("p", 1, PolicyStatus::Active), "bot")
                .unwrap();
        }
        assert_eq!(store.history("p").len(), POLICY_HISTORY_CAPACITY);
    }

    #[test]
    fn test_snapshot_version_increases_and_listeners_fire() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let observed = fired.clone();
        store.on_change(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        let v1 = store.snapshot().version;
        store.create(record("p", 1, PolicyStatus::Active)).unwrap();
        let v2 = store.snapshot().version;
        assert!(v2 > v1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_through_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policies.json");
        {
            let store = PolicyStore::open(&path).unwrap();
            store.create(record("persisted", 7, PolicyStatus::Active)).unwrap();
        }
        let reopened = PolicyStore::open(&path).unwrap();
        assert!(reopened.get("persisted").is_some());
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.create(record("a", 5, PolicyStatus::Active)).unwrap();
        store.create(record("b", 3, PolicyStatus::Active)).unwrap();
        let exported = store.export();

        let other_dir = TempDir::new().unwrap();
        let fresh = open_store(&other_dir);
        fresh.import(exported).unwrap();

        let original: Vec<String> = store.list_active().iter().map(|p| p.id.clone()).collect();
        let imported: Vec<String> = fresh.list_active().iter().map(|p| p.id.clone()).collect();
        assert_eq!(original, imported);
    }

    #[test]
    fn test_delete_unknown_policy_errors() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(matches!(store.delete("ghost"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_bump_patch() {
        assert_eq!(bump_patch("1.0.0"), "1.0.1");
        assert_eq!(bump_patch("2.3"), "2.3.1");
        assert_eq!(bump_patch("9"), "9.0.1");
    }
}
