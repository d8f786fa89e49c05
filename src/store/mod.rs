//! JSON document persistence: `settings.json`, `history.json`, `stacks.json`
//! in the data directory. Documents are small; each write serializes the
//! whole document to a temp file and renames it into place.

use crate::error::CoreError;
use crate::models::history::{HistoryEntry, HISTORY_LIMIT};
use crate::models::stack::{Schedule, StackDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub schedules: HashMap<String, Schedule>,
}

struct StoreInner {
    dir: PathBuf,
    settings: Mutex<Settings>,
    history: Mutex<Vec<HistoryEntry>>,
    stacks: Mutex<BTreeMap<String, StackDefinition>>,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Load all three documents, tolerating absent files.
    pub async fn open(dir: &Path) -> Result<Self, CoreError> {
        tokio::fs::create_dir_all(dir).await?;
        let settings = read_or_default::<Settings>(&dir.join("settings.json")).await?;
        let history = read_or_default::<Vec<HistoryEntry>>(&dir.join("history.json")).await?;
        let stacks =
            read_or_default::<BTreeMap<String, StackDefinition>>(&dir.join("stacks.json")).await?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                dir: dir.to_path_buf(),
                settings: Mutex::new(settings),
                history: Mutex::new(history),
                stacks: Mutex::new(stacks),
            }),
        })
    }

    // ── history ──

    /// Append newest-first, evicting past the bound.
    pub async fn append_history(&self, entry: HistoryEntry) -> Result<(), CoreError> {
        let mut history = self.inner.history.lock().await;
        history.insert(0, entry);
        history.truncate(HISTORY_LIMIT);
        write_atomic(&self.inner.dir.join("history.json"), &*history).await
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.lock().await.clone()
    }

    // ── stacks ──

    pub async fn put_stack(&self, stack: StackDefinition) -> Result<(), CoreError> {
        let mut stacks = self.inner.stacks.lock().await;
        stacks.insert(stack.stack_name.clone(), stack);
        write_atomic(&self.inner.dir.join("stacks.json"), &*stacks).await
    }

    pub async fn get_stack(&self, name: &str) -> Option<StackDefinition> {
        self.inner.stacks.lock().await.get(name).cloned()
    }

    pub async fn list_stacks(&self) -> Vec<StackDefinition> {
        self.inner.stacks.lock().await.values().cloned().collect()
    }

    pub async fn delete_stack(&self, name: &str) -> Result<bool, CoreError> {
        let mut stacks = self.inner.stacks.lock().await;
        let removed = stacks.remove(name).is_some();
        if removed {
            write_atomic(&self.inner.dir.join("stacks.json"), &*stacks).await?;
        }
        Ok(removed)
    }

    // ── schedules (kept inside settings.json) ──

    pub async fn schedules(&self) -> HashMap<String, Schedule> {
        self.inner.settings.lock().await.schedules.clone()
    }

    pub async fn put_schedule(&self, key: &str, schedule: Schedule) -> Result<(), CoreError> {
        let mut settings = self.inner.settings.lock().await;
        settings.schedules.insert(key.to_string(), schedule);
        write_atomic(&self.inner.dir.join("settings.json"), &*settings).await
    }

    pub async fn delete_schedule(&self, key: &str) -> Result<bool, CoreError> {
        let mut settings = self.inner.settings.lock().await;
        let removed = settings.schedules.remove(key).is_some();
        if removed {
            write_atomic(&self.inner.dir.join("settings.json"), &*settings).await?;
        }
        Ok(removed)
    }
}

async fn read_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
) -> Result<T, CoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::history::{Destination, HistoryStatus};

    async fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (dir, store)
    }

    fn entry(subject: &str) -> HistoryEntry {
        HistoryEntry::new(subject, HistoryStatus::Success, Destination::Local, "ok")
    }

    #[tokio::test]
    async fn test_history_newest_first_and_bounded() {
        let (_dir, store) = temp_store().await;
        for i in 0..HISTORY_LIMIT + 10 {
            store.append_history(entry(&format!("job-{i}"))).await.unwrap();
        }
        let history = store.history().await;
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].subject, format!("job-{}", HISTORY_LIMIT + 9));
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).await.unwrap();
            store.append_history(entry("persisted")).await.unwrap();
            store
                .put_stack(StackDefinition {
                    stack_name: "web".into(),
                    compose_text: "services: {}".into(),
                    env_vars: Default::default(),
                    env_file: None,
                    services: Default::default(),
                    updated_at: chrono::Utc::now().to_rfc3339(),
                })
                .await
                .unwrap();
        }
        let store = Store::open(dir.path()).await.unwrap();
        assert_eq!(store.history().await[0].subject, "persisted");
        assert!(store.get_stack("web").await.is_some());
        assert!(store.delete_stack("web").await.unwrap());
        assert!(!store.delete_stack("web").await.unwrap());
    }
}
