use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::{Map, Value};

pub const HISTORY_KEY: &str = "prompt_history_v2";
pub const HISTORY_LIMIT: usize = 6;

/// Synchronous key-value persistence. Any call may fail; the history
/// store treats failures as best-effort and keeps working in memory.
pub trait HistoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

/// Single-file JSON object store, one top-level key per entry.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_object(&self) -> Map<String, Value> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Map::new();
        };
        serde_json::from_str::<Value>(&raw)
            .ok()
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default()
    }

    fn write_object(&self, payload: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
        )?;
        Ok(())
    }
}

impl HistoryBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .read_object()
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut payload = self.read_object();
        payload.insert(key.to_string(), Value::String(value.to_string()));
        self.write_object(&payload)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let mut payload = self.read_object();
        if payload.remove(key).is_none() {
            return Ok(());
        }
        self.write_object(&payload)
    }
}

/// Bounded, deduplicated, newest-first list of recent prompts.
///
/// Persistence is best-effort: a failed write never reaches the caller's
/// generation flow. The last failure is retained for the caller to log.
pub struct HistoryStore {
    backend: Box<dyn HistoryBackend + Send>,
    entries: Vec<String>,
    last_persist_error: Option<String>,
}

impl HistoryStore {
    /// Loads persisted history; corrupt or unreadable state becomes an
    /// empty list, never an error.
    pub fn load(backend: Box<dyn HistoryBackend + Send>) -> Self {
        let entries = backend
            .get(HISTORY_KEY)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|value| value.as_array().cloned())
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            backend,
            entries,
            last_persist_error: None,
        }
    }

    pub fn all(&self) -> &[String] {
        self.entries.as_slice()
    }

    /// Prepends the prompt, removing an exact-value duplicate first and
    /// truncating to [`HISTORY_LIMIT`].
    pub fn record(&mut self, prompt: &str) {
        self.entries.retain(|entry| entry != prompt);
        self.entries.insert(0, prompt.to_string());
        self.entries.truncate(HISTORY_LIMIT);
        self.persist();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        if let Err(err) = self.backend.remove(HISTORY_KEY) {
            self.last_persist_error = Some(format!("{err:#}"));
        }
    }

    /// Takes the most recent persistence failure, if any, for logging.
    pub fn take_persist_error(&mut self) -> Option<String> {
        self.last_persist_error.take()
    }

    fn persist(&mut self) {
        let raw = match serde_json::to_string(&self.entries) {
            Ok(raw) => raw,
            Err(err) => {
                self.last_persist_error = Some(format!("{err:#}"));
                return;
            }
        };
        if let Err(err) = self.backend.set(HISTORY_KEY, &raw) {
            self.last_persist_error = Some(format!("{err:#}"));
        }
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("entries", &self.entries)
            .field("last_persist_error", &self.last_persist_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::bail;

    use super::*;

    #[derive(Default)]
    struct MemoryBackend {
        map: HashMap<String, String>,
    }

    impl HistoryBackend for MemoryBackend {
        fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.map.get(key).cloned())
        }

        fn set(&mut self, key: &str, value: &str) -> Result<()> {
            self.map.insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn remove(&mut self, key: &str) -> Result<()> {
            self.map.remove(key);
            Ok(())
        }
    }

    struct QuotaExceededBackend;

    impl HistoryBackend for QuotaExceededBackend {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn set(&mut self, _key: &str, _value: &str) -> Result<()> {
            bail!("storage quota exceeded")
        }

        fn remove(&mut self, _key: &str) -> Result<()> {
            bail!("storage unavailable")
        }
    }

    #[test]
    fn record_then_all_puts_prompt_first() {
        let mut store = HistoryStore::load(Box::new(MemoryBackend::default()));
        store.record("cyberpunk city at sunset");
        assert_eq!(store.all(), ["cyberpunk city at sunset"]);
    }

    #[test]
    fn recording_a_duplicate_moves_it_to_front_without_growing() {
        let mut store = HistoryStore::load(Box::new(MemoryBackend::default()));
        store.record("first");
        store.record("second");
        store.record("first");
        assert_eq!(store.all(), ["first", "second"]);
    }

    #[test]
    fn history_is_truncated_to_limit_dropping_oldest() {
        let mut store = HistoryStore::load(Box::new(MemoryBackend::default()));
        for index in 0..=HISTORY_LIMIT {
            store.record(&format!("prompt-{index}"));
        }
        assert_eq!(store.all().len(), HISTORY_LIMIT);
        assert_eq!(store.all()[0], format!("prompt-{HISTORY_LIMIT}"));
        assert!(!store.all().contains(&"prompt-0".to_string()));
    }

    #[test]
    fn clear_empties_memory_and_persisted_state() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        let mut store = HistoryStore::load(Box::new(FileBackend::new(&path)));
        store.record("cat");
        store.clear();
        assert!(store.all().is_empty());

        let reloaded = HistoryStore::load(Box::new(FileBackend::new(&path)));
        assert!(reloaded.all().is_empty());
        Ok(())
    }

    #[test]
    fn history_survives_a_reload() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        let mut store = HistoryStore::load(Box::new(FileBackend::new(&path)));
        store.record("older");
        store.record("newer");
        drop(store);

        let reloaded = HistoryStore::load(Box::new(FileBackend::new(&path)));
        assert_eq!(reloaded.all(), ["newer", "older"]);
        Ok(())
    }

    #[test]
    fn corrupt_persisted_state_loads_as_empty() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        std::fs::write(&path, "{ not json")?;
        let store = HistoryStore::load(Box::new(FileBackend::new(&path)));
        assert!(store.all().is_empty());

        std::fs::write(
            &path,
            format!("{{\"{HISTORY_KEY}\": \"not an array\"}}"),
        )?;
        let store = HistoryStore::load(Box::new(FileBackend::new(&path)));
        assert!(store.all().is_empty());
        Ok(())
    }

    #[test]
    fn persistence_failure_is_swallowed_but_retained_for_logging() {
        let mut store = HistoryStore::load(Box::new(QuotaExceededBackend));
        store.record("cat");
        assert_eq!(store.all(), ["cat"]);
        let error = store.take_persist_error().unwrap_or_default();
        assert!(error.contains("storage quota exceeded"));
        assert!(store.take_persist_error().is_none());
    }
}
