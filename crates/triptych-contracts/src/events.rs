use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// One step of a batch lifecycle, as it lands in `events.jsonl`.
/// The variant name becomes the `type` field of the line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    BatchStarted {
        batch_id: String,
        prompt: String,
        count: usize,
    },
    BatchCompleted {
        batch_id: String,
        done: usize,
        error: usize,
    },
    ItemDispatched {
        item_id: String,
        version: u64,
    },
    ItemDone {
        item_id: String,
        media_type: String,
    },
    ItemError {
        item_id: String,
        message: String,
    },
    ItemRetry {
        item_id: String,
        retries: u32,
    },
    ItemStaleResultDropped {
        item_id: String,
        version: u64,
    },
    HistoryPersistFailed {
        error: String,
    },
}

/// Append-only JSONL sink for [`BatchEvent`]s. The file handle is opened
/// once and shared by clones, so worker threads record through the same
/// lock and lines never interleave.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    session_id: String,
    file: Mutex<File>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    event: &'a BatchEvent,
    session_id: &'a str,
    ts: String,
}

impl EventLog {
    pub fn create(
        path: impl Into<PathBuf>,
        session_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(EventLogInner {
                path,
                session_id: session_id.into(),
                file: Mutex::new(file),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, event: &BatchEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(&Envelope {
            event,
            session_id: &self.inner.session_id,
            ts: now_utc_iso(),
        })?;
        let mut file = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::Value;

    use super::*;

    #[test]
    fn record_writes_a_tagged_envelope_per_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::create(&path, "session-42")?;

        log.record(&BatchEvent::BatchStarted {
            batch_id: "b1".to_string(),
            prompt: "cat".to_string(),
            count: 3,
        })?;

        let content = fs::read_to_string(&path)?;
        let parsed: Value = serde_json::from_str(content.lines().next().unwrap_or(""))?;
        assert_eq!(parsed["type"], Value::String("batch_started".to_string()));
        assert_eq!(parsed["session_id"], Value::String("session-42".to_string()));
        assert_eq!(parsed["prompt"], Value::String("cat".to_string()));
        assert_eq!(parsed["count"], Value::from(3));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn variant_names_become_snake_case_types() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::create(&path, "session-42")?;

        log.record(&BatchEvent::ItemStaleResultDropped {
            item_id: "i1".to_string(),
            version: 2,
        })?;
        log.record(&BatchEvent::HistoryPersistFailed {
            error: "disk full".to_string(),
        })?;

        let content = fs::read_to_string(&path)?;
        let types: Vec<String> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(types, vec!["item_stale_result_dropped", "history_persist_failed"]);
        Ok(())
    }

    #[test]
    fn clones_append_through_the_same_handle() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::create(&path, "session-42")?;
        let clone = log.clone();

        log.record(&BatchEvent::ItemDispatched {
            item_id: "i1".to_string(),
            version: 0,
        })?;
        clone.record(&BatchEvent::ItemDone {
            item_id: "i1".to_string(),
            media_type: "image/png".to_string(),
        })?;

        let content = fs::read_to_string(&path)?;
        assert_eq!(content.lines().count(), 2);
        Ok(())
    }
}
