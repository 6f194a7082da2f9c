use serde::Serialize;
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Done,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Done => "done",
            ItemStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImagePayload {
    pub media_type: String,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Done(ImagePayload),
    Error(String),
}

/// One slot in a generation batch.
///
/// The item id is the sole key for state updates and is never reused
/// across batches. `version` advances on every retry so a completion
/// captured against an older dispatch can be rejected.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    id: String,
    status: ItemStatus,
    payload: Option<ImagePayload>,
    error: Option<String>,
    version: u64,
    retries: u32,
}

impl BatchItem {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: ItemStatus::Pending,
            payload: None,
            error: None,
            version: 0,
            retries: 0,
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn payload(&self) -> Option<&ImagePayload> {
        self.payload.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_resolved(&self) -> bool {
        self.status != ItemStatus::Pending
    }
}

/// An ordered, fixed-size group of items created from one prompt
/// submission. Only individual items mutate after creation.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    id: String,
    prompt: String,
    items: Vec<BatchItem>,
}

impl Batch {
    pub fn new(prompt: impl Into<String>, count: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            items: (0..count.max(1)).map(|_| BatchItem::new()).collect(),
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    pub fn prompt(&self) -> &str {
        self.prompt.as_str()
    }

    pub fn items(&self) -> &[BatchItem] {
        self.items.as_slice()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, item_id: &str) -> Option<&BatchItem> {
        self.items.iter().find(|item| item.id == item_id)
    }

    /// Applies a completion captured at `version`. Returns false without
    /// touching any item when the id is unknown or the item has since
    /// been re-dispatched under a newer version.
    pub fn complete(&mut self, item_id: &str, version: u64, outcome: ItemOutcome) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == item_id) else {
            return false;
        };
        if item.version != version {
            return false;
        }
        match outcome {
            ItemOutcome::Done(payload) => {
                item.status = ItemStatus::Done;
                item.payload = Some(payload);
                item.error = None;
            }
            ItemOutcome::Error(message) => {
                item.status = ItemStatus::Error;
                item.payload = None;
                item.error = Some(message);
            }
        }
        true
    }

    /// Returns the item to `pending` ahead of a re-dispatch, bumping its
    /// version and retry counter. Allowed from any status; regenerating a
    /// `done` item in place is a supported operation.
    pub fn begin_retry(&mut self, item_id: &str) -> Option<u64> {
        let item = self.items.iter_mut().find(|item| item.id == item_id)?;
        item.status = ItemStatus::Pending;
        item.payload = None;
        item.error = None;
        item.version += 1;
        item.retries += 1;
        Some(item.version)
    }

    pub fn all_resolved(&self) -> bool {
        self.items.iter().all(BatchItem::is_resolved)
    }

    /// (done, error) counts across the batch.
    pub fn resolved_counts(&self) -> (usize, usize) {
        let done = self
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Done)
            .count();
        let errored = self
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Error)
            .count();
        (done, errored)
    }
}
