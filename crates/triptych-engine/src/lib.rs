use std::env;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use thiserror::Error;
use triptych_contracts::batch::{Batch, ImagePayload, ItemOutcome};
use triptych_contracts::events::{BatchEvent, EventLog};

pub const DEFAULT_STAGGER: Duration = Duration::from_millis(300);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_API_BASE: &str = "http://localhost:3000/api";

pub const ACCEPTED_IMAGE_PREFIXES: &[&str] = &[
    "data:image/png",
    "data:image/jpeg",
    "data:image/jpg",
    "data:image/gif",
    "data:image/svg+xml",
];

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    pub size: u32,
    pub quality: f64,
    pub steps: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            size: 512,
            quality: 0.8,
            steps: 20,
        }
    }
}

impl GenerateOptions {
    pub fn normalized(&self) -> Self {
        let clamped = self.size.clamp(512, 1024);
        let size = (512 + ((clamped - 512 + 64) / 128) * 128).min(1024);
        Self {
            size,
            quality: self.quality.clamp(0.2, 1.0),
            steps: self.steps.clamp(10, 50),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextOptions {
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for TextOptions {
    fn default() -> Self {
        Self {
            max_tokens: 300,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Please enter a prompt")]
    EmptyPrompt,
    #[error("unknown batch item '{0}'")]
    UnknownItem(String),
    #[error("batch state lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidateError {
    #[error("{0}")]
    UpstreamFailure(String),
    #[error("{0}")]
    MissingPayload(String),
    #[error("Invalid image format. Got: {0}")]
    UnsupportedFormat(String),
}

pub fn validate_response(raw: &Value) -> std::result::Result<ImagePayload, ValidateError> {
    if !raw.get("success").and_then(Value::as_bool).unwrap_or(false) {
        let message = non_empty_str(raw.get("error")).unwrap_or("API returned failure");
        return Err(ValidateError::UpstreamFailure(message.to_string()));
    }
    let Some(image) = non_empty_str(raw.get("image")) else {
        let note = non_empty_str(raw.get("note")).unwrap_or("No image data received");
        return Err(ValidateError::MissingPayload(note.to_string()));
    };
    if !ACCEPTED_IMAGE_PREFIXES
        .iter()
        .any(|prefix| image.starts_with(prefix))
    {
        return Err(ValidateError::UnsupportedFormat(
            truncate_text(image, 50).to_string(),
        ));
    }
    Ok(ImagePayload {
        media_type: media_type_of(image),
        data_url: image.to_string(),
    })
}

pub fn validate_text_response(raw: &Value) -> std::result::Result<String, ValidateError> {
    if !raw.get("success").and_then(Value::as_bool).unwrap_or(false) {
        let message = non_empty_str(raw.get("error")).unwrap_or("API returned failure");
        return Err(ValidateError::UpstreamFailure(message.to_string()));
    }
    match non_empty_str(raw.get("text")) {
        Some(text) => Ok(text.to_string()),
        None => Err(ValidateError::MissingPayload(
            "No text received".to_string(),
        )),
    }
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Transport failures are `Err`; upstream failure envelopes come back
    /// as `Ok` for the validator to classify.
    fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Value>;
}

pub trait TextProvider: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, prompt: &str, options: &TextOptions) -> Result<Value>;
}

pub struct HttpProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    timeout: Duration,
}

impl HttpProvider {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: normalize_api_base(api_base.into()),
            api_key: None,
            http: HttpClient::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_env() -> Self {
        let api_base =
            non_empty_env("TRIPTYCH_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            api_key: non_empty_env("TRIPTYCH_API_KEY"),
            ..Self::new(api_base)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn post_json(&self, endpoint: &str, payload: &Map<String, Value>) -> Result<Value> {
        let url = format!("{}/{endpoint}", self.api_base);
        let mut request = self
            .http
            .post(&url)
            .json(&Value::Object(payload.clone()))
            .timeout(self.timeout);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .with_context(|| format!("generation request failed ({url})"))?;
        let status = response.status();
        let body = response
            .text()
            .with_context(|| format!("generation response read failed ({url})"))?;
        // Error statuses still carry a JSON failure envelope; only an
        // unparseable body is a transport-level failure.
        match serde_json::from_str::<Value>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => bail!(
                "generation request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            ),
            Err(err) => Err(err).with_context(|| format!("generation response decode failed ({url})")),
        }
    }
}

impl ImageProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Value> {
        let payload = map_object(json!({
            "prompt": prompt,
            "size": options.size,
            "quality": options.quality,
            "steps": options.steps,
        }));
        self.post_json("generate", &payload)
    }
}

impl TextProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn complete(&self, prompt: &str, options: &TextOptions) -> Result<Value> {
        let payload = map_object(json!({
            "prompt": prompt,
            "maxTokens": options.max_tokens,
            "temperature": options.temperature,
        }));
        self.post_json("generate-text", &payload)
    }
}

// Offline provider: deterministic placeholder frame in the same response
// envelope the HTTP endpoints use.
#[derive(Debug, Default)]
pub struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Value> {
        let data_url = dryrun_data_url(prompt, options.size)?;
        Ok(json!({
            "success": true,
            "image": data_url,
            "prompt": prompt,
        }))
    }
}

impl TextProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, prompt: &str, _options: &TextOptions) -> Result<Value> {
        Ok(json!({
            "success": true,
            "text": format!("[dryrun] {prompt}"),
        }))
    }
}

fn dryrun_data_url(prompt: &str, size: u32) -> Result<String> {
    let seed = prompt
        .bytes()
        .fold(0u32, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as u32));
    let side = size.clamp(64, 1024);
    let frame = RgbImage::from_fn(side, side, |x, y| {
        let mixed = x.wrapping_mul(7) ^ y.wrapping_mul(13) ^ seed;
        Rgb([
            (mixed & 0xff) as u8,
            ((mixed >> 8) & 0xff) as u8,
            ((mixed >> 16) & 0xff) as u8,
        ])
    });
    let mut png = Vec::new();
    frame
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("dryrun frame encode failed")?;
    Ok(format!("data:image/png;base64,{}", BASE64.encode(png)))
}

pub struct BatchRunner {
    provider: Arc<dyn ImageProvider>,
    events: EventLog,
    stagger: Duration,
}

impl BatchRunner {
    pub fn new(provider: Arc<dyn ImageProvider>, events: EventLog) -> Self {
        Self {
            provider,
            events,
            stagger: DEFAULT_STAGGER,
        }
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    // Slot `i` sleeps `i * stagger` before dispatching.
    pub fn generate(
        &self,
        prompt: &str,
        count: usize,
        options: &GenerateOptions,
    ) -> std::result::Result<RunningBatch, DispatchError> {
        if prompt.trim().is_empty() {
            return Err(DispatchError::EmptyPrompt);
        }
        let options = options.normalized();
        let batch = Batch::new(prompt, count);
        let targets: Vec<(String, u64)> = batch
            .items()
            .iter()
            .map(|item| (item.id().to_string(), item.version()))
            .collect();
        let _ = self.events.record(&BatchEvent::BatchStarted {
            batch_id: batch.id().to_string(),
            prompt: prompt.to_string(),
            count: batch.len(),
        });

        let shared = Arc::new(Mutex::new(batch));
        let mut workers = Vec::new();
        for (index, (item_id, version)) in targets.into_iter().enumerate() {
            workers.push(spawn_worker(
                self.provider.clone(),
                self.events.clone(),
                shared.clone(),
                item_id,
                version,
                prompt.to_string(),
                options.clone(),
                self.stagger * index as u32,
            ));
        }

        Ok(RunningBatch {
            provider: self.provider.clone(),
            events: self.events.clone(),
            prompt: prompt.to_string(),
            options,
            batch: shared,
            workers: Mutex::new(workers),
        })
    }
}

pub struct RunningBatch {
    provider: Arc<dyn ImageProvider>,
    events: EventLog,
    prompt: String,
    options: GenerateOptions,
    batch: Arc<Mutex<Batch>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RunningBatch {
    pub fn batch_id(&self) -> String {
        self.snapshot().id().to_string()
    }

    pub fn prompt(&self) -> &str {
        self.prompt.as_str()
    }

    pub fn snapshot(&self) -> Batch {
        match self.batch.lock() {
            Ok(batch) => batch.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.snapshot().all_resolved()
    }

    // Joins every outstanding worker, retries included.
    pub fn wait(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let Ok(mut workers) = self.workers.lock() else {
                    return;
                };
                workers.drain(..).collect()
            };
            if drained.is_empty() {
                break;
            }
            for handle in drained {
                let _ = handle.join();
            }
        }
        let snapshot = self.snapshot();
        if snapshot.all_resolved() {
            let (done, errored) = snapshot.resolved_counts();
            let _ = self.events.record(&BatchEvent::BatchCompleted {
                batch_id: snapshot.id().to_string(),
                done,
                error: errored,
            });
        }
    }

    /// Returns the item to `pending` synchronously, then re-dispatches it;
    /// a superseded in-flight result is dropped by the version check.
    pub fn retry(&self, item_id: &str) -> std::result::Result<(), DispatchError> {
        let (version, retries) = {
            let mut batch = self.batch.lock().map_err(|_| DispatchError::Poisoned)?;
            let Some(version) = batch.begin_retry(item_id) else {
                return Err(DispatchError::UnknownItem(item_id.to_string()));
            };
            let retries = batch
                .get(item_id)
                .map(|item| item.retries())
                .unwrap_or_default();
            (version, retries)
        };
        let _ = self.events.record(&BatchEvent::ItemRetry {
            item_id: item_id.to_string(),
            retries,
        });
        let handle = spawn_worker(
            self.provider.clone(),
            self.events.clone(),
            self.batch.clone(),
            item_id.to_string(),
            version,
            self.prompt.clone(),
            self.options.clone(),
            Duration::ZERO,
        );
        self.workers
            .lock()
            .map_err(|_| DispatchError::Poisoned)?
            .push(handle);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    provider: Arc<dyn ImageProvider>,
    events: EventLog,
    batch: Arc<Mutex<Batch>>,
    item_id: String,
    version: u64,
    prompt: String,
    options: GenerateOptions,
    delay: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let _ = events.record(&BatchEvent::ItemDispatched {
            item_id: item_id.clone(),
            version,
        });
        let outcome = match provider.generate(&prompt, &options) {
            Ok(raw) => match validate_response(&raw) {
                Ok(payload) => ItemOutcome::Done(payload),
                Err(err) => ItemOutcome::Error(err.to_string()),
            },
            Err(err) => ItemOutcome::Error(format!("{err:#}")),
        };
        let resolution = match &outcome {
            ItemOutcome::Done(payload) => BatchEvent::ItemDone {
                item_id: item_id.clone(),
                media_type: payload.media_type.clone(),
            },
            ItemOutcome::Error(message) => BatchEvent::ItemError {
                item_id: item_id.clone(),
                message: message.clone(),
            },
        };
        let applied = {
            let Ok(mut batch) = batch.lock() else {
                return;
            };
            batch.complete(&item_id, version, outcome)
        };
        if applied {
            let _ = events.record(&resolution);
        } else {
            let _ = events.record(&BatchEvent::ItemStaleResultDropped { item_id, version });
        }
    })
}

pub fn complete_text(
    provider: &dyn TextProvider,
    prompt: &str,
    options: &TextOptions,
) -> Result<String> {
    if prompt.trim().is_empty() {
        bail!(DispatchError::EmptyPrompt);
    }
    let raw = provider.complete(prompt, options)?;
    Ok(validate_text_response(&raw)?)
}

pub fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn media_type_of(data_url: &str) -> String {
    data_url
        .strip_prefix("data:")
        .and_then(|rest| rest.split([';', ',']).next())
        .map(str::trim)
        .filter(|media| !media.is_empty())
        .unwrap_or("image/png")
        .to_string()
}

fn truncate_text(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn normalize_api_base(base: String) -> String {
    base.trim().trim_end_matches('/').to_string()
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
