use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use triptych_contracts::batch::{Batch, ItemStatus};
use triptych_contracts::events::{BatchEvent, EventLog};
use triptych_contracts::history::{FileBackend, HistoryStore};
use triptych_contracts::notify::{ClipboardSink, Notifier};
use triptych_engine::{
    complete_text, BatchRunner, DispatchError, DryrunProvider, GenerateOptions, HttpProvider,
    ImageProvider, TextOptions, TextProvider,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "triptych", version, about = "Batch AI image generation from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a batch of images for one prompt.
    Generate(GenerateArgs),
    /// Run a single text completion.
    Text(TextArgs),
    /// Show or clear the recent prompt history.
    History(HistoryArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    prompt: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = 3)]
    count: usize,
    #[arg(long, default_value_t = 512)]
    size: u32,
    #[arg(long, default_value_t = 0.8)]
    quality: f64,
    #[arg(long, default_value_t = 20)]
    steps: u32,
    /// Automatic retry passes over failed items after the first join.
    #[arg(long, default_value_t = 0)]
    retries: u32,
    #[arg(long)]
    dryrun: bool,
    /// Copy the prompt to the terminal clipboard (OSC 52) on completion.
    #[arg(long)]
    copy_prompt: bool,
    /// Print the final batch state as JSON instead of the table.
    #[arg(long)]
    json: bool,
    #[arg(long)]
    history: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct TextArgs {
    prompt: String,
    #[arg(long, default_value_t = 300)]
    max_tokens: u32,
    #[arg(long, default_value_t = 0.7)]
    temperature: f64,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[arg(long)]
    clear: bool,
    #[arg(long)]
    store: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("triptych error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Text(args) => run_text(args),
        Command::History(args) => {
            run_history(args)?;
            Ok(0)
        }
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let mut notifier = Notifier::new();
    let session_id = Uuid::new_v4().to_string();
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventLog::create(events_path, &session_id)?;
    let provider: Arc<dyn ImageProvider> = if args.dryrun {
        Arc::new(DryrunProvider)
    } else {
        Arc::new(HttpProvider::from_env())
    };
    let options = GenerateOptions {
        size: args.size,
        quality: args.quality,
        steps: args.steps,
    };

    let runner = BatchRunner::new(provider, events.clone());
    let running = match runner.generate(&args.prompt, args.count, &options) {
        Ok(running) => running,
        Err(err @ DispatchError::EmptyPrompt) => {
            notifier.show(err.to_string());
            flush_notices(&mut notifier);
            return Ok(2);
        }
        Err(err) => bail!(err),
    };

    let mut history = HistoryStore::load(Box::new(FileBackend::new(history_path(
        args.history.as_deref(),
    ))));
    history.record(&args.prompt);
    if let Some(error) = history.take_persist_error() {
        let _ = events.record(&BatchEvent::HistoryPersistFailed { error });
    }

    println!(
        "batch {}: {} item(s) pending",
        running.batch_id(),
        running.snapshot().len()
    );
    running.wait();

    let mut budget = args.retries;
    while budget > 0 {
        let failed: Vec<String> = running
            .snapshot()
            .items()
            .iter()
            .filter(|item| item.status() == ItemStatus::Error)
            .map(|item| item.id().to_string())
            .collect();
        if failed.is_empty() {
            break;
        }
        for item_id in &failed {
            running.retry(item_id)?;
        }
        running.wait();
        budget -= 1;
    }

    let snapshot = running.snapshot();
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        save_artifacts(&snapshot, &args.out, false)?;
    } else {
        save_artifacts(&snapshot, &args.out, true)?;
    }

    if args.copy_prompt {
        let mut clipboard = Osc52Clipboard;
        match clipboard.write(&args.prompt) {
            Ok(()) => notifier.show("Copied to clipboard"),
            Err(_) => notifier.show("Copy failed"),
        }
    }
    flush_notices(&mut notifier);

    let (_, errored) = snapshot.resolved_counts();
    Ok(if errored == 0 { 0 } else { 1 })
}

/// Writes each done item's artifact under `out` and, unless quiet,
/// prints one status line per item.
fn save_artifacts(snapshot: &Batch, out: &Path, print: bool) -> Result<()> {
    let stamp = chrono::Utc::now().timestamp_millis();
    for (index, item) in snapshot.items().iter().enumerate() {
        match item.status() {
            ItemStatus::Done => {
                let Some(payload) = item.payload() else {
                    continue;
                };
                let ext = extension_for(&payload.media_type);
                let path = out.join(format!("artifact-{stamp}-{index:02}.{ext}"));
                let bytes = decode_data_url(&payload.data_url)?;
                fs::write(&path, &bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                if print {
                    let dims = image::load_from_memory(&bytes)
                        .map(|decoded| format!("{}x{}", decoded.width(), decoded.height()))
                        .unwrap_or_else(|_| "-".to_string());
                    println!("item {}  done   {dims}  {}", index + 1, path.display());
                }
            }
            ItemStatus::Error => {
                if print {
                    println!(
                        "item {}  error  {}",
                        index + 1,
                        item.error().unwrap_or("Failed to generate image")
                    );
                }
            }
            ItemStatus::Pending => {
                if print {
                    println!("item {}  pending", index + 1);
                }
            }
        }
    }
    Ok(())
}

fn run_text(args: TextArgs) -> Result<i32> {
    let provider: Box<dyn TextProvider> = if args.dryrun {
        Box::new(DryrunProvider)
    } else {
        Box::new(HttpProvider::from_env())
    };
    let options = TextOptions {
        max_tokens: args.max_tokens,
        temperature: args.temperature,
    };
    match complete_text(provider.as_ref(), &args.prompt, &options) {
        Ok(text) => {
            println!("{text}");
            Ok(0)
        }
        Err(err) if err.downcast_ref::<DispatchError>() == Some(&DispatchError::EmptyPrompt) => {
            let mut notifier = Notifier::new();
            notifier.show(err.to_string());
            flush_notices(&mut notifier);
            Ok(2)
        }
        Err(err) => Err(err),
    }
}

fn run_history(args: HistoryArgs) -> Result<()> {
    let mut store = HistoryStore::load(Box::new(FileBackend::new(history_path(
        args.store.as_deref(),
    ))));
    if args.clear {
        store.clear();
        if let Some(error) = store.take_persist_error() {
            eprintln!("warning: history store not cleared on disk: {error}");
        }
        println!("History cleared");
        return Ok(());
    }
    if store.all().is_empty() {
        println!("No prompt history yet.");
        return Ok(());
    }
    for (index, prompt) in store.all().iter().enumerate() {
        println!("{}. {prompt}", index + 1);
    }
    Ok(())
}

fn history_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = env::var("TRIPTYCH_HISTORY").ok().filter(|v| !v.is_empty()) {
        return PathBuf::from(path);
    }
    dirs::data_dir()
        .map(|dir| dir.join("triptych").join("history.json"))
        .unwrap_or_else(|| PathBuf::from(".triptych-history.json"))
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        _ => "png",
    }
}

fn decode_data_url(data_url: &str) -> Result<Vec<u8>> {
    let (meta, payload) = data_url
        .split_once(',')
        .context("artifact data URL has no payload")?;
    if meta.contains(";base64") {
        BASE64
            .decode(payload.trim().as_bytes())
            .context("artifact base64 decode failed")
    } else {
        // Plain data-URL payloads are percent-encoded.
        Ok(urlencoding::decode_binary(payload.as_bytes()).into_owned())
    }
}

fn flush_notices(notifier: &mut Notifier) {
    for notice in notifier.active() {
        eprintln!("notice: {}", notice.message());
    }
}

/// Clipboard write through the OSC 52 terminal escape; fails off-tty so
/// the caller can fall back to a "Copy failed" notice. The escape goes
/// to stderr so piped stdout (`--json`) stays parseable.
struct Osc52Clipboard;

impl ClipboardSink for Osc52Clipboard {
    fn write(&mut self, text: &str) -> Result<()> {
        let mut stderr = io::stderr();
        if !stderr.is_terminal() {
            bail!("stderr is not a terminal");
        }
        stderr.write_all(osc52_sequence(text).as_bytes())?;
        stderr.flush()?;
        Ok(())
    }
}

fn osc52_sequence(text: &str) -> String {
    format!("\x1b]52;c;{}\x07", BASE64.encode(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_follows_media_type() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("image/jpg"), "jpg");
        assert_eq!(extension_for("image/gif"), "gif");
        assert_eq!(extension_for("image/svg+xml"), "svg");
        assert_eq!(extension_for("image/webp"), "png");
    }

    #[test]
    fn data_url_base64_payload_decodes() {
        let bytes = decode_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn data_url_plain_payload_is_percent_decoded() {
        let bytes = decode_data_url("data:image/svg+xml,%3Csvg%2F%3E").unwrap();
        assert_eq!(bytes, b"<svg/>");

        let untouched = decode_data_url("data:image/svg+xml,<svg/>").unwrap();
        assert_eq!(untouched, b"<svg/>");
    }

    #[test]
    fn clipboard_escape_wraps_the_base64_payload() {
        assert_eq!(osc52_sequence("hello"), "\x1b]52;c;aGVsbG8=\x07");
    }

    #[test]
    fn data_url_without_comma_is_an_error() {
        assert!(decode_data_url("data:image/png;base64").is_err());
    }

    #[test]
    fn explicit_history_path_wins() {
        let path = history_path(Some(Path::new("/tmp/history.json")));
        assert_eq!(path, PathBuf::from("/tmp/history.json"));
    }

    #[test]
    fn saved_artifacts_land_in_the_out_dir() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let provider = DryrunProvider;
        let raw = provider.generate("cat", &GenerateOptions::default())?;
        let payload = triptych_engine::validate_response(&raw)
            .map_err(anyhow::Error::from)?;

        let mut batch = Batch::new("cat", 1);
        let item_id = batch.items()[0].id().to_string();
        batch.complete(
            &item_id,
            0,
            triptych_contracts::batch::ItemOutcome::Done(payload),
        );

        save_artifacts(&batch, temp.path(), false)?;
        let entries: Vec<_> = fs::read_dir(temp.path())?.collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        let name = name.to_string_lossy();
        assert!(name.starts_with("artifact-"));
        assert!(name.ends_with(".png"));
        Ok(())
    }
}
