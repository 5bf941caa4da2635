use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sync journal: one record per file-level side effect on a node.
pub trait Logger: Send + Sync {
    fn start(&self, _root: &Path, _peer: &str) {}
    fn fetched(&self, _name: &str, _bytes: u64) {}
    fn deleted(&self, _name: &str) {}
    fn error(&self, _context: &str, _name: &str, _msg: &str) {}
    fn cycle_done(&self, _fetched: u64, _deleted: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open journal {}", path.display()))
}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: Mutex::new(open_append(path.as_ref())?),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn start(&self, root: &Path, peer: &str) {
        self.line(&format!("START root={} peer={}", root.display(), peer));
    }
    fn fetched(&self, name: &str, bytes: u64) {
        self.line(&format!("FETCH name={} bytes={}", name, bytes));
    }
    fn deleted(&self, name: &str) {
        self.line(&format!("DELETE name={}", name));
    }
    fn error(&self, context: &str, name: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} name={} msg={}", context, name, msg));
    }
    fn cycle_done(&self, fetched: u64, deleted: u64, seconds: f64) {
        self.line(&format!(
            "DONE fetched={fetched} deleted={deleted} seconds={seconds:.3}"
        ));
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    Start,
    Fetch,
    Delete,
    Error,
    CycleDone,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub timestamp: String,
    pub event: JournalEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<u64>,
}

impl JournalEntry {
    fn now(event: JournalEvent) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event,
            name: None,
            bytes: None,
            error: None,
            seconds: None,
            fetched: None,
            deleted: None,
        }
    }
}

/// JSONL journal
pub struct JsonLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Mutex::new(open_append(&path)?);
        Ok(Self { path, file })
    }

    fn add_entry(&self, entry: &JournalEntry) {
        let mut f = self.file.lock();
        if serde_json::to_writer(&mut *f, entry).is_ok() {
            let _ = f.write_all(b"\n");
            let _ = f.flush();
        }
    }

    pub fn read_log(&self) -> Result<Vec<JournalEntry>> {
        read_journal(&self.path)
    }
}

impl Logger for JsonLogger {
    fn start(&self, root: &Path, peer: &str) {
        let mut e = JournalEntry::now(JournalEvent::Start);
        e.name = Some(format!("{} <- {}", root.display(), peer));
        self.add_entry(&e);
    }
    fn fetched(&self, name: &str, bytes: u64) {
        let mut e = JournalEntry::now(JournalEvent::Fetch);
        e.name = Some(name.to_string());
        e.bytes = Some(bytes);
        self.add_entry(&e);
    }
    fn deleted(&self, name: &str) {
        let mut e = JournalEntry::now(JournalEvent::Delete);
        e.name = Some(name.to_string());
        self.add_entry(&e);
    }
    fn error(&self, context: &str, name: &str, msg: &str) {
        let mut e = JournalEntry::now(JournalEvent::Error);
        e.name = Some(name.to_string());
        e.error = Some(format!("{}: {}", context, msg));
        self.add_entry(&e);
    }
    fn cycle_done(&self, fetched: u64, deleted: u64, seconds: f64) {
        let mut e = JournalEntry::now(JournalEvent::CycleDone);
        e.fetched = Some(fetched);
        e.deleted = Some(deleted);
        e.seconds = Some(seconds);
        self.add_entry(&e);
    }
}

pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).context("Failed to open journal for reading")?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// Choose the journal once; `NoopLogger` when no file is configured.
pub fn open_logger(path: Option<&Path>, format: LogFormat) -> Result<Arc<dyn Logger>> {
    Ok(match (path, format) {
        (None, _) => Arc::new(NoopLogger),
        (Some(p), LogFormat::Text) => Arc::new(TextLogger::new(p)?),
        (Some(p), LogFormat::Json) => Arc::new(JsonLogger::new(p)?),
    })
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `verbosity`.
pub fn init_tracing(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
