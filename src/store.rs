//! ==============================================================================
//! store.rs - persisted device configuration (pisensor.conf)
//! ==============================================================================
//!
//! purpose:
//!     owns the single shared `Config` (send interval, alert threshold) and the
//!     INI document it is persisted in.
//!
//! rules:
//!     - readers get a full snapshot through a watch channel, never a torn value
//!     - writers are serialized and persist BEFORE the new value is published
//!     - every line the agent does not own is written back untouched
//!
//! relationships:
//!     - used by: agent.rs (snapshot per cycle)
//!     - used by: dispatch.rs (setters, reported state)
//!     - used by: main.rs (connection string fallback, file watcher)
//!
//! file format:
//!
//!     [Default]
//!     connectionstring = HostName=...;DeviceId=...;SharedAccessKey=...
//!
//!     [Telemetry]
//!     sendinterval = 60
//!     tempalert = 30
//!
//! ==============================================================================

use crate::domain::Config;
use crate::error::StoreError;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

const DEFAULT_SECTION: &str = "Default";
const TELEMETRY_SECTION: &str = "Telemetry";
const CONNECTION_STRING_KEY: &str = "connectionstring";
const SEND_INTERVAL_KEY: &str = "sendinterval";
const TEMP_ALERT_KEY: &str = "tempalert";

// ==============================================================================
// ini document
// ==============================================================================
// a line-preserving model. parsing keeps the raw text of every line so
// serializing an untouched document reproduces the input byte for byte.

#[derive(Debug, Clone, PartialEq)]
enum Line {
    Section { name: String, raw: String },
    Entry { key: String, value: String, raw: String },
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IniDocument {
    lines: Vec<Line>,
    trailing_newline: bool,
}

impl IniDocument {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|raw| {
                let trimmed = raw.trim();
                if trimmed.starts_with('[') && trimmed.ends_with(']') {
                    Line::Section {
                        name: trimmed[1..trimmed.len() - 1].trim().to_string(),
                        raw: raw.to_string(),
                    }
                } else if trimmed.starts_with('#') || trimmed.starts_with(';') || trimmed.is_empty() {
                    Line::Other(raw.to_string())
                } else if let Some(pos) = trimmed.find(['=', ':']) {
                    Line::Entry {
                        key: trimmed[..pos].trim().to_string(),
                        value: trimmed[pos + 1..].trim().to_string(),
                        raw: raw.to_string(),
                    }
                } else {
                    Line::Other(raw.to_string())
                }
            })
            .collect();

        Self {
            lines,
            trailing_newline: text.is_empty() || text.ends_with('\n'),
        }
    }

    /// Keys compare case-insensitively, section names exactly.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let mut current: Option<&str> = None;
        for line in &self.lines {
            match line {
                Line::Section { name, .. } => current = Some(name),
                Line::Entry { key: k, value, .. }
                    if current == Some(section) && k.eq_ignore_ascii_case(key) =>
                {
                    return Some(value);
                }
                _ => {}
            }
        }
        None
    }

    /// Replace a value in place, keeping the key's spelling. Missing keys are
    /// appended to their section, missing sections to the end.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let mut current: Option<String> = None;
        let mut section_end: Option<usize> = None;

        for (idx, line) in self.lines.iter_mut().enumerate() {
            match line {
                Line::Section { name, .. } => current = Some(name.clone()),
                Line::Entry { key: k, value: v, raw } if current.as_deref() == Some(section) => {
                    if k.eq_ignore_ascii_case(key) {
                        *raw = format!("{} = {}", k, value);
                        *v = value.to_string();
                        return;
                    }
                    section_end = Some(idx + 1);
                }
                _ => {}
            }
            if current.as_deref() == Some(section) && section_end.is_none() {
                section_end = Some(idx + 1);
            }
        }

        let entry = Line::Entry {
            key: key.to_string(),
            value: value.to_string(),
            raw: format!("{} = {}", key, value),
        };
        match section_end {
            Some(idx) => self.lines.insert(idx, entry),
            None => {
                if !self.lines.is_empty() {
                    self.lines.push(Line::Other(String::new()));
                }
                self.lines.push(Line::Section {
                    name: section.to_string(),
                    raw: format!("[{}]", section),
                });
                self.lines.push(entry);
            }
        }
    }

    pub fn render(&self) -> String {
        let mut out = self
            .lines
            .iter()
            .map(|line| match line {
                Line::Section { raw, .. } | Line::Entry { raw, .. } | Line::Other(raw) => raw.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        if self.trailing_newline && !out.is_empty() {
            out.push('\n');
        }
        out
    }

    fn config(&self) -> Result<Config, StoreError> {
        let interval = self.require(TELEMETRY_SECTION, SEND_INTERVAL_KEY)?;
        let alert = self.require(TELEMETRY_SECTION, TEMP_ALERT_KEY)?;

        let send_interval_seconds = interval
            .parse::<u64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| StoreError::Malformed {
                section: TELEMETRY_SECTION,
                key: SEND_INTERVAL_KEY,
                value: interval.to_string(),
            })?;
        let temp_alert_threshold = alert
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| StoreError::Malformed {
                section: TELEMETRY_SECTION,
                key: TEMP_ALERT_KEY,
                value: alert.to_string(),
            })?;

        Ok(Config {
            send_interval_seconds,
            temp_alert_threshold,
        })
    }

    fn require(&self, section: &'static str, key: &'static str) -> Result<&str, StoreError> {
        self.get(section, key)
            .ok_or(StoreError::Missing { section, key })
    }
}

/// Whole numbers are written without a fractional part, like the file
/// has always held them.
fn format_threshold(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

// ==============================================================================
// storage backend
// ==============================================================================

/// Where the document lives. Tests swap in failing or counting backends.
pub trait Storage: Send + Sync {
    fn load(&self) -> io::Result<String>;
    fn store(&self, contents: &str) -> io::Result<()>;
    fn describe(&self) -> String;
}

/// The config file on disk. Writes go through a sibling temp file and a rename.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Storage for FileStorage {
    fn load(&self) -> io::Result<String> {
        std::fs::read_to_string(&self.path)
    }

    fn store(&self, contents: &str) -> io::Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// ==============================================================================
// config store
// ==============================================================================

pub struct ConfigStore {
    storage: Box<dyn Storage>,
    /// writer lock; also guards the document so other keys survive writes
    document: Mutex<IniDocument>,
    current: watch::Sender<Config>,
}

impl ConfigStore {
    /// Load and validate the document. A store never exists without a valid Config.
    pub fn open<S: Storage + 'static>(storage: S) -> Result<Self, StoreError> {
        let document = IniDocument::parse(&storage.load()?);
        let config = document.config()?;
        tracing::info!(
            source = %storage.describe(),
            send_interval = config.send_interval_seconds,
            temp_alert = config.temp_alert_threshold,
            "config loaded"
        );
        let (current, _) = watch::channel(config);
        Ok(Self {
            storage: Box::new(storage),
            document: Mutex::new(document),
            current,
        })
    }

    /// Atomic snapshot of the current configuration.
    pub fn get(&self) -> Config {
        *self.current.borrow()
    }

    /// Change notifications; the receiver starts at the current value.
    pub fn subscribe(&self) -> watch::Receiver<Config> {
        self.current.subscribe()
    }

    pub fn connection_string(&self) -> Option<String> {
        self.lock_document()
            .get(DEFAULT_SECTION, CONNECTION_STRING_KEY)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn set_send_interval(&self, seconds: u64) -> Result<Config, StoreError> {
        if seconds == 0 {
            return Err(StoreError::Invalid {
                key: SEND_INTERVAL_KEY,
                reason: "must be a positive number of seconds".into(),
            });
        }
        self.commit(SEND_INTERVAL_KEY, &seconds.to_string(), |c| Config {
            send_interval_seconds: seconds,
            ..c
        })
    }

    pub fn set_temp_alert(&self, threshold: f64) -> Result<Config, StoreError> {
        if !threshold.is_finite() {
            return Err(StoreError::Invalid {
                key: TEMP_ALERT_KEY,
                reason: format!("{} is not a finite number", threshold),
            });
        }
        self.commit(TEMP_ALERT_KEY, &format_threshold(threshold), |c| Config {
            temp_alert_threshold: threshold,
            ..c
        })
    }

    /// Write-then-commit: the document and the published Config only change
    /// after the storage write succeeded.
    fn commit(
        &self,
        key: &'static str,
        value: &str,
        apply: impl FnOnce(Config) -> Config,
    ) -> Result<Config, StoreError> {
        let mut document = self.lock_document();
        let mut next = document.clone();
        next.set(TELEMETRY_SECTION, key, value);

        self.storage.store(&next.render())?;

        *document = next;
        let config = apply(self.get());
        self.current.send_replace(config);
        Ok(config)
    }

    /// Re-read the backing storage after an external edit. Returns whether the
    /// Config changed. Other keys are refreshed either way.
    pub fn reload(&self) -> Result<bool, StoreError> {
        let mut document = self.lock_document();
        let fresh = IniDocument::parse(&self.storage.load()?);
        let config = fresh.config()?;
        *document = fresh;
        Ok(self.current.send_if_modified(|current| {
            if *current == config {
                false
            } else {
                *current = config;
                true
            }
        }))
    }

    fn lock_document(&self) -> std::sync::MutexGuard<'_, IniDocument> {
        // a panic while holding the lock cannot leave a half-written document
        // behind, the clone is only swapped in after a successful store
        self.document.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ==============================================================================
// file watcher
// ==============================================================================

/// Watch the config file's directory and reload the store on external edits.
///
/// The returned watcher must be kept alive for as long as watching should last.
pub fn watch_file(store: Arc<ConfigStore>, path: &Path) -> notify::Result<notify::RecommendedWatcher> {
    use notify::{EventKind, RecursiveMode, Watcher};

    let target = path.file_name().map(|n| n.to_os_string());
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (tx, mut rx) = mpsc::channel::<()>(8);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        let touches_target = event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n.to_os_string()) == target);
        if touches_target {
            // a full channel already has a reload queued
            let _ = tx.try_send(());
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match store.reload() {
                Ok(true) => {
                    let config = store.get();
                    tracing::info!(
                        send_interval = config.send_interval_seconds,
                        temp_alert = config.temp_alert_threshold,
                        "config file edited, new values applied"
                    );
                }
                Ok(false) => tracing::debug!("config file touched, values unchanged"),
                Err(e) => tracing::warn!("ignoring config file edit: {}", e),
            }
        }
    });

    Ok(watcher)
}
