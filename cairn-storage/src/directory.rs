//! Directory-backed log driver.
//!
//! Each record is one file below a root directory, laid out by the main
//! path pattern:
//!
//! ```text
//! <root>/entities/providers/svc1.yml
//! <root>/overrides/providers/svc1/tls.verify.yml
//! <root>/defaults/providers/_type.yml
//! ```
//!
//! The directory holds the compacted log: appending merges the new payload
//! into the record's file, so replaying one file per record materializes the
//! same state as replaying every write.

use crate::encoding::format;
use crate::path_pattern::PathPatterns;
use async_trait::async_trait;
use cairn_core::{
    merge_patch, EventType, Format, Identifier, LogError, MutationEvent, StoreConfig, StoreResult,
};
use cairn_events::LogDriver;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const TEMP_SUFFIX: &str = ".tmp";

fn io_error(location: &Path, e: std::io::Error) -> LogError {
    LogError::Io {
        location: location.display().to_string(),
        reason: e.to_string(),
    }
}

/// Log driver persisting records as files below a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryLogDriver {
    root: PathBuf,
    patterns: PathPatterns,
}

impl DirectoryLogDriver {
    pub fn new(root: impl Into<PathBuf>, patterns: PathPatterns) -> Self {
        Self {
            root: root.into(),
            patterns,
        }
    }

    /// Driver rooted at `config.root` using the configured patterns.
    ///
    /// # Errors
    ///
    /// Returns [`cairn_core::ConfigError::MissingRequired`] without a root and
    /// [`cairn_core::PatternError`] for an invalid template.
    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        let Some(root) = config.root.clone() else {
            return Err(cairn_core::ConfigError::MissingRequired {
                field: "root".to_string(),
            }
            .into());
        };
        Ok(Self::new(root, PathPatterns::from_config(config)?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn patterns(&self) -> &PathPatterns {
        &self.patterns
    }

    /// Files below the root as `/`-separated relative locations, sorted.
    async fn walk(&self) -> Result<Vec<String>, LogError> {
        let mut locations = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&dir, e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| io_error(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') || name.ends_with(TEMP_SUFFIX) {
                    continue;
                }
                if let Some(location) = self.relative(&path) {
                    locations.push(location);
                }
            }
        }
        locations.sort();
        Ok(locations)
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Option<Vec<&str>> = relative.iter().map(|s| s.to_str()).collect();
        Some(segments?.join("/"))
    }

    /// Read a file, `None` if it does not exist.
    async fn read(&self, location: &str) -> Result<Option<Vec<u8>>, LogError> {
        let path = self.root.join(location);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// The record's current content under any candidate location.
    async fn current(
        &self,
        event_type: &EventType,
        identifier: &Identifier,
    ) -> Result<Option<Value>, LogError> {
        for location in self.patterns.all_paths(event_type, identifier) {
            let Some(bytes) = self.read(&location).await? else {
                continue;
            };
            let format = location
                .rsplit_once('.')
                .and_then(|(_, ext)| Format::from_extension(ext))
                .unwrap_or(Format::LEGACY);
            match format::parse(format, identifier, &bytes) {
                Ok(doc) => return Ok(Some(doc)),
                Err(e) => {
                    warn!(location = %location, error = %e, "Replacing unreadable record");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    async fn write_atomic(&self, location: &str, bytes: &[u8]) -> Result<(), LogError> {
        let path = self.root.join(location);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = path.with_file_name(format!(".{}{}", file_name, TEMP_SUFFIX));
        fs::write(&temp, bytes).await.map_err(|e| io_error(&temp, e))?;
        fs::rename(&temp, &path).await.map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    /// Remove every candidate location except `keep`.
    async fn remove_others(
        &self,
        event_type: &EventType,
        identifier: &Identifier,
        keep: Option<&str>,
    ) -> Result<(), LogError> {
        for location in self.patterns.all_paths(event_type, identifier) {
            if Some(location.as_str()) == keep {
                continue;
            }
            let path = self.root.join(&location);
            match fs::remove_file(&path).await {
                Ok(()) => debug!(location = %location, "Removed record file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&path, e)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LogDriver for DirectoryLogDriver {
    async fn start(&self) -> StoreResult<()> {
        debug!(root = %self.root.display(), "Starting directory log driver");
        Ok(())
    }

    async fn replay(&self) -> StoreResult<Vec<MutationEvent>> {
        let mut events = Vec::new();
        for location in self.walk().await? {
            let Some(parsed) = self.patterns.parse(&location) else {
                warn!(location = %location, "Skipping file outside every path pattern");
                continue;
            };
            let Some(bytes) = self.read(&location).await? else {
                continue;
            };
            events.push(MutationEvent::write(
                parsed.event_type,
                parsed.identifier,
                bytes,
                parsed.format,
            ));
        }
        debug!(root = %self.root.display(), records = events.len(), "Replayed directory log");
        Ok(events)
    }

    async fn append(&self, event: &MutationEvent) -> StoreResult<()> {
        let Some(payload) = event.payload.as_deref() else {
            return Err(LogError::Io {
                location: self.patterns.to_path(&event.event_type, &event.identifier, event.format),
                reason: "write event without payload".to_string(),
            }
            .into());
        };
        // A file holds the merged document, so a payload that does not parse
        // cannot be stored at all.
        let incoming = format::parse(event.format, &event.identifier, payload).map_err(|e| {
            warn!(identifier = %event.identifier, error = %e, "Rejecting unreadable payload");
            LogError::Rejected {
                event_type: event.event_type.clone(),
                identifier: event.identifier.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut merged = self
            .current(&event.event_type, &event.identifier)
            .await?
            .unwrap_or(Value::Null);
        merge_patch(&mut merged, &incoming);

        let location = self
            .patterns
            .to_path(&event.event_type, &event.identifier, event.format);
        let bytes = format::render(event.format, &merged)?;
        self.write_atomic(&location, &bytes).await?;
        self.remove_others(&event.event_type, &event.identifier, Some(&location))
            .await?;
        debug!(location = %location, "Appended record");
        Ok(())
    }

    async fn delete(
        &self,
        event_type: &EventType,
        identifier: &Identifier,
        _format: Format,
    ) -> StoreResult<()> {
        self.remove_others(event_type, identifier, None).await?;
        Ok(())
    }
}
