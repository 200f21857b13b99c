//! Sources of new ingest items.
//!
//! The batch runner asks every registered [`Ingestor`] to enqueue new
//! records at the start of each tick. [`InboxIngestor`] picks up JSON
//! envelopes dropped into a directory:
//!
//! ```json
//! { "type": "event", "target_type": "local_event", "payload": { "name": "..." } }
//! ```
//!
//! A bare JSON object without a `payload` key is treated as a place
//! payload. Processed files are renamed to `<name>.done`; files that cannot
//! be parsed are renamed to `<name>.failed` so later ticks skip them.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::models::{ItemId, ItemKind, TargetType};
use crate::store::{payload_hash, RecordStore};

#[async_trait]
pub trait Ingestor: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue any new records. Returns how many items were created.
    async fn enqueue(&self, store: &dyn RecordStore) -> Result<usize>;
}

/// A record ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: ItemKind,
    pub target: TargetType,
    pub payload: Value,
}

impl Envelope {
    /// Parse an envelope, or a bare payload object.
    pub fn parse(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            bail!("envelope must be a JSON object");
        };

        if !obj.contains_key("payload") {
            if obj.is_empty() {
                bail!("payload is empty");
            }
            return Ok(Self {
                kind: ItemKind::Place,
                target: ItemKind::Place.default_target(),
                payload: Value::Object(obj),
            });
        }

        let kind = match obj.get("type").and_then(|t| t.as_str()) {
            Some(t) => t.parse::<ItemKind>()?,
            None => ItemKind::Place,
        };
        let target = match obj.get("target_type").and_then(|t| t.as_str()) {
            Some(t) => t.parse::<TargetType>()?,
            None => kind.default_target(),
        };
        let payload = obj.remove("payload").unwrap_or(Value::Null);
        match &payload {
            Value::Object(p) if !p.is_empty() => {}
            _ => bail!("payload must be a non-empty JSON object"),
        }
        Ok(Self {
            kind,
            target,
            payload,
        })
    }

    pub fn with_overrides(mut self, kind: Option<ItemKind>, target: Option<TargetType>) -> Self {
        if let Some(kind) = kind {
            self.kind = kind;
            self.target = kind.default_target();
        }
        if let Some(target) = target {
            self.target = target;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Created(ItemId),
    /// An item with the same payload already exists.
    Duplicate(ItemId),
}

/// Store `envelope` unless an identical payload was already enqueued.
pub async fn enqueue_envelope(store: &dyn RecordStore, envelope: &Envelope) -> Result<Enqueued> {
    if let Some(existing) = store
        .find_by_payload_hash(&payload_hash(&envelope.payload))
        .await
    {
        return Ok(Enqueued::Duplicate(existing));
    }
    match store
        .create(&envelope.payload, envelope.kind, envelope.target)
        .await
    {
        Some(id) => Ok(Enqueued::Created(id)),
        None => bail!("failed to store item"),
    }
}

/// Reads JSON envelopes from a directory.
pub struct InboxIngestor {
    root: PathBuf,
    include_set: GlobSet,
    exclude_set: GlobSet,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

impl InboxIngestor {
    pub fn new(root: impl Into<PathBuf>, include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            include_set: build_globset(include)?,
            exclude_set: build_globset(exclude)?,
        })
    }

    pub fn from_config(config: &IngestConfig) -> Result<Option<Self>> {
        config
            .inbox
            .as_ref()
            .map(|root| Self::new(root, &config.include_globs, &config.exclude_globs))
            .transpose()
    }

    /// Matching files, sorted by relative path.
    fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if self.exclude_set.is_match(&rel_str) || !self.include_set.is_match(&rel_str) {
                continue;
            }
            files.push(path.to_path_buf());
        }
        files.sort();
        Ok(files)
    }
}

fn read_envelope(path: &Path) -> Result<Envelope> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    Envelope::parse(value).with_context(|| format!("Invalid envelope in {}", path.display()))
}

fn mark_done(path: &Path) -> Result<()> {
    rename_with_suffix(path, ".done")
}

fn mark_failed(path: &Path) -> Result<()> {
    rename_with_suffix(path, ".failed")
}

fn rename_with_suffix(path: &Path, suffix: &str) -> Result<()> {
    let mut renamed = path.as_os_str().to_owned();
    renamed.push(suffix);
    std::fs::rename(path, &renamed)
        .with_context(|| format!("Failed to rename {}", path.display()))
}

#[async_trait]
impl Ingestor for InboxIngestor {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn enqueue(&self, store: &dyn RecordStore) -> Result<usize> {
        if !self.root.exists() {
            bail!("Inbox directory does not exist: {}", self.root.display());
        }

        let mut created = 0;
        for path in self.pending_files()? {
            let envelope = match read_envelope(&path) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(
                        file = %path.display(),
                        error = %format!("{:#}", e),
                        "unparseable inbox file; renaming to .failed"
                    );
                    mark_failed(&path)?;
                    continue;
                }
            };
            match enqueue_envelope(store, &envelope).await? {
                Enqueued::Created(id) => {
                    tracing::info!(item_id = id, file = %path.display(), "enqueued");
                    created += 1;
                }
                Enqueued::Duplicate(id) => {
                    tracing::debug!(item_id = id, file = %path.display(), "duplicate payload");
                }
            }
            mark_done(&path)?;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemFilter, Stage};
    use crate::store::memory::InMemoryStore;
    use serde_json::json;

    #[test]
    fn bare_object_is_a_place() {
        let e = Envelope::parse(json!({"name": "Fog Bar"})).unwrap();
        assert_eq!(e.kind, ItemKind::Place);
        assert_eq!(e.target, TargetType::LocalPlace);
    }

    #[test]
    fn envelope_fields_are_validated() {
        let e = Envelope::parse(json!({"type": "event", "payload": {"name": "Fair"}})).unwrap();
        assert_eq!(e.target, TargetType::LocalEvent);

        assert!(Envelope::parse(json!({"type": "concert", "payload": {"a": 1}})).is_err());
        assert!(Envelope::parse(json!({"payload": {}})).is_err());
        assert!(Envelope::parse(json!([1])).is_err());
    }

    #[tokio::test]
    async fn inbox_enqueues_once_and_marks_done() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"name": "Fog Bar"}"#).unwrap();
        std::fs::create_dir(dir.path().join("events")).unwrap();
        std::fs::write(
            dir.path().join("events/b.json"),
            r#"{"type": "event", "payload": {"name": "Fair"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("dup.json"), r#"{"name": "Fog Bar"}"#).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let inbox = InboxIngestor::new(dir.path(), &["**/*.json".to_string()], &[]).unwrap();
        let store = InMemoryStore::new();
        assert_eq!(inbox.enqueue(&store).await.unwrap(), 2);

        assert!(dir.path().join("a.json.done").exists());
        assert!(dir.path().join("dup.json.done").exists());
        assert!(dir.path().join("broken.json.failed").exists());
        assert!(!dir.path().join("broken.json").exists());
        assert_eq!(store.select(&ItemFilter::stages(&[Stage::New])).await.len(), 2);

        // Second pass finds nothing new.
        assert_eq!(inbox.enqueue(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_envelope_is_set_aside_once() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            r#"{"type": "concert", "payload": {"name": "Gig"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("good.json"), r#"{"name": "Tide Pool"}"#).unwrap();

        let inbox = InboxIngestor::new(dir.path(), &["**/*.json".to_string()], &[]).unwrap();
        let store = InMemoryStore::new();
        assert_eq!(inbox.enqueue(&store).await.unwrap(), 1);
        assert!(dir.path().join("bad.json.failed").exists());
        assert!(dir.path().join("good.json.done").exists());

        assert!(inbox.pending_files().unwrap().is_empty());
    }
}
