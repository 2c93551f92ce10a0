use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::PayloadConfig;
use crate::error::ConfigError;

/// Where an entry's prompt text comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum PromptSource {
    /// Literal prompt text.
    Inline(String),
    /// Name of a prompt in the prompt library.
    Library(String),
    /// Alternative prompts; one is chosen per batch.
    Alternatives(Vec<String>),
}

impl PromptSource {
    /// Resolve the prompt for the given batch.
    ///
    /// Alternatives rotate by batch index, so batch `n` always receives the
    /// same text for a given entry.
    pub fn resolve(
        &self,
        batch_index: u32,
        library: &HashMap<String, String>,
    ) -> Result<String, ConfigError> {
        match self {
            PromptSource::Inline(text) => Ok(text.clone()),
            PromptSource::Library(name) => library
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownPrompt(name.clone())),
            PromptSource::Alternatives(options) => {
                if options.is_empty() {
                    return Err(ConfigError::invalid(
                        "prompt",
                        "alternatives list is empty",
                    ));
                }
                Ok(options[batch_index as usize % options.len()].clone())
            }
        }
    }
}

/// Output resolution: a named preset or an explicit aspect ratio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Resolution {
    Preset { name: String },
    AspectRatio { width: u32, height: u32 },
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Preset {
            name: "1K".to_string(),
        }
    }
}

/// How long an entry keeps issuing batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum ExecutionMode {
    /// Run exactly `batch_count` batches, successful or not.
    #[serde(rename_all = "camelCase")]
    Fixed { batch_count: u32 },
    /// Run batches until `target_images` images have been produced.
    #[serde(rename_all = "camelCase")]
    Target { target_images: u32 },
}

/// A reference image attached to an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ReferenceImage {
    /// Encoded image bytes held in memory.
    Inline { bytes: Vec<u8> },
    /// An image in the external file store.
    Stored { path: PathBuf },
}

/// One generation intent, as edited by the queue editor.
///
/// The dispatcher never mutates an entry; progress lives in
/// [`EntryProgress`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub prompt: PromptSource,
    pub model: String,
    #[serde(default)]
    pub resolution: Resolution,
    pub images_per_batch: u32,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub references: Vec<ReferenceImage>,
    pub enabled: bool,
    /// Forwarded to the provider untouched.
    #[serde(default)]
    pub ext_params: serde_json::Map<String, serde_json::Value>,
}

impl QueueEntry {
    /// Create an enabled fixed-mode entry (one batch of one image) with a
    /// generated UUID.
    pub fn new(prompt: PromptSource, model: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            group_id: None,
            prompt,
            model: model.into(),
            resolution: Resolution::default(),
            images_per_batch: 1,
            execution_mode: ExecutionMode::Fixed { batch_count: 1 },
            references: Vec::new(),
            enabled: true,
            ext_params: serde_json::Map::new(),
        }
    }

    /// Set a custom ID for this entry (builder pattern).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_images_per_batch(mut self, images: u32) -> Self {
        self.images_per_batch = images;
        self
    }

    pub fn fixed(mut self, batch_count: u32) -> Self {
        self.execution_mode = ExecutionMode::Fixed { batch_count };
        self
    }

    pub fn target(mut self, target_images: u32) -> Self {
        self.execution_mode = ExecutionMode::Target { target_images };
        self
    }

    pub fn with_reference(mut self, reference: ReferenceImage) -> Self {
        self.references.push(reference);
        self
    }

    pub fn with_ext_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.ext_params.insert(key.into(), value);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check the entry against the provider's payload limits.
    pub fn validate(&self, payload: &PayloadConfig) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidEntry {
            entry_id: self.id.clone(),
            reason,
        };

        if self.images_per_batch == 0 {
            return Err(invalid("imagesPerBatch must be >= 1".to_string()));
        }
        match self.execution_mode {
            ExecutionMode::Fixed { batch_count: 0 } => {
                return Err(invalid("batchCount must be >= 1".to_string()));
            }
            ExecutionMode::Target { target_images: 0 } => {
                return Err(invalid("targetImages must be >= 1".to_string()));
            }
            _ => {}
        }
        if self.references.len() > payload.max_reference_images {
            return Err(invalid(format!(
                "{} reference images exceed the limit of {}",
                self.references.len(),
                payload.max_reference_images
            )));
        }
        match &self.prompt {
            PromptSource::Inline(text) if text.trim().is_empty() => {
                Err(invalid("prompt is empty".to_string()))
            }
            PromptSource::Alternatives(options) if options.is_empty() => {
                Err(invalid("prompt alternatives list is empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Ordered, named container of entries. `collapsed` is editor state only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub collapsed: bool,
    pub entries: Vec<QueueEntry>,
}

impl QueueGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            collapsed: false,
            entries: Vec::new(),
        }
    }

    /// Append an entry, stamping it with this group's ID.
    pub fn push(&mut self, entry: QueueEntry) {
        self.entries.push(entry.with_group(self.id.clone()));
    }

    /// Flatten groups into dispatch order: group order, then entry order.
    /// Collapsed groups are included.
    pub fn dispatch_order(groups: &[QueueGroup]) -> Vec<QueueEntry> {
        groups
            .iter()
            .flat_map(|g| g.entries.iter().cloned())
            .collect()
    }
}

/// Dispatcher-side lifecycle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryState {
    Idle,
    Running,
    Completed,
    Paused,
    Halted,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Idle => "idle",
            EntryState::Running => "running",
            EntryState::Completed => "completed",
            EntryState::Paused => "paused",
            EntryState::Halted => "halted",
        }
    }
}

/// Progress counters appended to an entry by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryProgress {
    pub entry_id: String,
    pub state: EntryState,
    pub produced_count: u32,
    pub failed_count: u32,
    /// Batches that reached a final outcome (success or final failure).
    pub batches_attempted: u32,
    pub last_error: Option<String>,
    /// RFC 3339 timestamp of the first transition to `Running`.
    pub started_at: Option<String>,
    /// RFC 3339 timestamp of the transition to `Completed` or `Halted`.
    pub finished_at: Option<String>,
}

impl EntryProgress {
    pub fn new(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            state: EntryState::Idle,
            produced_count: 0,
            failed_count: 0,
            batches_attempted: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A reference image after budgeting, ready to embed in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedReference {
    pub bytes: Vec<u8>,
    /// Whether the bytes were re-encoded to fit the budget.
    pub recompressed: bool,
}

/// One concrete provider call. Built fresh for every attempt.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub job_id: String,
    pub entry_id: String,
    pub batch_index: u32,
    /// Zero for the first try, incremented per retry.
    pub attempt: u32,
    pub prompt: String,
    pub model: String,
    pub resolution: Resolution,
    pub image_count: u32,
    pub references: Vec<PreparedReference>,
    pub ext_params: serde_json::Map<String, serde_json::Value>,
}

impl GenerationJob {
    /// Total bytes of embedded reference images.
    pub fn reference_bytes(&self) -> usize {
        self.references.iter().map(|r| r.bytes.len()).sum()
    }
}

/// One image returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Provider response for one job.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub images: Vec<GeneratedImage>,
    pub status_code: u16,
}

impl GenerationResponse {
    pub fn ok(images: Vec<GeneratedImage>) -> Self {
        Self {
            images,
            status_code: 200,
        }
    }
}

/// Final state of every entry after [`Dispatcher::run`](crate::Dispatcher::run).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub entries: Vec<EntryProgress>,
    pub produced: u32,
    pub failed: u32,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl DispatchSummary {
    pub fn entry(&self, entry_id: &str) -> Option<&EntryProgress> {
        self.entries.iter().find(|e| e.entry_id == entry_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternatives_rotate_per_batch() {
        let prompt = PromptSource::Alternatives(vec!["a".into(), "b".into(), "c".into()]);
        let lib = HashMap::new();
        let picks: Vec<String> = (0..5).map(|i| prompt.resolve(i, &lib).unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b"]);
    }

    #[test]
    fn test_library_prompt_lookup() {
        let mut lib = HashMap::new();
        lib.insert("castle".to_string(), "a castle at dusk".to_string());

        let found = PromptSource::Library("castle".into()).resolve(0, &lib).unwrap();
        assert_eq!(found, "a castle at dusk");

        let missing = PromptSource::Library("forest".into()).resolve(0, &lib);
        assert!(matches!(missing, Err(ConfigError::UnknownPrompt(name)) if name == "forest"));
    }

    #[test]
    fn test_new_entry_defaults() {
        let entry = QueueEntry::new(PromptSource::Inline("cat".into()), "model-a");
        assert!(!entry.id.is_empty());
        assert!(entry.enabled);
        assert_eq!(entry.images_per_batch, 1);
        assert_eq!(entry.execution_mode, ExecutionMode::Fixed { batch_count: 1 });
    }

    #[test]
    fn test_validate_rejects_too_many_references() {
        let payload = PayloadConfig {
            max_reference_images: 1,
            ..PayloadConfig::default()
        };
        let entry = QueueEntry::new(PromptSource::Inline("cat".into()), "m")
            .with_reference(ReferenceImage::Inline { bytes: vec![1] })
            .with_reference(ReferenceImage::Inline { bytes: vec![2] });

        assert!(matches!(
            entry.validate(&payload),
            Err(ConfigError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_counts() {
        let payload = PayloadConfig::default();
        let base = QueueEntry::new(PromptSource::Inline("cat".into()), "m");

        assert!(base.clone().with_images_per_batch(0).validate(&payload).is_err());
        assert!(base.clone().fixed(0).validate(&payload).is_err());
        assert!(base.clone().target(0).validate(&payload).is_err());
        assert!(base.target(4).validate(&payload).is_ok());
    }

    #[test]
    fn test_dispatch_order_includes_collapsed_groups() {
        let mut first = QueueGroup::new("first");
        first.collapsed = true;
        first.push(QueueEntry::new(PromptSource::Inline("a".into()), "m").with_id("a"));
        first.push(QueueEntry::new(PromptSource::Inline("b".into()), "m").with_id("b"));

        let mut second = QueueGroup::new("second");
        second.push(QueueEntry::new(PromptSource::Inline("c".into()), "m").with_id("c"));

        let order = QueueGroup::dispatch_order(&[first.clone(), second]);
        let ids: Vec<&str> = order.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(order[0].group_id.as_deref(), Some(first.id.as_str()));
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let entry = QueueEntry::new(PromptSource::Inline("cat".into()), "m")
            .with_id("e1")
            .target(10);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["imagesPerBatch"], 1);
        assert_eq!(json["executionMode"]["mode"], "target");
        assert_eq!(json["executionMode"]["targetImages"], 10);

        let back: QueueEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
