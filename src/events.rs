use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::types::{DispatchSummary, EntryProgress, EntryState, GeneratedImage};

/// Emitted whenever an entry's state or counters change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryProgressEvent {
    pub entry_id: String,
    pub state: EntryState,
    pub produced_count: u32,
    pub failed_count: u32,
    pub batches_attempted: u32,
    pub last_error: Option<String>,
}

impl From<&EntryProgress> for EntryProgressEvent {
    fn from(progress: &EntryProgress) -> Self {
        Self {
            entry_id: progress.entry_id.clone(),
            state: progress.state,
            produced_count: progress.produced_count,
            failed_count: progress.failed_count,
            batches_attempted: progress.batches_attempted,
            last_error: progress.last_error.clone(),
        }
    }
}

/// Emitted when a batch succeeds. The image store persists `images`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesProducedEvent {
    pub entry_id: String,
    pub batch: u32,
    pub images: Vec<GeneratedImage>,
}

/// Emitted when a reference needed more compression attempts than the
/// configured threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeavyCompressionEvent {
    pub entry_id: String,
    pub batch: u32,
    pub attempts_used: u32,
    pub final_quality: u8,
    pub final_dimension: u32,
}

/// Emitted once when a run returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFinishedEvent {
    pub summary: DispatchSummary,
}

/// Everything the dispatcher reports to its progress channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "payload")]
pub enum DispatchEvent {
    EntryProgress(EntryProgressEvent),
    ImagesProduced(ImagesProducedEvent),
    HeavyCompression(HeavyCompressionEvent),
    RunFinished(RunFinishedEvent),
}

impl DispatchEvent {
    /// Event name in the `dispatch:<name>` style used by UI bridges.
    pub fn name(&self) -> &'static str {
        match self {
            DispatchEvent::EntryProgress(_) => "dispatch:entry_progress",
            DispatchEvent::ImagesProduced(_) => "dispatch:images_produced",
            DispatchEvent::HeavyCompression(_) => "dispatch:heavy_compression",
            DispatchEvent::RunFinished(_) => "dispatch:run_finished",
        }
    }
}

/// Optional progress channel. Sending never fails the run: a dropped
/// receiver just stops observing.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<UnboundedSender<DispatchEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: Option<UnboundedSender<DispatchEvent>>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: DispatchEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("progress receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_tagged() {
        let mut progress = EntryProgress::new("e1");
        progress.state = EntryState::Running;
        progress.produced_count = 4;

        let event = DispatchEvent::EntryProgress(EntryProgressEvent::from(&progress));
        assert_eq!(event.name(), "dispatch:entry_progress");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "entryProgress");
        assert_eq!(json["payload"]["entryId"], "e1");
        assert_eq!(json["payload"]["state"], "running");
        assert_eq!(json["payload"]["producedCount"], 4);
    }
}
