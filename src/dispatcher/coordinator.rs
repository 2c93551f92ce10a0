//! Single owner of all per-entry state during a run.
//!
//! Workers and retry timers report back over one channel; the coordinator
//! applies every counter and state change itself, then publishes a copy to
//! the shared snapshot read by [`DispatchHandle`](super::DispatchHandle).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::budget::PayloadBudgeter;
use crate::config::{PayloadConfig, TargetLimitsConfig};
use crate::error::{ConfigError, DispatchError};
use crate::events::{DispatchEvent, EntryProgressEvent, EventSink, ImagesProducedEvent};
use crate::failure::FailureTracker;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::types::{
    DispatchSummary, EntryProgress, EntryState, ExecutionMode, GeneratedImage, QueueEntry,
};

/// One batch on its way to a worker.
#[derive(Debug)]
pub(crate) struct WorkItem {
    pub entry: Arc<QueueEntry>,
    pub batch_index: u32,
    pub attempt: u32,
    /// The entry's token at issue time. Pausing or halting cancels it.
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Produced {
        entry_id: String,
        batch_index: u32,
        images: Vec<GeneratedImage>,
    },
    Failed {
        item: WorkItem,
        error: DispatchError,
    },
    Cancelled {
        entry_id: String,
    },
}

#[derive(Debug)]
pub(crate) enum CoordinatorEvent {
    Finished(Outcome),
    RetryDue(WorkItem),
    RetryAbandoned { entry_id: String },
}

#[derive(Debug)]
pub(crate) enum Control {
    Pause(String),
    Resume(String),
    CancelAll,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

struct EntryRuntime {
    entry: Arc<QueueEntry>,
    progress: EntryProgress,
    tracker: FailureTracker,
    /// Batches issued whose final outcome is not known yet: queued,
    /// executing, or waiting out a retry backoff.
    outstanding: u32,
    next_batch: u32,
    cancel: CancellationToken,
    running_since: Option<Instant>,
}

impl EntryRuntime {
    fn new(entry: QueueEntry, threshold: u32, cancel: CancellationToken) -> Self {
        Self {
            progress: EntryProgress::new(entry.id.clone()),
            entry: Arc::new(entry),
            tracker: FailureTracker::new(threshold),
            outstanding: 0,
            next_batch: 0,
            cancel,
            running_since: None,
        }
    }

    fn state(&self) -> EntryState {
        self.progress.state
    }

    fn start(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
        self.tracker.reset();
        self.progress.state = EntryState::Running;
        self.progress.finished_at = None;
        if self.progress.started_at.is_none() {
            self.progress.started_at = Some(now_rfc3339());
        }
        self.running_since = Some(Instant::now());
    }

    fn halt(&mut self, error: String) {
        self.cancel.cancel();
        self.progress.state = EntryState::Halted;
        self.progress.last_error = Some(error);
        self.progress.finished_at = Some(now_rfc3339());
    }

    fn complete(&mut self) {
        self.progress.state = EntryState::Completed;
        self.progress.finished_at = Some(now_rfc3339());
    }

    fn issued(&self) -> u32 {
        self.progress.batches_attempted + self.outstanding
    }

    /// Reason a target-mode entry may not issue more batches.
    fn limit_reached(&self, limits: &TargetLimitsConfig) -> Option<String> {
        if let Some(max) = limits.max_total_batches {
            if self.issued() >= max {
                return Some(format!("target not reached within {} batches", max));
            }
        }
        if let (Some(max_ms), Some(since)) = (limits.max_wall_clock_ms, self.running_since) {
            if since.elapsed() >= Duration::from_millis(max_ms) {
                return Some(format!("target not reached within {} ms", max_ms));
            }
        }
        None
    }

    fn wants_batch(&self, limits: &TargetLimitsConfig) -> bool {
        if self.state() != EntryState::Running {
            return false;
        }
        match self.entry.execution_mode {
            ExecutionMode::Fixed { batch_count } => self.issued() < batch_count,
            ExecutionMode::Target { target_images } => {
                let expected = self.progress.produced_count
                    + self.outstanding * self.entry.images_per_batch;
                expected < target_images && self.limit_reached(limits).is_none()
            }
        }
    }

    /// Move a running entry with nothing outstanding to its end state.
    fn settle(&mut self, limits: &TargetLimitsConfig) -> bool {
        if self.state() != EntryState::Running || self.outstanding > 0 {
            return false;
        }
        match self.entry.execution_mode {
            ExecutionMode::Fixed { batch_count } => {
                if self.progress.batches_attempted >= batch_count {
                    self.complete();
                    return true;
                }
            }
            ExecutionMode::Target { target_images } => {
                if self.progress.produced_count >= target_images {
                    self.complete();
                    return true;
                }
                if let Some(reason) = self.limit_reached(limits) {
                    self.halt(reason);
                    return true;
                }
            }
        }
        false
    }

    fn release(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }
}

pub(crate) struct RunSetup {
    pub max_concurrent: usize,
    pub failure_threshold: u32,
    pub payload: PayloadConfig,
    pub limits: TargetLimitsConfig,
    pub retry: RetryPolicy,
    pub prompts: Arc<HashMap<String, String>>,
    pub run_token: CancellationToken,
    pub work_tx: UnboundedSender<WorkItem>,
    pub events_tx: UnboundedSender<CoordinatorEvent>,
    pub sink: EventSink,
    pub shared: Arc<Mutex<Vec<EntryProgress>>>,
}

pub(crate) struct Coordinator {
    entries: Vec<EntryRuntime>,
    index: HashMap<String, usize>,
    cursor: usize,
    /// Items handed to the worker pool and not yet reported back.
    dispatched: usize,
    pending_retries: VecDeque<WorkItem>,
    cancelled: bool,
    setup: RunSetup,
}

impl Coordinator {
    pub(crate) fn new(entries: Vec<QueueEntry>, setup: RunSetup) -> Self {
        let mut runtimes = Vec::with_capacity(entries.len());
        let mut index = HashMap::new();

        for entry in entries {
            let mut runtime = EntryRuntime::new(
                entry,
                setup.failure_threshold,
                setup.run_token.child_token(),
            );
            let id = runtime.entry.id.clone();

            if index.contains_key(&id) {
                let err = ConfigError::InvalidEntry {
                    entry_id: id,
                    reason: "duplicate entry id".to_string(),
                };
                runtime.halt(err.to_string());
            } else {
                index.insert(id, runtimes.len());
                if runtime.entry.enabled {
                    match check_entry(&runtime.entry, &setup.payload, &setup.prompts) {
                        Ok(()) => runtime.start(setup.run_token.child_token()),
                        Err(e) => {
                            tracing::warn!(entry_id = %runtime.entry.id, error = %e, "entry rejected");
                            runtime.halt(e.to_string());
                        }
                    }
                }
            }
            runtimes.push(runtime);
        }

        let coordinator = Self {
            entries: runtimes,
            index,
            cursor: 0,
            dispatched: 0,
            pending_retries: VecDeque::new(),
            cancelled: false,
            setup,
        };
        coordinator.publish_all();
        coordinator
    }

    fn publish_all(&self) {
        {
            let mut shared = self.setup.shared.lock().unwrap_or_else(|e| e.into_inner());
            *shared = self.entries.iter().map(|rt| rt.progress.clone()).collect();
        }
        for rt in &self.entries {
            self.setup
                .sink
                .emit(DispatchEvent::EntryProgress(EntryProgressEvent::from(&rt.progress)));
        }
    }

    fn publish(&self, idx: usize) {
        let progress = &self.entries[idx].progress;
        {
            let mut shared = self.setup.shared.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = shared.get_mut(idx) {
                *slot = progress.clone();
            }
        }
        self.setup
            .sink
            .emit(DispatchEvent::EntryProgress(EntryProgressEvent::from(progress)));
    }

    /// True once nothing is outstanding and no entry can make progress
    /// without outside help.
    pub(crate) fn is_done(&self) -> bool {
        self.dispatched == 0
            && self.pending_retries.is_empty()
            && self.entries.iter().all(|rt| {
                rt.outstanding == 0
                    && rt.state() != EntryState::Running
                    && (self.cancelled || rt.state() != EntryState::Paused)
            })
    }

    /// Hand out work until the pool is saturated, then settle finished
    /// entries.
    pub(crate) fn fill(&mut self) {
        self.prune_pending();

        if !self.cancelled {
            while self.dispatched < self.setup.max_concurrent {
                let item = match self.pending_retries.pop_front() {
                    Some(item) => item,
                    None => match self.issue_next() {
                        Some(item) => item,
                        None => break,
                    },
                };
                self.dispatch(item);
            }
        }

        for idx in 0..self.entries.len() {
            if self.entries[idx].settle(&self.setup.limits) {
                let rt = &self.entries[idx];
                match rt.state() {
                    EntryState::Completed => tracing::info!(
                        entry_id = %rt.entry.id,
                        produced = rt.progress.produced_count,
                        failed = rt.progress.failed_count,
                        "entry completed"
                    ),
                    _ => tracing::warn!(
                        entry_id = %rt.entry.id,
                        error = rt.progress.last_error.as_deref().unwrap_or_default(),
                        "entry halted"
                    ),
                }
                self.publish(idx);
            }
        }
    }

    /// Drop queued retries whose entry was paused, halted or cancelled; the
    /// batch is handed back so a resumed entry re-issues it.
    fn prune_pending(&mut self) {
        let (keep, dropped): (VecDeque<_>, VecDeque<_>) = self
            .pending_retries
            .drain(..)
            .partition(|item| !item.cancel.is_cancelled());
        self.pending_retries = keep;
        for item in dropped {
            self.release_entry(&item.entry.id);
        }
    }

    fn issue_next(&mut self) -> Option<WorkItem> {
        let count = self.entries.len();
        for step in 0..count {
            let idx = (self.cursor + step) % count;
            if !self.entries[idx].wants_batch(&self.setup.limits) {
                continue;
            }
            self.cursor = (idx + 1) % count;

            let rt = &mut self.entries[idx];
            rt.outstanding += 1;
            let batch_index = rt.next_batch;
            rt.next_batch += 1;
            return Some(WorkItem {
                entry: Arc::clone(&rt.entry),
                batch_index,
                attempt: 0,
                cancel: rt.cancel.clone(),
            });
        }
        None
    }

    fn dispatch(&mut self, item: WorkItem) {
        tracing::trace!(
            entry_id = %item.entry.id,
            batch = item.batch_index,
            attempt = item.attempt,
            "batch dispatched"
        );
        self.dispatched += 1;
        if let Err(returned) = self.setup.work_tx.send(item) {
            self.dispatched -= 1;
            let item = returned.0;
            tracing::error!(entry_id = %item.entry.id, "worker pool stopped");
            if let Some(&idx) = self.index.get(&item.entry.id) {
                self.entries[idx].release();
                self.entries[idx].halt("worker pool stopped".to_string());
                self.publish(idx);
            }
        }
    }

    fn release_entry(&mut self, entry_id: &str) {
        if let Some(&idx) = self.index.get(entry_id) {
            self.entries[idx].release();
        }
    }

    pub(crate) fn handle_event(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Finished(outcome) => {
                self.dispatched = self.dispatched.saturating_sub(1);
                match outcome {
                    Outcome::Produced {
                        entry_id,
                        batch_index,
                        images,
                    } => self.on_produced(&entry_id, batch_index, images),
                    Outcome::Failed { item, error } => self.on_failed(item, error),
                    Outcome::Cancelled { entry_id } => {
                        tracing::debug!(entry_id = %entry_id, "batch cancelled");
                        self.release_entry(&entry_id);
                    }
                }
            }
            CoordinatorEvent::RetryDue(item) => {
                let running = self
                    .index
                    .get(&item.entry.id)
                    .map(|&idx| self.entries[idx].state() == EntryState::Running)
                    .unwrap_or(false);
                if running && !item.cancel.is_cancelled() && !self.cancelled {
                    self.pending_retries.push_back(item);
                } else {
                    self.release_entry(&item.entry.id);
                }
            }
            CoordinatorEvent::RetryAbandoned { entry_id } => self.release_entry(&entry_id),
        }
    }

    fn on_produced(&mut self, entry_id: &str, batch_index: u32, images: Vec<GeneratedImage>) {
        let Some(&idx) = self.index.get(entry_id) else {
            return;
        };
        let rt = &mut self.entries[idx];
        rt.release();
        rt.progress.batches_attempted += 1;
        rt.progress.produced_count += images.len() as u32;
        rt.tracker.record_success();

        tracing::debug!(
            entry_id = %entry_id,
            batch = batch_index,
            images = images.len(),
            produced = rt.progress.produced_count,
            "batch succeeded"
        );
        self.setup
            .sink
            .emit(DispatchEvent::ImagesProduced(ImagesProducedEvent {
                entry_id: entry_id.to_string(),
                batch: batch_index,
                images,
            }));
        self.publish(idx);
    }

    fn on_failed(&mut self, item: WorkItem, error: DispatchError) {
        let Some(&idx) = self.index.get(&item.entry.id) else {
            return;
        };

        if let RetryDecision::Retry { after } = self.setup.retry.decide(&error, item.attempt) {
            let state = self.entries[idx].state();
            let running =
                state == EntryState::Running && !item.cancel.is_cancelled() && !self.cancelled;
            if running {
                tracing::warn!(
                    entry_id = %item.entry.id,
                    batch = item.batch_index,
                    attempt = item.attempt,
                    backoff_ms = after.as_millis() as u64,
                    error = %error,
                    "batch failed, retrying"
                );
                self.schedule_retry(item, after);
                return;
            }
            if state != EntryState::Halted || self.cancelled {
                // Retryable, but the entry is paused; the batch is re-issued on resume.
                self.entries[idx].release();
                return;
            }
            // A halted entry never retries, so the in-flight batch fails here.
        }

        let rt = &mut self.entries[idx];
        rt.release();
        rt.progress.batches_attempted += 1;
        rt.progress.failed_count += rt.entry.images_per_batch;
        // A halted entry keeps the error that halted it.
        if rt.state() != EntryState::Halted {
            rt.progress.last_error = Some(error.to_string());
        }
        let tripped = rt.tracker.record_failure();

        tracing::warn!(
            entry_id = %item.entry.id,
            batch = item.batch_index,
            attempt = item.attempt,
            error = %error,
            "batch failed"
        );

        if matches!(rt.state(), EntryState::Running | EntryState::Paused) {
            if error.is_configuration() {
                rt.halt(error.to_string());
            } else if tripped {
                tracing::error!(
                    entry_id = %item.entry.id,
                    consecutive_failures = rt.tracker.consecutive_failures(),
                    "circuit breaker tripped, halting entry"
                );
                rt.halt(error.to_string());
            }
        }
        self.publish(idx);
    }

    fn schedule_retry(&self, mut item: WorkItem, after: Duration) {
        item.attempt += 1;
        let tx = self.setup.events_tx.clone();
        let token = item.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = tx.send(CoordinatorEvent::RetryAbandoned {
                        entry_id: item.entry.id.clone(),
                    });
                }
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send(CoordinatorEvent::RetryDue(item));
                }
            }
        });
    }

    pub(crate) fn handle_control(&mut self, control: Control) {
        match control {
            Control::Pause(entry_id) => self.pause(&entry_id),
            Control::Resume(entry_id) => self.resume(&entry_id),
            Control::CancelAll => self.cancel_all(),
        }
    }

    fn pause(&mut self, entry_id: &str) {
        let Some(&idx) = self.index.get(entry_id) else {
            tracing::warn!(entry_id = %entry_id, "pause requested for unknown entry");
            return;
        };
        let rt = &mut self.entries[idx];
        if rt.state() != EntryState::Running {
            tracing::debug!(entry_id = %entry_id, state = rt.state().as_str(), "pause ignored");
            return;
        }
        rt.cancel.cancel();
        rt.progress.state = EntryState::Paused;
        tracing::info!(entry_id = %entry_id, in_flight = rt.outstanding, "entry paused");
        self.publish(idx);
    }

    fn resume(&mut self, entry_id: &str) {
        if self.cancelled {
            tracing::warn!(entry_id = %entry_id, "run cancelled, resume ignored");
            return;
        }
        let Some(&idx) = self.index.get(entry_id) else {
            tracing::warn!(entry_id = %entry_id, "resume requested for unknown entry");
            return;
        };

        let token = self.setup.run_token.child_token();
        let checked = check_entry(
            &self.entries[idx].entry,
            &self.setup.payload,
            &self.setup.prompts,
        );
        let rt = &mut self.entries[idx];
        if !matches!(
            rt.state(),
            EntryState::Paused | EntryState::Halted | EntryState::Idle
        ) {
            tracing::debug!(entry_id = %entry_id, state = rt.state().as_str(), "resume ignored");
            return;
        }

        match checked {
            Ok(()) => {
                rt.start(token);
                tracing::info!(entry_id = %entry_id, "entry resumed");
            }
            Err(e) => rt.halt(e.to_string()),
        }
        self.publish(idx);
    }

    fn cancel_all(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.setup.run_token.cancel();
        tracing::info!("dispatch cancelled");

        for idx in 0..self.entries.len() {
            if self.entries[idx].state() == EntryState::Running {
                self.entries[idx].progress.state = EntryState::Paused;
                self.publish(idx);
            }
        }
    }

    pub(crate) fn summary(&self, duration: Duration) -> DispatchSummary {
        let entries: Vec<EntryProgress> =
            self.entries.iter().map(|rt| rt.progress.clone()).collect();
        DispatchSummary {
            produced: entries.iter().map(|p| p.produced_count).sum(),
            failed: entries.iter().map(|p| p.failed_count).sum(),
            entries,
            cancelled: self.cancelled,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

fn check_entry(
    entry: &QueueEntry,
    payload: &PayloadConfig,
    prompts: &HashMap<String, String>,
) -> Result<(), ConfigError> {
    entry.validate(payload)?;
    let prompt = entry.prompt.resolve(0, prompts)?;
    PayloadBudgeter::new(payload.clone()).per_image_budget(entry.references.len(), prompt.len())?;
    Ok(())
}
