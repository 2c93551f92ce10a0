//! Bulk dispatch of queue entries to a generation provider.
//!
//! A run spawns `max_concurrent` workers and one coordinator. The
//! coordinator issues batches round-robin across running entries, applies
//! outcomes, schedules retries and trips circuit breakers; workers pass
//! each batch through the rate limiter and concurrency gate, prepare
//! references and call the [`Transport`].

mod coordinator;
mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::budget::PayloadBudgeter;
use crate::compress::ImageCompressor;
use crate::concurrency::ConcurrencyGate;
use crate::config::DispatchConfig;
use crate::error::{ConfigError, DispatchError};
use crate::events::{DispatchEvent, EventSink, RunFinishedEvent};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::types::{DispatchSummary, EntryProgress, QueueEntry, QueueGroup};
use crate::Transport;

use coordinator::{Control, Coordinator, RunSetup};
use worker::WorkerContext;

/// Drives queue entries to completion against a [`Transport`].
///
/// The rate limiter and concurrency gate live as long as the dispatcher, so
/// consecutive runs share one request budget.
pub struct Dispatcher<T: Transport> {
    config: DispatchConfig,
    transport: Arc<T>,
    limiter: Arc<RateLimiter>,
    gate: Arc<ConcurrencyGate>,
    compressor: Arc<ImageCompressor>,
    retry: RetryPolicy,
    prompts: Arc<HashMap<String, String>>,
    sink: EventSink,
    control_tx: UnboundedSender<Control>,
    control_rx: tokio::sync::Mutex<UnboundedReceiver<Control>>,
    progress: Arc<Mutex<Vec<EntryProgress>>>,
}

impl<T: Transport> Dispatcher<T> {
    /// Create a dispatcher with no progress channel and an empty prompt
    /// library.
    pub fn new(config: DispatchConfig, transport: Arc<T>) -> Result<Self, ConfigError> {
        Self::builder(config, transport).build()
    }

    pub fn builder(config: DispatchConfig, transport: Arc<T>) -> DispatcherBuilder<T> {
        DispatcherBuilder {
            config,
            transport,
            events: None,
            prompts: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Controls and progress snapshots for this dispatcher. Cloneable and
    /// usable from any task while [`run`](Self::run) is in progress.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            control_tx: self.control_tx.clone(),
            progress: Arc::clone(&self.progress),
        }
    }

    /// Highest number of simultaneously admitted jobs seen so far.
    pub fn peak_in_flight(&self) -> usize {
        self.gate.peak_in_flight()
    }

    /// Run grouped entries in dispatch order.
    pub async fn run_groups(&self, groups: &[QueueGroup]) -> Result<DispatchSummary, DispatchError> {
        self.run(QueueGroup::dispatch_order(groups)).await
    }

    /// Dispatch `entries` until every one of them has completed, halted or
    /// stayed idle, or until [`DispatchHandle::cancel_all`].
    ///
    /// A paused entry keeps the run open until it is resumed or the run is
    /// cancelled. Only one run may be active per dispatcher; controls sent
    /// while no run is active are discarded.
    pub async fn run(&self, entries: Vec<QueueEntry>) -> Result<DispatchSummary, DispatchError> {
        let mut control_rx = self
            .control_rx
            .try_lock()
            .map_err(|_| DispatchError::AlreadyRunning)?;
        while control_rx.try_recv().is_ok() {}

        let started = tokio::time::Instant::now();
        let max_concurrent = self.config.concurrency.max_concurrent;
        tracing::info!(entries = entries.len(), max_concurrent, "dispatch run starting");

        let run_token = CancellationToken::new();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(WorkerContext {
            transport: Arc::clone(&self.transport),
            limiter: Arc::clone(&self.limiter),
            gate: Arc::clone(&self.gate),
            budgeter: PayloadBudgeter::new(self.config.payload.clone()),
            compressor: Arc::clone(&self.compressor),
            prompts: Arc::clone(&self.prompts),
            sink: self.sink.clone(),
            request_timeout: self.config.transport.request_timeout(),
            run_token: run_token.clone(),
            outcomes: events_tx.clone(),
        });
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let workers: Vec<_> = (0..max_concurrent)
            .map(|_| tokio::spawn(worker::run_worker(Arc::clone(&ctx), Arc::clone(&work_rx))))
            .collect();
        drop(ctx);

        let mut coordinator = Coordinator::new(
            entries,
            RunSetup {
                max_concurrent,
                failure_threshold: self.config.failure_policy.consecutive_failure_threshold,
                payload: self.config.payload.clone(),
                limits: self.config.target_limits.clone(),
                retry: self.retry.clone(),
                prompts: Arc::clone(&self.prompts),
                run_token: run_token.clone(),
                work_tx,
                events_tx,
                sink: self.sink.clone(),
                shared: Arc::clone(&self.progress),
            },
        );

        coordinator.fill();
        while !coordinator.is_done() {
            tokio::select! {
                Some(event) = events_rx.recv() => coordinator.handle_event(event),
                Some(control) = control_rx.recv() => coordinator.handle_control(control),
                else => break,
            }
            coordinator.fill();
        }

        let summary = coordinator.summary(started.elapsed());
        // Closes the work channel so idle workers exit.
        drop(coordinator);
        run_token.cancel();
        for result in join_all(workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "dispatch worker panicked");
            }
        }

        tracing::info!(
            produced = summary.produced,
            failed = summary.failed,
            cancelled = summary.cancelled,
            duration_ms = summary.duration_ms,
            "dispatch run finished"
        );
        self.sink.emit(DispatchEvent::RunFinished(RunFinishedEvent {
            summary: summary.clone(),
        }));
        Ok(summary)
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder<T: Transport> {
    config: DispatchConfig,
    transport: Arc<T>,
    events: Option<UnboundedSender<DispatchEvent>>,
    prompts: HashMap<String, String>,
}

impl<T: Transport> DispatcherBuilder<T> {
    /// Deliver [`DispatchEvent`]s to `events`.
    pub fn with_events(mut self, events: UnboundedSender<DispatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Named prompts for [`PromptSource::Library`](crate::PromptSource::Library).
    pub fn with_prompt_library(mut self, prompts: HashMap<String, String>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_prompt(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.prompts.insert(name.into(), text.into());
        self
    }

    /// Validate the config and assemble the dispatcher.
    pub fn build(self) -> Result<Dispatcher<T>, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Ok(Dispatcher {
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            gate: Arc::new(ConcurrencyGate::new(config.concurrency.max_concurrent)),
            compressor: Arc::new(ImageCompressor::new(config.compression.clone())),
            retry: RetryPolicy::new(&config.failure_policy),
            prompts: Arc::new(self.prompts),
            sink: EventSink::new(self.events),
            transport: self.transport,
            control_tx,
            control_rx: tokio::sync::Mutex::new(control_rx),
            progress: Arc::new(Mutex::new(Vec::new())),
            config,
        })
    }
}

/// Cloneable control surface for a running [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    control_tx: UnboundedSender<Control>,
    progress: Arc<Mutex<Vec<EntryProgress>>>,
}

impl DispatchHandle {
    /// Stop issuing batches for an entry. In-flight calls finish and are
    /// counted; queued and backing-off batches are dropped.
    pub fn pause(&self, entry_id: impl Into<String>) -> Result<(), DispatchError> {
        self.send(Control::Pause(entry_id.into()))
    }

    /// Re-enable a paused, halted or idle entry. Resets its circuit breaker.
    pub fn resume(&self, entry_id: impl Into<String>) -> Result<(), DispatchError> {
        self.send(Control::Resume(entry_id.into()))
    }

    /// Cancel every pending acquire and in-flight call and end the run.
    pub fn cancel_all(&self) -> Result<(), DispatchError> {
        self.send(Control::CancelAll)
    }

    fn send(&self, control: Control) -> Result<(), DispatchError> {
        self.control_tx
            .send(control)
            .map_err(|_| DispatchError::ControlClosed)
    }

    /// Latest progress of one entry in the current or last run.
    pub fn progress(&self, entry_id: &str) -> Option<EntryProgress> {
        self.lock().iter().find(|p| p.entry_id == entry_id).cloned()
    }

    /// Progress of every entry, in dispatch order.
    pub fn snapshot(&self) -> Vec<EntryProgress> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EntryProgress>> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }
}
