//! Download queue: ordering, admission control and dispatch
//!
//! All item state lives behind one mutex and is only mutated through the
//! queue's operations and the executor callbacks. Scheduling passes never
//! await and never do I/O; work that has to wait for a process (pause,
//! remove, shutdown) releases the lock while the supervisor terminates it.

use crate::config::{clamp_concurrency, SharedSettings};
use crate::download::executor::{
    DownloadExecutor, ExecutionObserver, Job, JobUpdate, Outcome, Spawn,
};
use crate::download::item::{
    DownloadItem, DownloadState, FailureKind, FormatSelection, ItemId, TransitionError,
};
use crate::process::{ProcessError, ProcessHandle, ProcessSupervisor};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("download {0} not found")]
    NotFound(ItemId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("download queue is shutting down")]
    ShuttingDown,
}

/// Options for a new submission
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitOptions {
    #[serde(default)]
    pub format: Option<FormatSelection>,

    /// Category used to pick the output directory
    #[serde(default)]
    pub category: Option<String>,

    /// Explicit output directory, overriding the category
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Insert at the front instead of the back
    #[serde(default)]
    pub priority: bool,
}

/// Emitted when an item reaches `completed`, for history recorders
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionEvent {
    pub id: ItemId,
    pub url: String,
    pub output_file: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Changes observable by presentation layers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Added { item: DownloadItem },
    Updated { item: DownloadItem },
    Removed { id: ItemId },
    Reordered { order: Vec<ItemId> },
    Completed { completion: CompletionEvent },
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub waiting: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent: usize,
    pub live_processes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Pause,
    Remove,
}

/// Bookkeeping for an item in `downloading`
struct ActiveSlot {
    attempt: u32,
    process: Option<ProcessHandle>,
    stop: Option<StopReason>,
}

#[derive(Default)]
struct QueueState {
    order: Vec<ItemId>,
    items: HashMap<ItemId, DownloadItem>,
    /// Exactly the items in `downloading`
    active: HashMap<ItemId, ActiveSlot>,
    shutting_down: bool,
}

impl QueueState {
    fn renumber(&mut self) {
        for (position, id) in self.order.iter().enumerate() {
            if let Some(item) = self.items.get_mut(id) {
                item.position = position;
            }
        }
    }

    fn drop_item(&mut self, id: &ItemId) -> Option<DownloadItem> {
        self.active.remove(id);
        let item = self.items.remove(id)?;
        self.order.retain(|other| other != id);
        self.renumber();
        Some(item)
    }

    fn item_mut(&mut self, id: &ItemId) -> Result<&mut DownloadItem, QueueError> {
        self.items
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    settings: SharedSettings,
    executor: DownloadExecutor,
    events: broadcast::Sender<QueueEvent>,
}

/// Ordered download queue with a concurrency ceiling
#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<QueueInner>,
}

/// What a stop request has to wait for after the lock is released
enum StopPlan {
    Done,
    Terminate { handle: ProcessHandle, attempt: u32 },
}

impl DownloadQueue {
    pub fn new(settings: SharedSettings, executor: DownloadExecutor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                settings,
                executor,
                events,
            }),
        }
    }

    /// Subscribe to queue events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        self.inner.executor.supervisor()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn stop_grace(&self) -> Duration {
        self.inner.settings.read().downloads.stop_grace()
    }

    /// Add a download in `waiting` and run a scheduling pass
    pub fn submit(&self, url: &str, options: SubmitOptions) -> Result<ItemId, QueueError> {
        let url = url.trim();
        let parsed = url::Url::parse(url).map_err(|e| QueueError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(QueueError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        let output_dir = match options.output_dir {
            Some(dir) => dir,
            None => self
                .inner
                .settings
                .read()
                .destination_for(options.category.as_deref()),
        };

        let item = DownloadItem::new(url.to_string(), options.format, output_dir);
        let id = item.id.clone();

        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(QueueError::ShuttingDown);
            }

            if options.priority {
                state.order.insert(0, id.clone());
            } else {
                state.order.push(id.clone());
            }
            state.items.insert(id.clone(), item);
            state.renumber();

            info!("Queued download {}: {}", id, url);
            if let Some(item) = state.items.get(&id) {
                self.emit(QueueEvent::Added { item: item.clone() });
            }
        }

        self.tick();
        Ok(id)
    }

    /// Scheduling pass: dispatch waiting items in queue order while the
    /// number of downloading items is below the current ceiling.
    pub fn tick(&self) {
        let (limit, template) = {
            let settings = self.inner.settings.read();
            (
                settings.downloads.concurrency_limit(),
                settings.downloads.output_template.clone(),
            )
        };

        let jobs = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.shutting_down {
                return;
            }

            let mut jobs = Vec::new();
            while state.active.len() < limit {
                let next = state
                    .order
                    .iter()
                    .find(|id| {
                        state
                            .items
                            .get(*id)
                            .is_some_and(|item| item.state == DownloadState::Waiting)
                    })
                    .cloned();
                let Some(id) = next else { break };
                let Some(item) = state.items.get_mut(&id) else { break };
                let Ok(attempt) = item.dispatch() else { break };

                state.active.insert(
                    id.clone(),
                    ActiveSlot {
                        attempt,
                        process: None,
                        stop: None,
                    },
                );

                info!("Dispatching {} (attempt {})", id, attempt);
                jobs.push(Job {
                    item_id: id,
                    attempt,
                    url: item.url.clone(),
                    format: item.format.clone(),
                    output_dir: item.output_dir.clone(),
                    output_template: template.clone(),
                    resume_from: item.progress,
                });
                self.emit(QueueEvent::Updated { item: item.clone() });
            }
            jobs
        };

        for job in jobs {
            let executor = self.inner.executor.clone();
            let queue = self.clone();
            tokio::spawn(async move {
                executor.execute(job, &queue).await;
            });
        }
    }

    /// Move an item to the front. Returns false if it was already first or unknown.
    pub fn prioritize(&self, id: &ItemId) -> bool {
        let mut state = self.inner.state.lock();
        match state.order.iter().position(|other| other == id) {
            Some(0) | None => false,
            Some(pos) => {
                let id = state.order.remove(pos);
                state.order.insert(0, id);
                state.renumber();
                self.emit(QueueEvent::Reordered {
                    order: state.order.clone(),
                });
                true
            }
        }
    }

    /// Move an item to `position`, clamped to the end of the queue
    pub fn reorder(&self, id: &ItemId, position: usize) -> Result<(), QueueError> {
        let mut state = self.inner.state.lock();
        let current = state
            .order
            .iter()
            .position(|other| other == id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let id = state.order.remove(current);
        let position = position.min(state.order.len());
        state.order.insert(position, id);
        state.renumber();
        self.emit(QueueEvent::Reordered {
            order: state.order.clone(),
        });
        Ok(())
    }

    /// Pause an item. A downloading item's process is terminated before
    /// this returns; the item keeps its progress.
    pub async fn pause(&self, id: &ItemId) -> Result<(), QueueError> {
        let plan = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let item = state
                .items
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.clone()))?;

            match item.state {
                DownloadState::Downloading => match state.active.get_mut(id) {
                    Some(ActiveSlot {
                        process: Some(handle),
                        attempt,
                        stop,
                    }) => {
                        stop.get_or_insert(StopReason::Pause);
                        StopPlan::Terminate {
                            handle: handle.clone(),
                            attempt: *attempt,
                        }
                    }
                    _ => {
                        // Not spawned yet; launch refuses once the slot is gone.
                        state.active.remove(id);
                        item.pause()?;
                        self.emit(QueueEvent::Updated { item: item.clone() });
                        StopPlan::Done
                    }
                },
                _ => {
                    item.pause()?;
                    self.emit(QueueEvent::Updated { item: item.clone() });
                    return Ok(());
                }
            }
        };

        if let StopPlan::Terminate { handle, attempt } = plan {
            info!("Pausing {}", id);
            if let Err(e) = self.inner.executor.cancel(&handle, self.stop_grace()).await {
                warn!("Stopping {} failed: {}", id, e);
            }

            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let ours = state
                .active
                .get(id)
                .is_some_and(|slot| slot.attempt == attempt && slot.stop == Some(StopReason::Pause));
            if ours {
                state.active.remove(id);
                if let Some(item) = state.items.get_mut(id) {
                    if item.pause().is_ok() {
                        self.emit(QueueEvent::Updated { item: item.clone() });
                    }
                }
            }
        }

        self.tick();
        Ok(())
    }

    /// `paused -> waiting`; the item is dispatched when its turn comes
    pub fn resume(&self, id: &ItemId) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock();
            let item = state.item_mut(id)?;
            item.resume()?;
            self.emit(QueueEvent::Updated { item: item.clone() });
        }
        self.tick();
        Ok(())
    }

    /// `failed -> waiting` at the item's current position
    pub fn retry(&self, id: &ItemId) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock();
            let item = state.item_mut(id)?;
            item.retry()?;
            info!("Retrying {} (retry {})", id, item.retry_count);
            self.emit(QueueEvent::Updated { item: item.clone() });
        }
        self.tick();
        Ok(())
    }

    /// Remove an item in any state. A backing process is terminated first.
    pub async fn remove(&self, id: &ItemId) -> Result<(), QueueError> {
        let plan = {
            let mut state = self.inner.state.lock();
            if !state.items.contains_key(id) {
                return Err(QueueError::NotFound(id.clone()));
            }

            match state.active.get_mut(id) {
                Some(ActiveSlot {
                    process: Some(handle),
                    attempt,
                    stop,
                }) => {
                    *stop = Some(StopReason::Remove);
                    StopPlan::Terminate {
                        handle: handle.clone(),
                        attempt: *attempt,
                    }
                }
                _ => {
                    state.drop_item(id);
                    self.emit(QueueEvent::Removed { id: id.clone() });
                    StopPlan::Done
                }
            }
        };

        if let StopPlan::Terminate { handle, .. } = plan {
            info!("Stopping {} for removal", id);
            if let Err(e) = self.inner.executor.cancel(&handle, self.stop_grace()).await {
                warn!("Stopping {} failed: {}", id, e);
            }
            // The executor may already have dropped it on its Cancelled outcome.
            if self.inner.state.lock().drop_item(id).is_some() {
                self.emit(QueueEvent::Removed { id: id.clone() });
            }
        }

        info!("Removed download {}", id);
        self.tick();
        Ok(())
    }

    /// Update the ceiling. Running items are never preempted; a lower
    /// ceiling only holds back new dispatches. Returns the applied value.
    pub fn set_concurrency_limit(&self, limit: usize) -> usize {
        let limit = clamp_concurrency(limit);
        self.inner.settings.write().downloads.max_concurrent = limit;
        info!("Concurrency limit set to {}", limit);
        self.tick();
        limit
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.settings.read().downloads.concurrency_limit()
    }

    /// Pause every waiting and downloading item
    pub async fn pause_all(&self) {
        let ids: Vec<ItemId> = {
            let state = self.inner.state.lock();
            state
                .order
                .iter()
                .filter(|id| {
                    state.items.get(*id).is_some_and(|item| {
                        matches!(item.state, DownloadState::Waiting | DownloadState::Downloading)
                    })
                })
                .cloned()
                .collect()
        };

        let results = join_all(ids.iter().map(|id| self.pause(id))).await;
        for err in results.into_iter().filter_map(Result::err) {
            debug!("pause_all: {}", err);
        }
    }

    /// Return every paused item to `waiting`
    pub fn resume_all(&self) {
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            for id in &state.order {
                if let Some(item) = state.items.get_mut(id) {
                    if item.resume().is_ok() {
                        self.emit(QueueEvent::Updated { item: item.clone() });
                    }
                }
            }
        }
        self.tick();
    }

    /// Remove all completed items. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut state = self.inner.state.lock();
        let done: Vec<ItemId> = state
            .order
            .iter()
            .filter(|id| {
                state
                    .items
                    .get(*id)
                    .is_some_and(|item| item.state == DownloadState::Completed)
            })
            .cloned()
            .collect();

        for id in &done {
            state.drop_item(id);
            self.emit(QueueEvent::Removed { id: id.clone() });
        }
        done.len()
    }

    /// Snapshot of all items in queue order
    pub fn items(&self) -> Vec<DownloadItem> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: &ItemId) -> Option<DownloadItem> {
        self.inner.state.lock().items.get(id).cloned()
    }

    /// Item ids in queue order
    pub fn order(&self) -> Vec<ItemId> {
        self.inner.state.lock().order.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        let count = |wanted: DownloadState| {
            state
                .items
                .values()
                .filter(|item| item.state == wanted)
                .count()
        };

        QueueStats {
            total: state.items.len(),
            waiting: count(DownloadState::Waiting),
            downloading: count(DownloadState::Downloading),
            paused: count(DownloadState::Paused),
            completed: count(DownloadState::Completed),
            failed: count(DownloadState::Failed),
            max_concurrent: self.concurrency_limit(),
            live_processes: self.supervisor().live_count(),
        }
    }

    /// Stop dispatching, pause everything in flight and terminate all
    /// processes concurrently.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            for slot in state.active.values_mut() {
                slot.stop.get_or_insert(StopReason::Pause);
            }
            info!("Shutting down queue with {} active downloads", state.active.len());
        }

        // Attempts not yet spawned are refused by `launch` from here on, so
        // the live set cannot grow.
        self.supervisor().terminate_all(grace).await;

        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            for (id, slot) in std::mem::take(&mut state.active) {
                if slot.stop == Some(StopReason::Remove) {
                    state.items.remove(&id);
                    state.order.retain(|other| other != &id);
                    self.emit(QueueEvent::Removed { id });
                } else if let Some(item) = state.items.get_mut(&id) {
                    if item.pause().is_ok() {
                        self.emit(QueueEvent::Updated { item: item.clone() });
                    }
                }
            }
            state.renumber();
        }
    }

    fn on_finished(&self, id: &ItemId, attempt: u32, outcome: Outcome) {
        let max_retries = self
            .inner
            .settings
            .read()
            .downloads
            .retry
            .max_automatic_retries;

        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            if !state.active.get(id).is_some_and(|slot| slot.attempt == attempt) {
                debug!("Ignoring stale outcome for {} attempt {}", id, attempt);
                return;
            }
            let Some(slot) = state.active.remove(id) else {
                return;
            };

            if outcome == Outcome::Cancelled && slot.stop == Some(StopReason::Remove) {
                state.drop_item(id);
                self.emit(QueueEvent::Removed { id: id.clone() });
            } else if let Some(item) = state.items.get_mut(id) {
                match outcome {
                    Outcome::Completed(done) => {
                        if item.complete(done.output_file).is_ok() {
                            let size_bytes = done
                                .size_bytes
                                .or_else(|| item.size.map(|size| size.bytes));
                            self.emit(QueueEvent::Updated { item: item.clone() });
                            self.emit(QueueEvent::Completed {
                                completion: CompletionEvent {
                                    id: id.clone(),
                                    url: item.url.clone(),
                                    output_file: item.output_file.clone(),
                                    size_bytes,
                                    duration_ms: done.duration.as_millis() as u64,
                                    completed_at: item.completed_at.unwrap_or_else(Utc::now),
                                },
                            });
                        }
                    }
                    Outcome::Failed(err) => {
                        let automatic = err.kind == FailureKind::RuntimeFailure
                            && item.retry_count < max_retries;
                        if item.fail(err).is_ok() {
                            if automatic && item.retry().is_ok() {
                                info!("Automatically retrying {} (retry {})", id, item.retry_count);
                            }
                            self.emit(QueueEvent::Updated { item: item.clone() });
                        }
                    }
                    Outcome::Cancelled => {
                        if item.pause().is_ok() {
                            self.emit(QueueEvent::Updated { item: item.clone() });
                        }
                    }
                }
            }
        }

        self.tick();
    }
}

impl ExecutionObserver for DownloadQueue {
    fn launch(
        &self,
        id: &ItemId,
        attempt: u32,
        spawn: Spawn<'_>,
    ) -> Option<Result<ProcessHandle, ProcessError>> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.shutting_down {
            return None;
        }
        let slot = state
            .active
            .get_mut(id)
            .filter(|slot| slot.attempt == attempt && slot.stop.is_none())?;

        let started = spawn();
        if let Ok(handle) = &started {
            slot.process = Some(handle.clone());
        }
        Some(started)
    }

    fn update(&self, id: &ItemId, attempt: u32, update: JobUpdate) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if !state.active.get(id).is_some_and(|slot| slot.attempt == attempt) {
            return;
        }
        let Some(item) = state.items.get_mut(id) else {
            return;
        };

        let changed = match update {
            JobUpdate::Progress { percent, sample } => item.apply_progress(percent, &sample),
            JobUpdate::OutputFile(path) => {
                item.set_output_file(path);
                true
            }
        };
        if changed {
            self.emit(QueueEvent::Updated { item: item.clone() });
        }
    }

    fn finished(&self, id: &ItemId, attempt: u32, outcome: Outcome) {
        self.on_finished(id, attempt, outcome);
    }
}
