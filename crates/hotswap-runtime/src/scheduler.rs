//! Command scheduler
//!
//! Accepts units of work from watcher and redefinition threads, merges
//! units that share a [`CommandKey`], and runs each merged unit once the
//! debounce window since its last contributing submission has elapsed.
//!
//! All units execute on a single worker task, so two reloads of the same
//! container never overlap and units that become due together run in
//! submission order. A unit may name prerequisite keys; when it becomes
//! due, pending prerequisites are pulled out of their own window and run
//! first. Container reloads use this to keep parents ahead of children.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use hotswap_kernel::config::SchedulerConfig;
use hotswap_kernel::{ContainerId, LoaderId, ReloadEvent, TypeName};

use crate::watcher::FileEventKind;

/// Merge key. Units with equal keys that are still pending are folded
/// into one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKey {
    /// Reload of one container
    Reload(ContainerId),
    /// Change of one resource within a class-loader context
    Resource { loader: LoaderId, uri: String },
    /// Candidate scan of a newly defined type for one container
    Scan {
        container: ContainerId,
        type_name: TypeName,
    },
}

/// A schedulable unit of work.
#[async_trait]
pub trait Command: Send + Sync + fmt::Debug {
    fn key(&self) -> CommandKey;

    /// Container whose outstanding-request budget this unit consumes.
    ///
    /// Units charged to a container should merge under one key per
    /// container, so the budget bounds executing plus pending requests
    /// rather than discarding distinct work.
    fn container(&self) -> Option<ContainerId> {
        None
    }

    /// Keys that must execute before this unit. Any of them still
    /// pending when this unit becomes due run ahead of it in the same
    /// batch, regardless of their own debounce window.
    fn prerequisites(&self) -> Vec<CommandKey> {
        Vec::new()
    }

    /// Overrides the scheduler's debounce window.
    fn delay(&self) -> Option<Duration> {
        None
    }

    /// Filesystem event that produced this unit, if any.
    fn file_event(&self) -> Option<FileEventKind> {
        None
    }

    /// Run the unit. `merged` holds every unit folded into this
    /// execution in submission order, `self` being the most recent.
    async fn execute(&self, merged: &MergedCommands);
}

/// The originals folded into one execution.
#[derive(Debug, Clone)]
pub struct MergedCommands {
    commands: Vec<Arc<dyn Command>>,
}

impl MergedCommands {
    fn new(first: Arc<dyn Command>) -> Self {
        Self {
            commands: vec![first],
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Command>> {
        self.commands.iter()
    }

    fn latest(&self) -> Option<&Arc<dyn Command>> {
        self.commands.last()
    }

    /// Event kind of the earliest merged unit that carries one.
    pub fn first_event(&self) -> Option<FileEventKind> {
        self.commands.iter().find_map(|c| c.file_event())
    }

    /// True when the merged event sequence contains a delete that no
    /// later create undoes. Editors that save via delete+recreate
    /// therefore do not look like deletions.
    pub fn is_pure_delete(&self) -> bool {
        let kinds: Vec<FileEventKind> = self.commands.iter().filter_map(|c| c.file_event()).collect();
        match kinds.iter().rposition(|k| *k == FileEventKind::Delete) {
            Some(last_delete) => !kinds[last_delete + 1..].contains(&FileEventKind::Create),
            None => false,
        }
    }
}

/// What happened to a submitted unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued as a new unit
    Scheduled,
    /// Folded into a pending unit with the same key; its delay re-armed
    Merged,
    /// Refused: the container already has the maximum outstanding units
    Dropped,
    /// The scheduler has been shut down
    Rejected,
}

impl SubmitOutcome {
    /// `Rejected` becomes [`SchedulerError::Shutdown`]; drops and merges
    /// are successful submissions.
    pub fn into_result(self) -> Result<Self, SchedulerError> {
        match self {
            Self::Rejected => Err(SchedulerError::Shutdown),
            other => Ok(other),
        }
    }
}

/// Scheduler errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    #[error("Command scheduler has been shut down")]
    Shutdown,
}

struct PendingUnit {
    key: CommandKey,
    merged: MergedCommands,
    prerequisites: Vec<CommandKey>,
    container: Option<ContainerId>,
    due: Instant,
    seq: u64,
}

#[derive(Default)]
struct SchedulerState {
    pending: HashMap<CommandKey, PendingUnit>,
    /// Executing + pending units per container
    outstanding: HashMap<ContainerId, usize>,
    next_seq: u64,
    shutdown: bool,
}

/// Debouncing, merging, single-worker command scheduler.
pub struct CommandScheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    wakeup: Notify,
    events: broadcast::Sender<ReloadEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandScheduler {
    /// Create the scheduler and spawn its worker on the current runtime.
    pub fn start(config: SchedulerConfig, events: broadcast::Sender<ReloadEvent>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            config,
            state: Mutex::new(SchedulerState::default()),
            wakeup: Notify::new(),
            events,
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::run_worker(scheduler.clone()));
        *scheduler.worker.lock() = Some(handle);

        info!(
            delay_ms = scheduler.config.reload_delay().as_millis() as u64,
            max_pending = scheduler.config.max_pending_reload_requests,
            "Command scheduler started"
        );
        scheduler
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submit a unit. Never blocks beyond a short critical section.
    pub fn submit(&self, command: Arc<dyn Command>) -> SubmitOutcome {
        let key = command.key();
        let due = Instant::now() + command.delay().unwrap_or_else(|| self.config.reload_delay());
        let prerequisites = command.prerequisites();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shutdown {
            return SubmitOutcome::Rejected;
        }
        let seq = state.next_seq;
        state.next_seq += 1;

        // A merged unit takes the position of its latest submission.
        if let Some(unit) = state.pending.get_mut(&key) {
            unit.merged.commands.push(command);
            unit.prerequisites = prerequisites;
            unit.due = due;
            unit.seq = seq;
            drop(guard);
            trace!(?key, "Merged into pending unit");
            self.wakeup.notify_one();
            return SubmitOutcome::Merged;
        }

        let container = command.container();
        if let Some(id) = container {
            let outstanding = state.outstanding.entry(id).or_default();
            if *outstanding >= self.config.max_pending_reload_requests {
                drop(guard);
                trace!(container = %id, ?key, "Too many outstanding requests, dropping");
                let _ = self.events.send(ReloadEvent::RequestDropped { container: id });
                return SubmitOutcome::Dropped;
            }
            *outstanding += 1;
        }

        state.pending.insert(
            key.clone(),
            PendingUnit {
                key: key.clone(),
                merged: MergedCommands::new(command),
                prerequisites,
                container,
                due,
                seq,
            },
        );
        drop(guard);

        trace!(?key, seq, "Scheduled unit");
        self.wakeup.notify_one();
        SubmitOutcome::Scheduled
    }

    /// Units waiting for their debounce window.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Executing + pending units charged to `container`.
    pub fn pending_for(&self, container: ContainerId) -> usize {
        self.state
            .lock()
            .outstanding
            .get(&container)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Discard pending units and stop the worker after the unit in
    /// flight (if any) completes.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let discarded = state.pending.len();
            state.pending.clear();
            state.outstanding.clear();
            debug!(discarded, "Scheduler shutting down");
        }
        self.wakeup.notify_one();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Command scheduler stopped");
    }

    async fn run_worker(scheduler: Arc<Self>) {
        loop {
            let next_due = {
                let state = scheduler.state.lock();
                if state.shutdown {
                    return;
                }
                state.pending.values().map(|u| u.due).min()
            };

            match next_due {
                None => scheduler.wakeup.notified().await,
                Some(due) if due > Instant::now() => {
                    tokio::select! {
                        _ = scheduler.wakeup.notified() => continue,
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                Some(_) => {}
            }

            for unit in scheduler.take_ready() {
                scheduler.execute(unit).await;
            }
        }
    }

    fn take_ready(&self) -> Vec<PendingUnit> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let ready_keys: Vec<CommandKey> = state
            .pending
            .iter()
            .filter(|(_, unit)| unit.due <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut ready: Vec<PendingUnit> = ready_keys
            .into_iter()
            .filter_map(|key| state.pending.remove(&key))
            .collect();

        let mut next = 0;
        while next < ready.len() {
            let prerequisites = ready[next].prerequisites.clone();
            for key in prerequisites {
                if let Some(unit) = state.pending.remove(&key) {
                    trace!(?key, "Pulled forward as a prerequisite");
                    ready.push(unit);
                }
            }
            next += 1;
        }
        drop(state);

        order_ready(ready)
    }

    async fn execute(&self, unit: PendingUnit) {
        let PendingUnit {
            merged, container, ..
        } = unit;

        if let Some(head) = merged.latest().cloned() {
            let key = head.key();
            debug!(?key, merged = merged.len(), "Executing unit");
            // A panicking unit must not take the worker down with it.
            let result = tokio::spawn(async move { head.execute(&merged).await }).await;
            if let Err(e) = result {
                error!(?key, "Unit failed: {}", e);
            }
        }

        if let Some(id) = container {
            let mut state = self.state.lock();
            if let Some(count) = state.outstanding.get_mut(&id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.outstanding.remove(&id);
                }
            }
        }
    }
}

/// `(due, seq)` order, except that a unit never runs before a
/// prerequisite that is part of the same batch.
fn order_ready(mut ready: Vec<PendingUnit>) -> Vec<PendingUnit> {
    ready.sort_by(|a, b| a.due.cmp(&b.due).then(a.seq.cmp(&b.seq)));
    let index: HashMap<CommandKey, usize> = ready
        .iter()
        .enumerate()
        .map(|(i, unit)| (unit.key.clone(), i))
        .collect();

    let mut placed = vec![false; ready.len()];
    let mut order = Vec::with_capacity(ready.len());
    for i in 0..ready.len() {
        place(i, &ready, &index, &mut placed, &mut order);
    }

    let mut slots: Vec<Option<PendingUnit>> = ready.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

fn place(
    i: usize,
    ready: &[PendingUnit],
    index: &HashMap<CommandKey, usize>,
    placed: &mut [bool],
    order: &mut Vec<usize>,
) {
    // Marked before recursing so a prerequisite cycle terminates.
    if placed[i] {
        return;
    }
    placed[i] = true;
    for key in &ready[i].prerequisites {
        if let Some(&j) = index.get(key) {
            place(j, ready, index, placed, order);
        }
    }
    order.push(i);
}
