//! Priority-based request gate
//!
//! Tasks only run when their priority is at least as urgent (numerically
//! lower or equal) as the most urgent running task. Starting a task at or
//! below the high threshold interrupts running tasks at or above the
//! cancellable threshold: their work is cancelled and restarted from scratch
//! once nothing more urgent is running.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Created,
    Waiting,
    Pending,
}

#[derive(Debug)]
struct TaskEntry {
    priority: i32,
    status: TaskStatus,
    /// Holds the token of the current run while the task is pending
    run: watch::Sender<Option<CancellationToken>>,
}

#[derive(Debug)]
struct PrioritizerState {
    high: i32,
    cancellable: i32,
    next_id: u64,
    tasks: HashMap<u64, TaskEntry>,
    waiting: Vec<u64>,
    pending: Vec<u64>,
}

impl PrioritizerState {
    fn min_pending_priority(&self) -> Option<i32> {
        self.pending
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|t| t.priority)
            .min()
    }

    fn min_waiting_priority(&self) -> Option<i32> {
        self.waiting
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|t| t.priority)
            .min()
    }

    fn can_start_now(&self, priority: i32) -> bool {
        self.min_pending_priority().map_or(true, |min| priority <= min)
    }

    fn is_high(&self, priority: i32) -> bool {
        priority <= self.high
    }

    fn start(&mut self, id: u64) {
        let Some(entry) = self.tasks.get_mut(&id) else {
            return;
        };
        entry.status = TaskStatus::Pending;
        entry.run.send_replace(Some(CancellationToken::new()));
        self.waiting.retain(|&w| w != id);
        self.pending.push(id);
    }

    fn interrupt(&mut self, id: u64) {
        let Some(entry) = self.tasks.get_mut(&id) else {
            return;
        };
        debug!(task = id, priority = entry.priority, "Interrupting task");
        if let Some(token) = entry.run.send_replace(None) {
            token.cancel();
        }
        entry.status = TaskStatus::Waiting;
        self.pending.retain(|&p| p != id);
        self.waiting.push(id);
    }

    fn interrupt_cancellable_tasks(&mut self) {
        let cancellable: Vec<u64> = self
            .pending
            .iter()
            .copied()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|t| t.priority >= self.cancellable)
            })
            .collect();
        for id in cancellable {
            self.interrupt(id);
        }
    }

    fn schedule(&mut self, id: u64) {
        let Some(priority) = self.tasks.get(&id).map(|t| t.priority) else {
            return;
        };
        if self.can_start_now(priority) {
            if self.is_high(priority) {
                self.interrupt_cancellable_tasks();
            }
            self.start(id);
        } else if let Some(entry) = self.tasks.get_mut(&id) {
            entry.status = TaskStatus::Waiting;
            self.waiting.push(id);
        }
    }

    fn loop_through_waiting_queue(&mut self) {
        let Some(min_waiting) = self.min_waiting_priority() else {
            return;
        };
        if self.min_pending_priority().is_some_and(|min| min < min_waiting) {
            return;
        }
        for id in self.waiting.clone() {
            let threshold = match self.min_pending_priority() {
                Some(min) => min.min(min_waiting),
                None => min_waiting,
            };
            let Some(priority) = self.tasks.get(&id).map(|t| t.priority) else {
                continue;
            };
            if priority <= threshold {
                if self.is_high(priority) {
                    self.interrupt_cancellable_tasks();
                }
                self.start(id);
            }
        }
    }

    fn update_priority(&mut self, id: u64, priority: i32) {
        let Some(entry) = self.tasks.get_mut(&id) else {
            return;
        };
        if entry.priority == priority {
            return;
        }
        entry.priority = priority;
        match entry.status {
            TaskStatus::Created => {}
            TaskStatus::Waiting => {
                if self.can_start_now(priority) {
                    if self.is_high(priority) {
                        self.interrupt_cancellable_tasks();
                    }
                    self.start(id);
                }
            }
            TaskStatus::Pending => {
                if self.is_high(priority) {
                    self.interrupt_cancellable_tasks();
                } else if priority >= self.cancellable
                    && self.min_pending_priority().is_some_and(|min| self.is_high(min))
                {
                    self.interrupt(id);
                }
                self.loop_through_waiting_queue();
            }
        }
    }

    fn remove(&mut self, id: u64) {
        let Some(entry) = self.tasks.remove(&id) else {
            return;
        };
        match entry.status {
            TaskStatus::Pending => {
                self.pending.retain(|&p| p != id);
                self.loop_through_waiting_queue();
            }
            TaskStatus::Waiting => self.waiting.retain(|&w| w != id),
            TaskStatus::Created => {}
        }
    }
}

/// Gate shared by every request of a media type
#[derive(Debug, Clone)]
pub struct RequestPrioritizer {
    state: Arc<Mutex<PrioritizerState>>,
}

impl RequestPrioritizer {
    /// `high`: tasks at or below it interrupt cancellable tasks.
    /// `cancellable`: tasks at or above it can be interrupted.
    pub fn new(high: i32, cancellable: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(PrioritizerState {
                high,
                cancellable,
                next_id: 1,
                tasks: HashMap::new(),
                waiting: Vec::new(),
                pending: Vec::new(),
            })),
        }
    }

    /// Create a task with the given priority. It is only scheduled once
    /// [`PrioritizedTask::run`] is called.
    pub fn task(&self, priority: i32) -> PrioritizedTask {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let (run, rx) = watch::channel(None);
        state.tasks.insert(
            id,
            TaskEntry {
                priority,
                status: TaskStatus::Created,
                run,
            },
        );
        PrioritizedTask {
            id,
            state: Arc::clone(&self.state),
            rx,
        }
    }

    /// Number of tasks currently allowed to run
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of tasks waiting for their turn
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiting.len()
    }
}

/// Handle to change the priority of a task while it waits or runs
#[derive(Debug, Clone)]
pub struct PriorityHandle {
    id: u64,
    state: Arc<Mutex<PrioritizerState>>,
}

impl PriorityHandle {
    pub fn update(&self, priority: i32) {
        self.state.lock().update_priority(self.id, priority);
    }
}

/// A unit of work gated by a [`RequestPrioritizer`]
#[derive(Debug)]
pub struct PrioritizedTask {
    id: u64,
    state: Arc<Mutex<PrioritizerState>>,
    rx: watch::Receiver<Option<CancellationToken>>,
}

impl PrioritizedTask {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> PriorityHandle {
        PriorityHandle {
            id: self.id,
            state: Arc::clone(&self.state),
        }
    }

    /// Run the work produced by `make` once the task is allowed to.
    ///
    /// `make` receives a token cancelled when the task is interrupted; it is
    /// called again, from scratch, when the task is resumed. The task is
    /// unregistered when this future completes or is dropped.
    pub async fn run<T, F, Fut>(mut self, mut make: F, cancel: &CancellationToken) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.state.lock().schedule(self.id);
        loop {
            let token = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                run = self.rx.wait_for(Option::is_some) => match run {
                    Ok(run) => run.clone(),
                    Err(_) => return Err(Error::Internal("prioritizer dropped".into())),
                },
            };
            let Some(token) = token else {
                continue;
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = token.cancelled() => None,
                result = make(token.clone()) => Some(result),
            };
            match outcome {
                Some(result) => return result,
                None => debug!(task = self.id, "Task interrupted, waiting to restart"),
            }
        }
    }
}

impl Drop for PrioritizedTask {
    fn drop(&mut self) {
        self.state.lock().remove(self.id);
    }
}
