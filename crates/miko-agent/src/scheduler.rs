// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! GUI-automation exclusivity scheduler.
//!
//! Desktop automation cannot run concurrently with itself, so the whole
//! system executes at most one GUI task at a time: a single consumer loop
//! dequeues one entry whenever nothing is active and runs it in a worker
//! child process.  Terminal outcomes come back over an internal channel
//! drained by one poller, which finalizes the registry entry and clears the
//! active flag.  The queue is bounded; a full queue pushes back on the
//! dispatcher instead of growing without limit.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use miko_config::GuiWorkerConfig;
use serde_json::json;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::registry::TaskRegistry;

const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct GuiTask {
    pub task_id: String,
    pub instruction: String,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EnqueueError {
    #[error("gui task queue is full")]
    QueueFull,
}

/// Terminal record posted by a finished worker.
struct GuiOutcome {
    task_id: String,
    success: bool,
    detail: String,
}

struct Inner {
    queue: VecDeque<GuiTask>,
    active: Option<String>,
}

pub struct GuiScheduler {
    inner: Mutex<Inner>,
    limit: usize,
    worker: Option<GuiWorkerConfig>,
    registry: Arc<TaskRegistry>,
    results_tx: mpsc::UnboundedSender<GuiOutcome>,
}

impl GuiScheduler {
    /// Build the scheduler and start its consumer and result-poller loops.
    /// Both loops hold only weak references, so dropping the scheduler
    /// stops them.
    pub fn spawn(
        registry: Arc<TaskRegistry>,
        worker: Option<GuiWorkerConfig>,
        limit: usize,
    ) -> Arc<Self> {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                active: None,
            }),
            limit,
            worker,
            registry,
            results_tx,
        });

        tokio::spawn(consumer_loop(Arc::downgrade(&scheduler)));
        tokio::spawn(poller_loop(Arc::downgrade(&scheduler), results_rx));
        scheduler
    }

    /// Whether a worker command is configured at all.
    pub fn is_ready(&self) -> bool {
        self.worker.is_some()
    }

    pub fn active_task(&self) -> Option<String> {
        self.inner.lock().unwrap().active.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Queue one task for exclusive execution.
    pub fn enqueue(&self, task: GuiTask) -> Result<(), EnqueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= self.limit {
            warn!(limit = self.limit, "gui task queue full, rejecting");
            return Err(EnqueueError::QueueFull);
        }
        inner.queue.push_back(task);
        Ok(())
    }

    /// Administrative reset: every queued entry fails; the active worker,
    /// if any, runs to completion and clears itself through the poller.
    pub fn end_all(&self) -> usize {
        let drained: Vec<GuiTask> = {
            let mut inner = self.inner.lock().unwrap();
            inner.queue.drain(..).collect()
        };
        for task in &drained {
            self.registry.fail(&task.task_id, "cancelled by admin");
        }
        drained.len()
    }
}

/// 50 ms tick: dequeue one entry whenever no GUI task is active.
async fn consumer_loop(scheduler: Weak<GuiScheduler>) {
    loop {
        tokio::time::sleep(TICK).await;
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        let Some(worker) = scheduler.worker.clone() else {
            continue;
        };

        let task = {
            let mut inner = scheduler.inner.lock().unwrap();
            if inner.active.is_some() {
                continue;
            }
            let Some(task) = inner.queue.pop_front() else {
                continue;
            };
            inner.active = Some(task.task_id.clone());
            task
        };

        scheduler.registry.set_running(&task.task_id);
        info!(task_id = %task.task_id, "starting gui-automation worker");

        let results_tx = scheduler.results_tx.clone();
        tokio::spawn(async move {
            let outcome = run_worker(&worker, &task).await;
            let _ = results_tx.send(outcome);
        });
    }
}

/// Single consumer of worker outcomes: finalize the registry entry, then
/// clear the active flag so the next queued task may start.
async fn poller_loop(scheduler: Weak<GuiScheduler>, mut results_rx: mpsc::UnboundedReceiver<GuiOutcome>) {
    while let Some(outcome) = results_rx.recv().await {
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        if outcome.success {
            scheduler
                .registry
                .complete(&outcome.task_id, json!({ "output": outcome.detail }));
        } else {
            scheduler.registry.fail(&outcome.task_id, outcome.detail);
        }
        let mut inner = scheduler.inner.lock().unwrap();
        if inner.active.as_deref() == Some(outcome.task_id.as_str()) {
            inner.active = None;
        }
    }
}

/// Run one GUI instruction in the configured worker process.  The
/// instruction is the final argument; stdout is the result detail.
async fn run_worker(worker: &GuiWorkerConfig, task: &GuiTask) -> GuiOutcome {
    let output = Command::new(&worker.command)
        .args(&worker.args)
        .arg(&task.instruction)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => GuiOutcome {
            task_id: task.task_id.clone(),
            success: true,
            detail: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        },
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(task_id = %task.task_id, "gui worker exited with failure: {stderr}");
            GuiOutcome {
                task_id: task.task_id.clone(),
                success: false,
                detail: if stderr.is_empty() {
                    format!("worker exited with {}", output.status)
                } else {
                    stderr
                },
            }
        }
        Err(e) => {
            error!(task_id = %task.task_id, "failed to spawn gui worker: {e}");
            GuiOutcome {
                task_id: task.task_id.clone(),
                success: false,
                detail: format!("spawn failed: {e}"),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
