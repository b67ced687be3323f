//! Admission queue and concurrency gate.
//!
//! Requests move `Queued -> Dispatched -> Completed`. All counter and queue
//! transitions happen under one lock: admission, dispatch, and the
//! release-then-dispatch-next step taken when an execution finishes.

use crate::config::SchedulerConfig;
use crate::sandbox::{ExecutionRequest, ExecutionResult};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Runs one admitted request to completion, including all cleanup.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult;
}

struct ExecutionTask {
    request: ExecutionRequest,
    enqueue_order: u64,
    completion: oneshot::Sender<ExecutionResult>,
}

#[derive(Default)]
struct GateState {
    in_flight: usize,
    queue: VecDeque<ExecutionTask>,
    next_order: u64,
}

impl GateState {
    /// Pop queued tasks in FIFO order while slots are free, claiming a slot
    /// for each. Tasks whose caller has gone away are dropped.
    fn take_ready(&mut self, max_concurrent: usize) -> Vec<ExecutionTask> {
        let mut ready = Vec::new();
        while self.in_flight < max_concurrent {
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            if task.completion.is_closed() {
                debug!(request_id = %task.request.id, "Caller went away before dispatch, dropping");
                continue;
            }
            self.in_flight += 1;
            ready.push(task);
        }
        ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub in_flight: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_backlog: usize,
}

struct Inner {
    config: SchedulerConfig,
    executor: Arc<dyn Executor>,
    state: Mutex<GateState>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                executor,
                state: Mutex::new(GateState::default()),
            }),
        }
    }

    /// Admit `request` and wait for its result.
    ///
    /// Past the backlog limit the request is answered immediately with
    /// [`crate::sandbox::Outcome::Rejected`] and never queued.
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let request_id = request.id;
        let receiver = match self.inner.submit(request) {
            Ok(receiver) => receiver,
            Err(stats) => {
                warn!(%request_id, in_flight = stats.in_flight, queued = stats.queued, "Backlog full, rejecting");
                return ExecutionResult::rejected();
            }
        };

        match receiver.await {
            Ok(result) => result,
            Err(_) => {
                error!(%request_id, "Execution ended without a result");
                ExecutionResult::internal_error()
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats(&self.inner.lock())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        // The state stays consistent even if a holder panicked; nothing
        // panics while holding it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stats(&self, state: &GateState) -> SchedulerStats {
        SchedulerStats {
            in_flight: state.in_flight,
            queued: state.queue.len(),
            max_concurrent: self.config.max_concurrent,
            max_backlog: self.config.max_backlog,
        }
    }

    fn submit(
        self: &Arc<Self>,
        request: ExecutionRequest,
    ) -> Result<oneshot::Receiver<ExecutionResult>, SchedulerStats> {
        let (completion, receiver) = oneshot::channel();
        let ready = {
            let mut state = self.lock();
            if state.in_flight + state.queue.len() >= self.config.max_backlog {
                return Err(self.stats(&state));
            }
            let enqueue_order = state.next_order;
            state.next_order += 1;
            debug!(request_id = %request.id, enqueue_order, queued = state.queue.len() + 1, "Request queued");
            state.queue.push_back(ExecutionTask {
                request,
                enqueue_order,
                completion,
            });
            state.take_ready(self.config.max_concurrent)
        };
        self.dispatch(ready);
        Ok(receiver)
    }

    /// Release a slot and hand it straight to the next queued task.
    fn complete(self: &Arc<Self>) {
        let ready = {
            let mut state = self.lock();
            state.in_flight -= 1;
            state.take_ready(self.config.max_concurrent)
        };
        self.dispatch(ready);
    }

    fn dispatch(self: &Arc<Self>, tasks: Vec<ExecutionTask>) {
        for task in tasks {
            let slot = Slot {
                inner: Arc::clone(self),
            };
            let executor = Arc::clone(&self.executor);
            info!(request_id = %task.request.id, enqueue_order = task.enqueue_order, "Dispatching");
            tokio::spawn(async move {
                let result = executor.execute(task.request).await;
                // Free the slot before answering so a caller that resubmits
                // immediately sees the capacity.
                drop(slot);
                let _ = task.completion.send(result);
            });
        }
    }
}

/// A claimed concurrency slot; released on drop, panics included.
struct Slot {
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.inner.complete();
    }
}
