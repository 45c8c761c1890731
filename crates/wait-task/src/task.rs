//! A single end-to-end wait.
//!
//! A task builds a remote poller in the provider's current execution context, waits for the
//! first truthy value, and settles one long-lived result. Runs interrupted by a replaced
//! context are parked until [`WaitTask::rerun`] is called against the fresh context; every
//! other failure, and the timeout, terminates the task.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{ContextProvider, ExecutionContext, RemoteArg};
use crate::deferred::Deferred;
use crate::errors::{classify, ContextError, Failure, WaitError};
use crate::manager::TaskManager;
use crate::metrics;
use crate::options::{Predicate, WaitOptions};
use crate::poller::{poller_factory, Poller, RemotePoller};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a task. The last four variants are terminal and record why it ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskPhase {
    Initializing,
    Polling,
    /// The context was replaced mid-run; waiting for a re-run.
    Recoverable,
    Resolved,
    TimedOut,
    Fatal,
    Terminated,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskPhase::Resolved | TaskPhase::TimedOut | TaskPhase::Fatal | TaskPhase::Terminated
        )
    }
}

struct TaskState {
    phase: TaskPhase,
    generation: u64,
    terminated: bool,
    poller: Option<Arc<RemotePoller>>,
    timer: Option<JoinHandle<()>>,
}

struct TaskInner {
    id: TaskId,
    provider: Arc<dyn ContextProvider>,
    manager: Weak<TaskManager>,
    predicate: Predicate,
    args: Vec<RemoteArg>,
    options: WaitOptions,
    result: Deferred<Value, WaitError>,
    state: Mutex<TaskState>,
}

/// Cheap handle to a running wait; clones share the same task.
#[derive(Clone)]
pub struct WaitTask {
    inner: Arc<TaskInner>,
}

impl fmt::Debug for WaitTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitTask")
            .field("id", &self.inner.id)
            .field("phase", &self.phase())
            .field("polling", &self.inner.options.polling)
            .finish()
    }
}

impl WaitTask {
    /// Registers a new task with `manager`, arms its timeout and starts the first run.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        provider: Arc<dyn ContextProvider>,
        manager: &Arc<TaskManager>,
        predicate: Predicate,
        args: Vec<RemoteArg>,
        options: WaitOptions,
    ) -> WaitTask {
        let task = WaitTask {
            inner: Arc::new(TaskInner {
                id: TaskId::new(),
                provider,
                manager: Arc::downgrade(manager),
                predicate,
                args,
                options,
                result: Deferred::new(),
                state: Mutex::new(TaskState {
                    phase: TaskPhase::Initializing,
                    generation: 0,
                    terminated: false,
                    poller: None,
                    timer: None,
                }),
            }),
        };

        if let Err(err) = task.inner.options.validate() {
            warn!(task_id = %task.id(), %err, "rejecting wait with invalid options");
            task.inner.result.reject(err);
            metrics::record_failed();
            {
                let mut state = task.inner.state.lock();
                state.phase = TaskPhase::Fatal;
                state.terminated = true;
            }
            return task;
        }

        manager.add(task.clone());
        metrics::record_started(task.inner.options.polling.as_str());
        info!(
            task_id = %task.id(),
            polling = %task.inner.options.polling,
            predicate = task.inner.predicate.kind(),
            timeout_ms = timeout_millis(task.inner.options.timeout),
            "wait task started"
        );

        task.arm_timeout();

        let runner = task.clone();
        tokio::spawn(async move {
            runner.rerun().await;
        });

        task
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn phase(&self) -> TaskPhase {
        self.inner.state.lock().phase
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminated
    }

    pub fn is_settled(&self) -> bool {
        self.inner.result.settled()
    }

    /// The task's single settlement: the first truthy value or the first fatal error.
    pub fn result(&self) -> impl Future<Output = Result<Value, WaitError>> + Send + 'static {
        self.inner.result.wait()
    }

    /// Runs the poll algorithm from scratch against the provider's current context.
    ///
    /// Returns once the run reaches a stable point: resolved, failed, or parked after a
    /// recoverable failure. No-op on terminated tasks.
    pub async fn rerun(&self) {
        let (generation, previous) = {
            let mut state = self.inner.state.lock();
            if state.terminated {
                return;
            }
            state.generation += 1;
            state.phase = TaskPhase::Polling;
            (state.generation, state.poller.take())
        };

        if generation > 1 {
            metrics::record_rerun();
            debug!(task_id = %self.id(), generation, "re-running wait task");
        }
        if let Some(previous) = previous {
            discard_poller(previous).await;
        }

        let outcome = self.poll(generation).await;
        if !self.is_current(generation) {
            debug!(task_id = %self.id(), generation, "dropping outcome of superseded run");
            return;
        }

        match outcome {
            Ok(value) => {
                if self.inner.result.resolve(value) {
                    metrics::record_resolved();
                    info!(task_id = %self.id(), generation, "wait task resolved");
                }
                self.finish(None, TaskPhase::Resolved).await;
            }
            Err(err) => match classify(err) {
                Failure::Recoverable => {
                    metrics::record_recoverable();
                    debug!(
                        task_id = %self.id(),
                        generation,
                        "execution context replaced; waiting for re-run"
                    );
                    let mut state = self.inner.state.lock();
                    if !state.terminated && state.generation == generation {
                        state.phase = TaskPhase::Recoverable;
                    }
                }
                Failure::Fatal(error) => {
                    self.finish(Some(error), TaskPhase::Fatal).await;
                }
            },
        }
    }

    /// Ends the task. Idempotent; with an error, rejects the result if still pending.
    pub async fn terminate(&self, error: Option<WaitError>) {
        self.finish(error, TaskPhase::Terminated).await;
    }

    async fn poll(&self, generation: u64) -> Result<Value, ContextError> {
        let inner = &self.inner;
        let context = inner.provider.execution_context().await?;
        self.expose_bindings(context.as_ref()).await?;

        let call = poller_factory(
            &inner.predicate,
            &inner.args,
            inner.options.polling,
            inner.options.root.as_ref(),
        );
        let poller = Arc::new(RemotePoller::new(context.evaluate_handle(&call).await?));

        let adopted = {
            let mut state = inner.state.lock();
            if !state.terminated && state.generation == generation {
                state.poller = Some(Arc::clone(&poller));
                true
            } else {
                false
            }
        };
        if !adopted {
            discard_poller(poller).await;
            return Err(ContextError::stopped());
        }

        poller.start().await?;
        poller.result().await
    }

    async fn expose_bindings(&self, context: &dyn ExecutionContext) -> Result<(), ContextError> {
        let provider = &self.inner.provider;
        for binding in &self.inner.options.bindings {
            context
                .bindings()
                .expose(&binding.name, || {
                    debug!(task_id = %self.id(), name = %binding.name, context = %context.id(), "exposing binding");
                    provider.expose_binding(context, binding)
                })
                .await?;
        }
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.inner.state.lock();
        !state.terminated && state.generation == generation
    }

    fn arm_timeout(&self) {
        let timeout = self.inner.options.timeout;
        if timeout.is_zero() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let mut state = self.inner.state.lock();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detach ourselves so termination does not abort this very future.
            drop(inner.state.lock().timer.take());
            let task = WaitTask { inner };
            task.finish(Some(timeout_error(timeout)), TaskPhase::TimedOut)
                .await;
        }));
    }

    async fn finish(&self, error: Option<WaitError>, phase: TaskPhase) {
        let (poller, timer) = {
            let mut state = self.inner.state.lock();
            if !state.terminated {
                state.terminated = true;
                state.phase = phase;
            }
            (state.poller.take(), state.timer.take())
        };

        if let Some(manager) = self.inner.manager.upgrade() {
            manager.delete(&self.id());
        }
        if let Some(timer) = timer {
            timer.abort();
        }

        if let Some(error) = error {
            if self.inner.result.reject(error.clone()) {
                if error.is_timeout() {
                    metrics::record_timed_out();
                } else {
                    metrics::record_failed();
                }
                warn!(task_id = %self.id(), %error, "wait task failed");
            }
        }

        if let Some(poller) = poller {
            discard_poller(poller).await;
        }
    }
}

fn timeout_error(timeout: Duration) -> WaitError {
    WaitError::Timeout(timeout_millis(timeout))
}

/// Whole milliseconds, rounded up so a non-zero timeout never reports `0ms`.
fn timeout_millis(timeout: Duration) -> u64 {
    u64::try_from((timeout.as_nanos() + 999_999) / 1_000_000).unwrap_or(u64::MAX)
}

/// Stops and releases a poller; cleanup failures never reach the caller.
async fn discard_poller(poller: Arc<RemotePoller>) {
    if let Err(err) = poller.stop().await {
        debug!(%err, "ignoring poller stop failure");
    }
    if let Err(err) = poller.dispose().await {
        debug!(%err, "ignoring poller dispose failure");
    }
}
