//! Strictly sequential async task queue.
//!
//! Tasks run one at a time in the order they were added; each is awaited to
//! completion before the next starts. A task that fails or panics is reported
//! to the queue's failure handler tagged with its id, and the queue moves on.
//!
//! ```rust
//! use ratchet_messenger::queue::TaskQueue;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = TaskQueue::new("example", |failure| eprintln!("{failure:?}"));
//! queue.add(async { Ok(()) }, Some("first".to_string()));
//! # }
//! ```

use crate::utils::{MessengerError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use std::collections::VecDeque;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A task that returned an error
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Name of the queue the task ran on
    pub queue: &'static str,
    /// Id the task was added with
    pub id: Option<String>,
    /// What went wrong
    pub error: MessengerError,
}

type FailureHandler = Arc<dyn Fn(TaskFailure) + Send + Sync>;

struct QueueTask {
    id: Option<String>,
    run: BoxFuture<'static, Result<()>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueTask>,
    running: bool,
}

struct Inner {
    name: &'static str,
    state: Mutex<QueueState>,
    on_failure: FailureHandler,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO runner executing one task at a time
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Create an idle queue
    ///
    /// # Arguments
    ///
    /// * `name` - Used in logs and failure reports
    /// * `on_failure` - Called once for every task that returns an error
    pub fn new<F>(name: &'static str, on_failure: F) -> Self
    where
        F: Fn(TaskFailure) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(QueueState::default()),
                on_failure: Arc::new(on_failure),
            }),
        }
    }

    /// Append a task; starts draining on the current tokio runtime if idle
    pub fn add<F>(&self, task: F, id: Option<String>)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let start = {
            let mut state = self.inner.state();
            state.pending.push_back(QueueTask {
                id,
                run: task.boxed(),
            });
            !std::mem::replace(&mut state.running, true)
        };

        if start {
            tokio::spawn(drain(Arc::clone(&self.inner)));
        }
    }

    /// Cancel a task that has not started yet. Returns false if no pending
    /// task has this id.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.inner.state();
        let before = state.pending.len();
        state.pending.retain(|task| task.id.as_deref() != Some(id));
        let removed = state.pending.len() != before;
        if removed {
            debug!("[{}] removed pending task {id}", self.inner.name);
        }
        removed
    }

    /// Number of tasks waiting to start
    pub fn len(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Returns true if no task is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if nothing is running or waiting
    pub fn is_idle(&self) -> bool {
        !self.inner.state().running
    }

    /// Queue name
    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .finish()
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let next = {
            let mut state = inner.state();
            let next = state.pending.pop_front();
            if next.is_none() {
                state.running = false;
            }
            next
        };
        let Some(task) = next else {
            return;
        };

        let outcome = AssertUnwindSafe(task.run)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(MessengerError::unexpected(panic_message(&*panic))));
        if let Err(error) = outcome {
            warn!(
                "[{}] task {} failed: {error}",
                inner.name,
                task.id.as_deref().unwrap_or("-")
            );
            (inner.on_failure)(TaskFailure {
                queue: inner.name,
                id: task.id,
                error,
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("task panicked: {detail}")
}
