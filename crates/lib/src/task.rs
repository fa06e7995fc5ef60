//! Task graph: pool-backed async tasks with hierarchical named wait groups.
//!
//! Tasks are registered under dot-separated names (`qc.server`,
//! `pkg.common`). [`TaskGraph::await_group`] blocks the calling task until
//! every task registered under that name or any sub-name has completed, then
//! re-raises the first failure among them. [`TaskGraph::drain_all`] waits for
//! the whole graph and surfaces the first captured error.
//!
//! # Register-before-wait contract
//!
//! Every task that will ever be registered under a group must be registered
//! before any task that awaits that group begins running. The graph does not
//! model explicit edges; the orchestrator's synchronous dispatch phase
//! provides the ordering. Violations are detectable rather than silently
//! racy: awaiting a group seals its name, and a later registration under a
//! sealed prefix fails with [`Error::GroupSealed`].
//!
//! # Failure semantics
//!
//! The first task error is latched and the shared [`AbortFlag`] is raised.
//! Tasks that have not yet acquired a pool slot observe the flag and resolve
//! as aborted without running; already-running tasks are expected to poll
//! the flag at safe points and stop early.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, watch};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Cooperative cancellation token shared by every task of one build.
#[derive(Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
  pub fn raise(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_raised(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  /// Safe-point check: fail with [`Error::Aborted`] once the flag is up.
  pub fn check(&self) -> Result<()> {
    if self.is_raised() { Err(Error::Aborted) } else { Ok(()) }
  }
}

#[derive(Clone)]
enum TaskOutcome {
  Ok,
  Failed(String),
}

struct TaskEntry {
  name: String,
  done: watch::Receiver<Option<TaskOutcome>>,
}

struct GraphState {
  tasks: Vec<TaskEntry>,
  sealed: Vec<String>,
}

struct GraphInner {
  semaphore: Arc<Semaphore>,
  abort: AbortFlag,
  state: Mutex<GraphState>,
  first_error: Mutex<Option<Error>>,
}

/// Pool-backed task registry with named wait groups.
#[derive(Clone)]
pub struct TaskGraph {
  inner: Arc<GraphInner>,
}

fn group_contains(group: &str, name: &str) -> bool {
  name == group || (name.len() > group.len() && name.starts_with(group) && name.as_bytes()[group.len()] == b'.')
}

impl TaskGraph {
  /// Create a graph whose tasks run on at most `threads` pool slots.
  pub fn new(threads: usize) -> Self {
    TaskGraph {
      inner: Arc::new(GraphInner {
        semaphore: Arc::new(Semaphore::new(threads.max(1))),
        abort: AbortFlag::default(),
        state: Mutex::new(GraphState {
          tasks: Vec::new(),
          sealed: Vec::new(),
        }),
        first_error: Mutex::new(None),
      }),
    }
  }

  pub fn abort_flag(&self) -> AbortFlag {
    self.inner.abort.clone()
  }

  /// Schedule `work` under hierarchical `name`. Returns immediately; the
  /// task starts once a pool slot is free. Fails if `name` falls under a
  /// group that has already been awaited.
  pub fn register<F>(&self, name: &str, work: F) -> Result<()>
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    let (tx, rx) = watch::channel(None);

    {
      let mut state = self.inner.state.lock().expect("task graph state poisoned");
      if let Some(group) = state.sealed.iter().find(|g| group_contains(g, name)) {
        return Err(Error::GroupSealed {
          name: name.to_string(),
          group: group.clone(),
        });
      }
      state.tasks.push(TaskEntry {
        name: name.to_string(),
        done: rx,
      });
    }

    let inner = self.inner.clone();
    let task_name = name.to_string();

    tokio::spawn(async move {
      let permit = inner.semaphore.clone().acquire_owned().await;

      // Tasks that have not started by the time the build fails are
      // cancelled here instead of running.
      let outcome = if inner.abort.is_raised() {
        debug!(task = %task_name, "task cancelled before start");
        TaskOutcome::Failed(Error::Aborted.to_string())
      } else {
        debug!(task = %task_name, "task started");
        match work.await {
          Ok(()) => TaskOutcome::Ok,
          Err(err) => {
            error!(task = %task_name, error = %err, "task failed");
            inner.abort.raise();
            let message = err.to_string();
            let mut slot = inner.first_error.lock().expect("first error slot poisoned");
            if slot.is_none() {
              *slot = Some(err);
            }
            TaskOutcome::Failed(message)
          }
        }
      };

      drop(permit);
      let _ = tx.send(Some(outcome));
    });

    Ok(())
  }

  /// Block the calling task until every task registered under `group` (or a
  /// sub-name of it) has completed, then re-raise the first failure among
  /// them. Seals the group against further registration.
  ///
  /// Must be called from within a registered task: the caller's pool slot is
  /// lent back to the pool while it waits, so group waits cannot starve the
  /// producers they wait on.
  pub async fn await_group(&self, group: &str) -> Result<()> {
    let entries: Vec<(String, watch::Receiver<Option<TaskOutcome>>)> = {
      let mut state = self.inner.state.lock().expect("task graph state poisoned");
      if !state.sealed.iter().any(|g| g == group) {
        state.sealed.push(group.to_string());
      }
      state
        .tasks
        .iter()
        .filter(|t| group_contains(group, &t.name))
        .map(|t| (t.name.clone(), t.done.clone()))
        .collect()
    };

    if entries.is_empty() {
      return Ok(());
    }

    self.inner.semaphore.add_permits(1);
    let mut result = Ok(());
    for (name, mut rx) in entries {
      match wait_outcome(&mut rx).await {
        TaskOutcome::Ok => {}
        TaskOutcome::Failed(message) => {
          result = Err(Error::TaskFailed { name, message });
          break;
        }
      }
    }
    // Reclaim the lent slot before resuming our own work.
    if let Ok(permit) = self.inner.semaphore.acquire().await {
      permit.forget();
    }

    result
  }

  /// Wait for the entire graph. Surfaces the first captured error, if any;
  /// on failure, tasks that never started have resolved as aborted.
  pub async fn drain_all(&self) -> Result<()> {
    let mut first_failure: Option<(String, String)> = None;
    let mut index = 0;

    loop {
      let entry = {
        let state = self.inner.state.lock().expect("task graph state poisoned");
        state.tasks.get(index).map(|t| (t.name.clone(), t.done.clone()))
      };

      let Some((name, mut rx)) = entry else { break };
      if let TaskOutcome::Failed(message) = wait_outcome(&mut rx).await
        && first_failure.is_none()
      {
        first_failure = Some((name, message));
      }
      index += 1;
    }

    if let Some(err) = self.inner.first_error.lock().expect("first error slot poisoned").take() {
      return Err(err);
    }
    if let Some((name, message)) = first_failure {
      return Err(Error::TaskFailed { name, message });
    }
    Ok(())
  }
}

async fn wait_outcome(rx: &mut watch::Receiver<Option<TaskOutcome>>) -> TaskOutcome {
  loop {
    if let Some(outcome) = rx.borrow_and_update().clone() {
      return outcome;
    }
    if rx.changed().await.is_err() {
      // Sender dropped without a value: the task panicked.
      return TaskOutcome::Failed("task panicked".to_string());
    }
  }
}
