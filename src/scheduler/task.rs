//! Task Nodes
//!
//! One node per asynchronous invocation. Nodes form an explicit dependency
//! graph: each holds a count of unsatisfied dependencies and the list of
//! tasks waiting on it. A node is locked on its own; no code path holds two
//! node locks at once.

#[cfg(debug_assertions)]
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::function::FunctionState;
use super::memo::MemoKey;
use crate::cache::{CacheValue, Id};

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TaskState {
    /// Created by deferral, waiting on dependencies
    Unqueued,
    /// Ready to run
    Queued,
    /// Executing, or waiting on the continuation it deferred to
    Running,
    /// Output available
    Completed,
    /// Function body or a dependency failed
    Failed,
}

impl TaskState {
    /// No further transitions happen from this state
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Unqueued => write!(f, "unqueued"),
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Work a task performs when it runs
pub(crate) enum TaskJob {
    /// First invocation over resolved inputs
    Invoke(Vec<CacheValue>),
    /// Resumption of a deferred computation
    Resume(FunctionState),
}

impl fmt::Debug for TaskJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskJob::Invoke(inputs) => f.debug_tuple("Invoke").field(inputs).finish(),
            TaskJob::Resume(_) => f.write_str("Resume(..)"),
        }
    }
}

/// Mutable state of one task
#[derive(Debug)]
pub(crate) struct TaskNode {
    pub function: Id,
    /// Memoization key this task computes, if any
    pub key: Option<MemoKey>,
    pub state: TaskState,
    /// Taken when the task starts running
    pub job: Option<TaskJob>,
    /// Dependencies not yet completed
    pub pending: usize,
    /// Deferring function has not returned yet
    pub held: bool,
    /// Outstanding registrations expecting to retrieve the output
    pub waiters: usize,
    /// Deferred tasks to wake on completion
    pub dependents: Vec<Id>,
    /// Task that completes with this task's output
    pub parent: Option<Id>,
    pub output: Option<Id>,
    pub failure: Option<String>,
    /// Build time spent by the tasks that forwarded to this one
    pub inherited_nanos: u64,
}

impl TaskNode {
    /// Task created by a memoization miss, ready to run
    pub fn invoke(function: Id, key: MemoKey, inputs: Vec<CacheValue>) -> Self {
        Self::with_job(function, Some(key), TaskState::Queued, TaskJob::Invoke(inputs))
    }

    /// Task created by deferral
    pub fn deferred(function: Id, state: FunctionState, held: bool) -> Self {
        let mut node = Self::with_job(function, None, TaskState::Unqueued, TaskJob::Resume(state));
        node.held = held;
        node
    }

    fn with_job(function: Id, key: Option<MemoKey>, state: TaskState, job: TaskJob) -> Self {
        Self {
            function,
            key,
            state,
            job: Some(job),
            pending: 0,
            held: false,
            waiters: 0,
            dependents: Vec::new(),
            parent: None,
            output: None,
            failure: None,
            inherited_nanos: 0,
        }
    }

    /// Move an unqueued task to queued once nothing blocks it
    pub fn try_ready(&mut self) -> bool {
        if self.state == TaskState::Unqueued && self.pending == 0 && !self.held {
            self.state = TaskState::Queued;
            true
        } else {
            false
        }
    }
}

pub(crate) type TaskRef = Arc<Mutex<TaskNode>>;

/// Reclaimed task ids remembered for over-retrieval checks
#[cfg(debug_assertions)]
const TOMBSTONE_CAPACITY: usize = 4096;

/// Most recently reclaimed task ids, oldest dropped first
#[cfg(debug_assertions)]
#[derive(Debug, Default)]
struct Tombstones {
    order: VecDeque<Id>,
    ids: HashSet<Id>,
}

#[cfg(debug_assertions)]
impl Tombstones {
    fn insert(&mut self, id: Id) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Live tasks by identifier
#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    tasks: DashMap<Id, TaskRef>,
    /// Recently reclaimed tasks, for catching retrievals past the last waiter
    #[cfg(debug_assertions)]
    reclaimed: Mutex<Tombstones>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: Id, node: TaskNode) {
        self.tasks.insert(id, Arc::new(Mutex::new(node)));
    }

    /// Node handle; the map guard is released before returning
    pub fn get(&self, id: Id) -> Option<TaskRef> {
        self.tasks.get(&id).map(|node| Arc::clone(&node))
    }

    pub fn state(&self, id: Id) -> Option<TaskState> {
        self.get(id).map(|node| node.lock().state)
    }

    pub fn remove(&self, id: Id) -> bool {
        let removed = self.tasks.remove(&id).is_some();
        #[cfg(debug_assertions)]
        {
            if removed {
                self.reclaimed.lock().insert(id);
            }
        }
        removed
    }

    /// Whether the task was reclaimed recently (debug builds only)
    pub fn was_reclaimed(&self, id: Id) -> bool {
        #[cfg(debug_assertions)]
        {
            self.reclaimed.lock().ids.contains(&id)
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = id;
            false
        }
    }

    pub fn ids(&self) -> Vec<Id> {
        self.tasks.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn clear(&self) {
        self.tasks.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
