//! Function Memoization & Task Scheduler
//!
//! Turns memoization misses into tasks and drives the defer / wait / retrieve
//! protocol over an explicit dependency graph.
//!
//! # Architecture
//!
//! ```text
//! run_function(f, inputs)
//!        │
//!        ▼
//! ┌──────────────┐  hit   ┌──────────────┐
//! │  MemoTable   │───────▶│ Cached(out)  │
//! └──────────────┘        └──────────────┘
//!        │ miss / in flight
//!        ▼
//! ┌──────────────┐ ready  ┌──────────────┐ run   ┌──────────────┐
//! │  TaskTable   │───────▶│  TaskQueue   │──────▶│   Workers    │
//! │ (dep graph)  │◀───────┴──────────────┘       └──────────────┘
//! └──────────────┘  complete: memo → Done, wake dependents
//! ```
//!
//! # Waiter registrations
//!
//! A task counts the parties expecting its output: every `Pending` result of
//! `run_function` and every `wait_for_function` edge is one registration, and
//! each is settled by exactly one successful retrieval. A finished task with
//! no registrations left is reclaimed; the memo table serves later lookups.
//!
//! # Lock order
//!
//! Memo key lock, then a task lock. A task lock is never held while taking a
//! memo lock, another task lock or a table lock.

mod function;
mod memo;
mod task;
mod worker;

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, error, instrument};

pub use function::{FunctionBody, FunctionContext, FunctionData, FunctionState, Outcome};
pub use memo::{MemoEntry, MemoKey, MemoLookup, MemoTable};
pub use task::TaskState;

pub(crate) use task::{TaskNode, TaskTable};
pub(crate) use worker::{TaskQueue, WorkerPool};

use crate::cache::{CacheManager, CacheValue, EntityKind, Id, IdArray};
use crate::error::{Error, Result};

/// Result of requesting a memoized invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Output already cached
    Cached(Id),
    /// Task computing the output
    Pending(Id),
}

impl RunOutcome {
    pub fn already_done(&self) -> bool {
        matches!(self, RunOutcome::Cached(_))
    }

    /// Output or task identifier
    pub fn id(&self) -> Id {
        match self {
            RunOutcome::Cached(id) | RunOutcome::Pending(id) => *id,
        }
    }
}

/// Task scheduler state owned by a [`CacheManager`]
#[derive(Debug)]
pub struct Scheduler {
    functions: DashMap<Id, FunctionData>,
    memo: MemoTable,
    tasks: TaskTable,
    queue: TaskQueue,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            functions: DashMap::new(),
            memo: MemoTable::new(),
            tasks: TaskTable::new(),
            queue: TaskQueue::new(),
        }
    }

    pub fn memo(&self) -> &MemoTable {
        &self.memo
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Live task nodes
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks waiting in the ready queue
    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn register_function(&self, id: Id, function: FunctionData) {
        self.functions.insert(id, function);
    }

    pub fn function(&self, id: Id) -> Option<FunctionData> {
        self.functions.get(&id).map(|function| function.clone())
    }

    pub fn task_state(&self, task: Id) -> Option<TaskState> {
        self.tasks.state(task)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Resolve (function, inputs) to a cached output or a task
    #[instrument(level = "debug", skip(self, cache, inputs), fields(inputs = inputs.len()))]
    pub(crate) fn run(&self, cache: &CacheManager, function: Id, inputs: IdArray) -> Result<RunOutcome> {
        let data = self
            .function(function)
            .ok_or(Error::UnknownFunction(function))?;
        if let Some(expected) = data.arity() {
            if expected != inputs.len() {
                return Err(Error::ArityMismatch {
                    function,
                    expected,
                    actual: inputs.len(),
                });
            }
        }
        let values = inputs
            .iter()
            .map(|&id| cache.lookup_value(id).ok_or(Error::UnknownId(id)))
            .collect::<Result<Vec<_>>>()?;

        let lookup = self.memo.resolve(
            MemoKey::new(function, inputs),
            |output| cache.touch_value(output),
            |task| self.add_waiter(task),
            |key| {
                let task = cache.ids().mint(EntityKind::Task);
                let mut node = TaskNode::invoke(function, key.clone(), values);
                node.waiters = 1;
                self.tasks.insert(task, node);
                task
            },
        );

        let metrics = cache.metrics();
        match lookup {
            MemoLookup::Cached(output) => {
                metrics.record_memo_hit();
                Ok(RunOutcome::Cached(output))
            }
            MemoLookup::Joined(task) => {
                metrics.record_deduplicated_run();
                debug!(task, "Joined in-flight task");
                Ok(RunOutcome::Pending(task))
            }
            MemoLookup::Created(task) => {
                metrics.record_memo_miss();
                debug!(task, "Created task");
                self.enqueue(cache, task);
                Ok(RunOutcome::Pending(task))
            }
        }
    }

    /// Create an unqueued task carrying `state`
    ///
    /// The task is held: it does not become ready before [`release_hold`],
    /// however many of its dependencies have completed. A deferral made by a
    /// running body has no waiter registration of its own, since its output
    /// goes to the task it continues; a caller's deferral registers the
    /// caller.
    ///
    /// [`release_hold`]: Self::release_hold
    pub(crate) fn defer(
        &self,
        cache: &CacheManager,
        function: Id,
        state: FunctionState,
        in_body: bool,
    ) -> Result<Id> {
        if !self.functions.contains_key(&function) {
            return Err(Error::UnknownFunction(function));
        }
        let task = cache.ids().mint(EntityKind::Task);
        let mut node = TaskNode::deferred(function, state, true);
        node.waiters = usize::from(!in_body);
        self.tasks.insert(task, node);
        cache.metrics().record_task_deferred();
        debug!(task, function, in_body, "Deferred task created");
        Ok(task)
    }

    /// Release a caller's deferral once all its dependencies are registered
    pub(crate) fn submit(&self, cache: &CacheManager, deferred: Id) -> Result<()> {
        let node = self
            .tasks
            .get(deferred)
            .ok_or(Error::UnknownTask(deferred))?;
        {
            let node = node.lock();
            match node.state {
                // A failed dependency already settled it; retrieval reports why
                TaskState::Failed => return Ok(()),
                TaskState::Unqueued if node.held && node.waiters > 0 => {}
                _ => return Err(Error::NotDeferred { task: deferred }),
            }
        }
        self.release_hold(cache, deferred, None, 0);
        Ok(())
    }

    /// Make `deferred` wait for every task in `dependencies`
    #[instrument(level = "debug", skip(self, cache))]
    pub(crate) fn wait(&self, cache: &CacheManager, deferred: Id, dependencies: &[Id]) -> Result<()> {
        if dependencies.contains(&deferred) {
            return Err(Error::SelfDependency { task: deferred });
        }
        let node = self
            .tasks
            .get(deferred)
            .ok_or(Error::UnknownTask(deferred))?;
        let dependency_nodes = dependencies
            .iter()
            .map(|&dependency| {
                self.tasks
                    .get(dependency)
                    .ok_or(Error::UnknownTask(dependency))
            })
            .collect::<Result<Vec<_>>>()?;

        {
            let mut node = node.lock();
            if node.state != TaskState::Unqueued || !node.held {
                return Err(Error::NotDeferred { task: deferred });
            }
            // Counted up front so an early completion cannot ready the task
            node.pending += dependencies.len();
        }

        let mut satisfied = 0;
        let mut failure = None;
        for (&dependency, dependency_node) in dependencies.iter().zip(&dependency_nodes) {
            let mut dependency_node = dependency_node.lock();
            match dependency_node.state {
                TaskState::Completed => {
                    dependency_node.waiters += 1;
                    satisfied += 1;
                }
                TaskState::Failed => {
                    satisfied += 1;
                    failure.get_or_insert_with(|| {
                        format!(
                            "dependency {} failed: {}",
                            dependency,
                            dependency_node.failure.as_deref().unwrap_or("unknown")
                        )
                    });
                }
                _ => {
                    dependency_node.waiters += 1;
                    dependency_node.dependents.push(deferred);
                }
            }
        }

        if let Some(reason) = failure {
            self.fail(cache, deferred, reason);
            return Ok(());
        }
        // Still held, so readiness is decided when the hold is released
        node.lock().pending -= satisfied;
        Ok(())
    }

    /// Settle one waiter registration on a finished task
    ///
    /// `Ok(None)` while the task is unfinished; nothing is consumed then.
    pub(crate) fn retrieve(&self, cache: &CacheManager, task: Id) -> Result<Option<Id>> {
        let Some(node) = self.tasks.get(task) else {
            debug_assert!(
                !self.tasks.was_reclaimed(task),
                "task {} output already retrieved by every registered waiter",
                task
            );
            return Err(Error::UnknownTask(task));
        };

        let (result, reclaim) = {
            let mut node = node.lock();
            let result = match node.state {
                TaskState::Completed => Ok(node.output),
                TaskState::Failed => Err(Error::TaskFailed {
                    task,
                    reason: node.failure.clone().unwrap_or_default(),
                }),
                _ => return Ok(None),
            };
            debug_assert!(node.waiters > 0, "task {} has no waiter left to settle", task);
            node.waiters = node.waiters.saturating_sub(1);
            (result, node.waiters == 0)
        };

        if reclaim {
            self.reclaim(cache, task);
        }
        result
    }

    /// Drop a registration that will never retrieve
    pub(crate) fn release_waiter(&self, cache: &CacheManager, task: Id) {
        let Some(node) = self.tasks.get(task) else {
            return;
        };
        let reclaim = {
            let mut node = node.lock();
            node.waiters = node.waiters.saturating_sub(1);
            node.waiters == 0 && node.state.is_terminal()
        };
        if reclaim {
            self.reclaim(cache, task);
        }
    }

    /// Let a held deferral run once its dependencies complete
    ///
    /// Returns the failure reason if the deferral already failed.
    pub(crate) fn release_hold(
        &self,
        cache: &CacheManager,
        task: Id,
        parent: Option<Id>,
        inherited_nanos: u64,
    ) -> Option<String> {
        let node = self.tasks.get(task)?;
        let (ready, failure) = {
            let mut node = node.lock();
            node.held = false;
            node.parent = parent;
            node.inherited_nanos += inherited_nanos;
            match node.state {
                TaskState::Failed => (false, node.failure.clone()),
                _ => (node.try_ready(), None),
            }
        };
        if ready {
            self.enqueue(cache, task);
        }
        failure
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute the next ready task on the calling thread
    pub(crate) fn run_next(&self, cache: &CacheManager) -> bool {
        match self.queue.try_pop() {
            Some(task) => {
                self.execute(cache, task);
                true
            }
            None => false,
        }
    }

    /// Run a queued task to completion, deferral or failure
    pub(crate) fn execute(&self, cache: &CacheManager, task: Id) {
        let Some(node) = self.tasks.get(task) else {
            return;
        };
        let (function, job) = {
            let mut node = node.lock();
            if node.state != TaskState::Queued {
                return;
            }
            let Some(job) = node.job.take() else {
                return;
            };
            node.state = TaskState::Running;
            (node.function, job)
        };

        let Some(data) = self.function(function) else {
            self.fail(cache, task, Error::UnknownFunction(function).to_string());
            return;
        };

        debug!(task, function = data.name(), "Running task");
        let mut ctx = FunctionContext::new(cache, task, function, job);
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| data.call(&mut ctx)))
            .unwrap_or_else(|payload| Err(Error::FunctionFailed(panic_message(payload.as_ref()))));
        let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        cache.metrics().record_task_executed();

        let (pinned, deferred) = ctx.finish();
        for pinned in pinned {
            self.release_waiter(cache, pinned);
        }

        let continuation = match &result {
            Ok(Outcome::Deferred(next)) if deferred.contains(next) => Some(*next),
            _ => None,
        };
        for held in deferred.iter().filter(|held| Some(**held) != continuation) {
            self.release_hold(cache, *held, None, 0);
        }

        match result {
            Ok(Outcome::Value(value)) => self.complete(cache, task, value, nanos),
            Ok(Outcome::Deferred(next)) => match continuation {
                Some(next) => {
                    debug!(task, next, "Task continues in deferred task");
                    if let Some(reason) = self.release_hold(cache, next, Some(task), nanos) {
                        self.fail(cache, task, reason);
                    }
                }
                None => self.fail(cache, task, Error::InvalidDeferral { task: next }.to_string()),
            },
            Err(e) => self.fail(cache, task, e.to_string()),
        }
    }

    /// Store a task's value and complete it and every task it continues
    fn complete(&self, cache: &CacheManager, task: Id, value: CacheValue, nanos: u64) {
        let Some(node) = self.tasks.get(task) else {
            return;
        };
        let inherited = node.lock().inherited_nanos;
        let output = cache.store_output(value, nanos.saturating_add(inherited));

        let mut current = Some(task);
        while let Some(id) = current {
            let Some(node) = self.tasks.get(id) else {
                break;
            };
            let key = node.lock().key.clone();
            if let Some(key) = &key {
                self.memo.complete(key, output);
            }
            let (dependents, parent, reclaim) = {
                let mut node = node.lock();
                node.state = TaskState::Completed;
                node.output = Some(output);
                (
                    std::mem::take(&mut node.dependents),
                    node.parent,
                    node.waiters == 0,
                )
            };
            debug!(task = id, output, dependents = dependents.len(), "Task completed");

            for dependent in dependents {
                self.wake(cache, dependent);
            }
            if reclaim {
                self.reclaim(cache, id);
            }
            current = parent;
        }
    }

    /// Mark a task and everything depending on it as failed
    fn fail(&self, cache: &CacheManager, task: Id, reason: String) {
        let mut work = vec![(task, reason)];
        while let Some((id, reason)) = work.pop() {
            let Some(node) = self.tasks.get(id) else {
                continue;
            };
            let (key, dependents, parent, reclaim) = {
                let mut node = node.lock();
                if node.state.is_terminal() {
                    continue;
                }
                node.state = TaskState::Failed;
                node.failure = Some(reason.clone());
                node.job = None;
                let dependents = std::mem::take(&mut node.dependents);
                // Dependents never retrieve from a failed task
                node.waiters = node.waiters.saturating_sub(dependents.len());
                (node.key.clone(), dependents, node.parent, node.waiters == 0)
            };
            if let Some(key) = &key {
                self.memo.abandon(key, id);
            }
            cache.metrics().record_task_failed();
            error!(task = id, reason = %reason, "Task failed");

            for dependent in dependents {
                work.push((dependent, format!("dependency {} failed: {}", id, reason)));
            }
            if let Some(parent) = parent {
                work.push((parent, reason));
            }
            if reclaim {
                self.reclaim(cache, id);
            }
        }
    }

    fn wake(&self, cache: &CacheManager, task: Id) {
        let Some(node) = self.tasks.get(task) else {
            return;
        };
        let ready = {
            let mut node = node.lock();
            node.pending = node.pending.saturating_sub(1);
            node.try_ready()
        };
        if ready {
            debug!(task, "Deferred task ready");
            self.enqueue(cache, task);
        }
    }

    fn add_waiter(&self, task: Id) {
        if let Some(node) = self.tasks.get(task) {
            node.lock().waiters += 1;
        }
    }

    fn enqueue(&self, cache: &CacheManager, task: Id) {
        cache.metrics().record_task_queued();
        self.queue.push(task);
    }

    fn reclaim(&self, cache: &CacheManager, task: Id) {
        if self.tasks.remove(task) {
            cache.ids().retire(task);
            cache.metrics().record_task_reclaimed();
            debug!(task, "Reclaimed task");
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Drop queued work, returning the number of abandoned tasks
    pub(crate) fn abandon_queued(&self) -> usize {
        self.queue.drain()
    }

    /// Forget every task, memo entry and function
    pub(crate) fn clear(&self, cache: &CacheManager) -> usize {
        let tasks = self.tasks.ids();
        for task in &tasks {
            cache.ids().retire(*task);
        }
        for function in self.functions.iter() {
            cache.ids().retire(*function.key());
        }
        self.tasks.clear();
        self.memo.clear();
        self.functions.clear();
        tasks.len()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn add(cache: &CacheManager) -> Id {
        cache.add_function(
            FunctionData::new("add", |ctx| {
                Ok(Outcome::value(ctx.integer(0)? + ctx.integer(1)?))
            })
            .with_arity(2),
        )
    }

    #[test]
    fn test_run_outcome_accessors() {
        assert!(RunOutcome::Cached(3).already_done());
        assert!(!RunOutcome::Pending(3).already_done());
        assert_eq!(RunOutcome::Pending(9).id(), 9);
    }

    #[test]
    fn test_run_rejects_bad_calls() {
        let cache = CacheManager::inline();
        let f = add(&cache);
        let two = cache.cache_integer(2);

        assert_matches!(cache.run_function(12345, [two, two]), Err(Error::UnknownFunction(12345)));
        assert_matches!(
            cache.run_function(f, [two]),
            Err(Error::ArityMismatch { expected: 2, actual: 1, .. })
        );
        assert_matches!(cache.run_function(f, [two, 777]), Err(Error::UnknownId(777)));
        assert_eq!(cache.scheduler().task_count(), 0);
    }

    #[test]
    fn test_identical_requests_share_one_task() {
        let cache = CacheManager::inline();
        let f = add(&cache);
        let inputs = [cache.cache_integer(1), cache.cache_integer(2)];

        let first = cache.run_function(f, inputs).unwrap();
        let second = cache.run_function(f, inputs).unwrap();
        assert_matches!(first, RunOutcome::Pending(_));
        assert_eq!(first, second);
        assert_eq!(cache.scheduler().queued_count(), 1);
        assert_eq!(cache.metrics().deduplicated_runs(), 1);
    }

    #[test]
    fn test_waiters_settle_then_reclaim() {
        let cache = CacheManager::inline();
        let f = add(&cache);
        let inputs = [cache.cache_integer(1), cache.cache_integer(2)];
        let task = cache.run_function(f, inputs).unwrap().id();
        cache.run_function(f, inputs).unwrap();

        assert_eq!(cache.try_retrieve_task_output(task), Ok(None));
        cache.run_until_idle();

        let output = cache.retrieve_task_output(task);
        assert_eq!(cache.lookup_cache_integer(output), Some(3));
        assert_eq!(cache.task_state(task), Some(TaskState::Completed));

        assert_eq!(cache.retrieve_task_output(task), output);
        assert_eq!(cache.task_state(task), None);
    }

    #[test]
    fn test_failing_body_marks_task_failed() {
        let cache = CacheManager::inline();
        let f = cache.add_function(FunctionData::new("boom", |_ctx| {
            Err(Error::FunctionFailed("boom".into()))
        }));
        let task = cache.run_function(f, IdArray::default()).unwrap().id();
        cache.run_until_idle();

        assert_eq!(cache.task_state(task), Some(TaskState::Failed));
        assert_matches!(
            cache.try_retrieve_task_output(task),
            Err(Error::TaskFailed { reason, .. }) if reason.contains("boom")
        );
        assert_eq!(cache.task_state(task), None);

        // Failure is not memoized; a new request retries
        let retry = cache.run_function(f, IdArray::default()).unwrap();
        assert_ne!(retry.id(), task);
    }

    #[test]
    fn test_panicking_body_fails_task() {
        let cache = CacheManager::inline();
        let f = cache.add_function(FunctionData::new("panics", |_ctx| panic!("bad input")));
        let task = cache.run_function(f, IdArray::default()).unwrap().id();
        cache.run_until_idle();

        assert_matches!(
            cache.try_retrieve_task_output(task),
            Err(Error::TaskFailed { reason, .. }) if reason.contains("bad input")
        );
    }

    #[test]
    fn test_wait_rejects_misuse() {
        let cache = CacheManager::inline();
        let f = add(&cache);
        let inputs = [cache.cache_integer(1), cache.cache_integer(2)];
        let running = cache.run_function(f, inputs).unwrap().id();
        let deferred = cache.defer_function(f, ()).unwrap();

        assert_matches!(
            cache.wait_for_function(deferred, deferred),
            Err(Error::SelfDependency { .. })
        );
        assert_matches!(cache.wait_for_function(deferred, 999), Err(Error::UnknownTask(999)));
        assert_matches!(
            cache.wait_for_function(running, deferred),
            Err(Error::NotDeferred { .. })
        );
        assert_matches!(cache.defer_function(4242, ()), Err(Error::UnknownFunction(4242)));
    }

    #[test]
    fn test_dependency_failure_propagates() {
        let cache = CacheManager::inline();
        let boom = cache.add_function(FunctionData::new("boom", |_ctx| {
            Err(Error::FunctionFailed("no".into()))
        }));
        let after = cache.add_function(FunctionData::new("after", |_ctx| Ok(Outcome::value(1i64))));

        let failing = cache.run_function(boom, IdArray::default()).unwrap().id();
        let deferred = cache.defer_function(after, ()).unwrap();
        cache.wait_for_function(deferred, failing).unwrap();
        cache.run_until_idle();

        assert_eq!(cache.task_state(deferred), Some(TaskState::Failed));
        // Submitting after the dependency failed is harmless
        cache.submit_deferred(deferred).unwrap();
        assert_matches!(
            cache.try_retrieve_task_output(deferred),
            Err(Error::TaskFailed { reason, .. }) if reason.contains("dependency")
        );
    }

    #[test]
    fn test_invalid_deferral_fails_task() {
        let cache = CacheManager::inline();
        let other = cache.add_function(FunctionData::new("other", |_ctx| Ok(Outcome::value(0i64))));
        let stray = cache.defer_function(other, ()).unwrap();
        let f = cache.add_function(FunctionData::new("liar", move |_ctx| Ok(Outcome::Deferred(stray))));

        let task = cache.run_function(f, IdArray::default()).unwrap().id();
        cache.run_until_idle();
        assert_matches!(
            cache.try_retrieve_task_output(task),
            Err(Error::TaskFailed { .. })
        );
        // The stray deferral is untouched
        assert_eq!(cache.task_state(stray), Some(TaskState::Unqueued));
    }

    #[test]
    fn test_output_value_kinds() {
        let cache = CacheManager::inline();
        let text = cache.add_function(FunctionData::new("text", |_ctx| Ok(Outcome::value("hi"))));
        let blob = cache.add_function(FunctionData::new("blob", |_ctx| {
            Ok(Outcome::value(bytes::Bytes::from_static(b"raw")))
        }));

        let t = cache.run_function(text, IdArray::default()).unwrap().id();
        let b = cache.run_function(blob, IdArray::default()).unwrap().id();
        cache.run_until_idle();

        let t = cache.retrieve_task_output(t);
        let b = cache.retrieve_task_output(b);
        assert_eq!(cache.lookup_cache_string(t).as_deref(), Some("hi"));
        let item = cache.lookup_cache_item(b).unwrap();
        assert_eq!(item.kind(), crate::cache::ItemKind::FunctionOutput);
        assert_eq!(cache.lookup_value(b), Some(CacheValue::Data(bytes::Bytes::from_static(b"raw"))));
    }
}
