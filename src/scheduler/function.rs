//! Function Descriptors and Execution Context
//!
//! A function is a named body plus an optional arity. The body receives a
//! [`FunctionContext`] and either produces a value or defers to a
//! continuation task that waits on other tasks.
//!
//! # Deferral protocol
//!
//! ```text
//! body(ctx):
//!   run_function(g, inputs) -> Pending(t)
//!   d = ctx.defer(state)            // Unqueued, held until body returns
//!   ctx.wait_for_function(d, t)
//!   return Outcome::Deferred(d)     // d resumes after t; its output is ours
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::task::TaskJob;
use super::RunOutcome;
use crate::cache::{CacheManager, CacheValue, Id, IdArray, INVALID_ID};
use crate::error::{Error, Result};

/// Resumable state carried by a deferred task
pub type FunctionState = Box<dyn Any + Send>;

/// Result of running a function body once
#[derive(Debug)]
pub enum Outcome {
    /// Finished with a value
    Value(CacheValue),
    /// Continues in a task created by [`FunctionContext::defer`]
    Deferred(Id),
}

impl Outcome {
    pub fn value(value: impl Into<CacheValue>) -> Self {
        Outcome::Value(value.into())
    }
}

/// Signature of a function body
pub type FunctionBody = dyn Fn(&mut FunctionContext<'_>) -> Result<Outcome> + Send + Sync;

/// Immutable function descriptor
#[derive(Clone)]
pub struct FunctionData {
    name: Arc<str>,
    arity: Option<usize>,
    body: Arc<FunctionBody>,
}

impl FunctionData {
    pub fn new<F>(name: impl Into<Arc<str>>, body: F) -> Self
    where
        F: Fn(&mut FunctionContext<'_>) -> Result<Outcome> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity: None,
            body: Arc::new(body),
        }
    }

    /// Require exactly `arity` inputs
    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> Option<usize> {
        self.arity
    }

    pub(crate) fn call(&self, ctx: &mut FunctionContext<'_>) -> Result<Outcome> {
        (self.body)(ctx)
    }
}

impl fmt::Debug for FunctionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionData")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// FunctionContext
// =============================================================================

/// Handle a running function body uses to read inputs and schedule work
///
/// A first invocation sees the resolved input values. A resumed deferral sees
/// no inputs and gets its state back through [`take_state`](Self::take_state).
pub struct FunctionContext<'a> {
    cache: &'a CacheManager,
    task: Id,
    function: Id,
    inputs: Vec<CacheValue>,
    state: Option<FunctionState>,
    /// Tasks this body started or joined and has not retrieved
    pinned: Vec<Id>,
    /// Tasks this body deferred
    deferred: Vec<Id>,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(cache: &'a CacheManager, task: Id, function: Id, job: TaskJob) -> Self {
        let (inputs, state) = match job {
            TaskJob::Invoke(inputs) => (inputs, None),
            TaskJob::Resume(state) => (Vec::new(), Some(state)),
        };
        Self {
            cache,
            task,
            function,
            inputs,
            state,
            pinned: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Task executing this body
    pub fn task_id(&self) -> Id {
        self.task
    }

    pub fn function_id(&self) -> Id {
        self.function
    }

    pub fn cache(&self) -> &'a CacheManager {
        self.cache
    }

    pub fn inputs(&self) -> &[CacheValue] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> Result<&CacheValue> {
        self.inputs.get(index).ok_or_else(|| {
            Error::FunctionFailed(format!(
                "input {} missing ({} provided)",
                index,
                self.inputs.len()
            ))
        })
    }

    pub fn integer(&self, index: usize) -> Result<i64> {
        let value = self.input(index)?;
        value
            .as_integer()
            .ok_or_else(|| Self::type_error(index, "integer", value))
    }

    pub fn double(&self, index: usize) -> Result<f64> {
        let value = self.input(index)?;
        value
            .as_double()
            .ok_or_else(|| Self::type_error(index, "double", value))
    }

    pub fn string(&self, index: usize) -> Result<&str> {
        let value = self.input(index)?;
        value
            .as_str()
            .ok_or_else(|| Self::type_error(index, "string", value))
    }

    pub fn data(&self, index: usize) -> Result<&Bytes> {
        let value = self.input(index)?;
        value
            .as_data()
            .ok_or_else(|| Self::type_error(index, "data", value))
    }

    /// Whether this run resumes a deferral
    pub fn is_resumed(&self) -> bool {
        self.state.is_some()
    }

    /// Take the deferred state if it has type `S`
    pub fn take_state<S: Any>(&mut self) -> Option<S> {
        match self.state.take()?.downcast::<S>() {
            Ok(state) => Some(*state),
            Err(state) => {
                self.state = Some(state);
                None
            }
        }
    }

    /// Run or join a memoized invocation
    ///
    /// A pending result stays alive at least until this body returns.
    pub fn run_function(&mut self, function: Id, inputs: impl Into<IdArray>) -> Result<RunOutcome> {
        let outcome = self.cache.run_function(function, inputs)?;
        if let RunOutcome::Pending(task) = outcome {
            self.pinned.push(task);
        }
        Ok(outcome)
    }

    /// Defer this function with `state`
    pub fn defer(&mut self, state: impl Any + Send) -> Result<Id> {
        self.defer_function(self.function, state)
    }

    /// Create an unqueued task for `function`, held until this body returns
    pub fn defer_function(&mut self, function: Id, state: impl Any + Send) -> Result<Id> {
        let task = self
            .cache
            .scheduler()
            .defer(self.cache, function, Box::new(state), true)?;
        self.deferred.push(task);
        Ok(task)
    }

    pub fn wait_for_function(&mut self, deferred: Id, dependency: Id) -> Result<()> {
        self.cache.wait_for_function(deferred, dependency)
    }

    pub fn wait_for_functions(&mut self, deferred: Id, dependencies: &[Id]) -> Result<()> {
        self.cache.wait_for_functions(deferred, dependencies)
    }

    /// Poll a task; see [`CacheManager::retrieve_task_output`]
    pub fn retrieve_task_output(&mut self, task: Id) -> Id {
        let output = self.cache.retrieve_task_output(task);
        if output != INVALID_ID {
            self.unpin(task);
        }
        output
    }

    pub fn try_retrieve_task_output(&mut self, task: Id) -> Result<Option<Id>> {
        let result = self.cache.try_retrieve_task_output(task);
        if !matches!(result, Ok(None)) {
            self.unpin(task);
        }
        result
    }

    /// Pinned and deferred tasks still owned by this body
    pub(crate) fn finish(self) -> (Vec<Id>, Vec<Id>) {
        (self.pinned, self.deferred)
    }

    fn unpin(&mut self, task: Id) {
        if let Some(position) = self.pinned.iter().position(|pinned| *pinned == task) {
            self.pinned.swap_remove(position);
        }
    }

    fn type_error(index: usize, expected: &str, value: &CacheValue) -> Error {
        Error::FunctionFailed(format!(
            "input {} is {}, expected {}",
            index,
            value.kind(),
            expected
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
