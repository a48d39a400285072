//! Cache Manager - Process-Scoped Cache Service
//!
//! Owns the value tables, the identifier space and the scheduler, and exposes
//! the identifier-based API. Construct one per process and share it by `Arc`.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};

use super::entry::{CacheItem, CacheValue};
use super::id::{EntityKind, Id, IdArray, IdSpace, INVALID_ID};
use super::metrics::{CacheMetrics, MetricsSnapshot};
use super::priority::LogicalClock;
use super::table::{Insertion, TableContext, ValueTable};
use super::{DEFAULT_CYCLES_PER_BYTE, DEFAULT_DATA_BUDGET, DEFAULT_SCALAR_BUDGET, DEFAULT_STRING_BUDGET};
use crate::error::{Error, Result};
use crate::scheduler::{FunctionData, RunOutcome, Scheduler, TaskState, WorkerPool};

/// Cache configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Data table budget in bytes
    pub data_budget: u64,
    /// Integer table budget in bytes
    pub integer_budget: u64,
    /// Double table budget in bytes
    pub double_budget: u64,
    /// String table budget in bytes
    pub string_budget: u64,
    /// Rebuild cost of values cached directly
    pub default_cycles_per_byte: f32,
    /// Worker threads; 0 runs tasks only through `run_next`
    pub workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_budget: DEFAULT_DATA_BUDGET,
            integer_budget: DEFAULT_SCALAR_BUDGET,
            double_budget: DEFAULT_SCALAR_BUDGET,
            string_budget: DEFAULT_STRING_BUDGET,
            default_cycles_per_byte: DEFAULT_CYCLES_PER_BYTE,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl CacheConfig {
    /// Configuration that executes tasks only on the calling thread
    pub fn inline() -> Self {
        Self {
            workers: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, budget) in [
            ("data_budget", self.data_budget),
            ("integer_budget", self.integer_budget),
            ("double_budget", self.double_budget),
            ("string_budget", self.string_budget),
        ] {
            if budget == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        if !self.default_cycles_per_byte.is_finite() || self.default_cycles_per_byte < 0.0 {
            return Err(Error::Config(format!(
                "default_cycles_per_byte must be a non-negative number, got {}",
                self.default_cycles_per_byte
            )));
        }
        Ok(())
    }
}

/// Usage of one table
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct TableStats {
    pub entries: usize,
    pub memory_used: u64,
    pub budget: u64,
}

impl TableStats {
    fn of<T: super::table::TableValue>(table: &ValueTable<T>) -> Self {
        Self {
            entries: table.len(),
            memory_used: table.memory_used(),
            budget: table.budget(),
        }
    }
}

/// Point-in-time view of the whole service
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub data: TableStats,
    pub integers: TableStats,
    pub doubles: TableStats,
    pub strings: TableStats,
    pub functions: usize,
    pub memo_entries: usize,
    pub live_tasks: usize,
    pub queued_tasks: usize,
    pub metrics: MetricsSnapshot,
}

/// The cache service
pub struct CacheManager {
    config: CacheConfig,
    ids: Arc<IdSpace>,
    metrics: Arc<CacheMetrics>,
    data: ValueTable<Option<Arc<CacheItem>>>,
    integers: ValueTable<i64>,
    doubles: ValueTable<f64>,
    strings: ValueTable<Option<Arc<str>>>,
    scheduler: Scheduler,
    workers: Mutex<Option<WorkerPool>>,
    shut_down: AtomicBool,
}

impl CacheManager {
    /// Create the service and start its workers
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let workers = config.workers;
        let manager = Arc::new(Self::build(config));
        if workers > 0 {
            let pool = WorkerPool::spawn(
                workers,
                manager.scheduler.queue().receiver(),
                Arc::downgrade(&manager),
            )?;
            *manager.workers.lock() = Some(pool);
        }
        info!(workers, "Cache service started");
        Ok(manager)
    }

    /// Default budgets with tasks run by the caller (for testing)
    pub fn inline() -> Arc<Self> {
        Arc::new(Self::build(CacheConfig::inline()))
    }

    fn build(config: CacheConfig) -> Self {
        let ctx = TableContext {
            ids: Arc::new(IdSpace::new()),
            clock: Arc::new(LogicalClock::new()),
            metrics: Arc::new(CacheMetrics::new()),
        };
        Self {
            ids: Arc::clone(&ctx.ids),
            metrics: Arc::clone(&ctx.metrics),
            data: ValueTable::new("data", EntityKind::Data, config.data_budget, ctx.clone()),
            integers: ValueTable::new("integers", EntityKind::Integer, config.integer_budget, ctx.clone()),
            doubles: ValueTable::new("doubles", EntityKind::Double, config.double_budget, ctx.clone()),
            strings: ValueTable::new("strings", EntityKind::String, config.string_budget, ctx),
            scheduler: Scheduler::new(),
            workers: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn ids(&self) -> &IdSpace {
        &self.ids
    }

    /// Entity kind of a live identifier
    pub fn kind_of(&self, id: Id) -> Option<EntityKind> {
        self.ids.kind_of(id)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    // =========================================================================
    // Value tables
    // =========================================================================

    pub fn cache_data(&self, item: CacheItem) -> Id {
        let cost = match item.cycles_to_build_per_byte() {
            cost if cost > 0.0 => cost,
            _ => self.config.default_cycles_per_byte,
        };
        let memory_used = item.memory_used();
        self.admitted(self.data.insert(Some(Arc::new(item)), memory_used, cost))
    }

    pub fn lookup_cache_item(&self, id: Id) -> Option<Arc<CacheItem>> {
        self.data.get(id).flatten()
    }

    pub fn cache_integer(&self, value: i64) -> Id {
        self.cache_value(CacheValue::Integer(value))
    }

    pub fn lookup_cache_integer(&self, id: Id) -> Option<i64> {
        self.integers.get(id)
    }

    pub fn cache_double(&self, value: f64) -> Id {
        self.cache_value(CacheValue::Double(value))
    }

    pub fn lookup_cache_double(&self, id: Id) -> Option<f64> {
        self.doubles.get(id)
    }

    pub fn cache_string(&self, value: impl Into<Arc<str>>) -> Id {
        self.cache_value(CacheValue::String(value.into()))
    }

    pub fn lookup_cache_string(&self, id: Id) -> Option<Arc<str>> {
        self.strings.get(id).flatten()
    }

    /// Cache any value in the table for its kind
    pub fn cache_value(&self, value: CacheValue) -> Id {
        self.store_value(value, self.config.default_cycles_per_byte)
    }

    /// Look up any value by identifier
    pub fn lookup_value(&self, id: Id) -> Option<CacheValue> {
        match self.ids.kind_of(id)? {
            EntityKind::Data => self
                .lookup_cache_item(id)
                .map(|item| CacheValue::Data(item.data().clone())),
            EntityKind::Integer => self.lookup_cache_integer(id).map(CacheValue::Integer),
            EntityKind::Double => self.lookup_cache_double(id).map(CacheValue::Double),
            EntityKind::String => self.lookup_cache_string(id).map(CacheValue::String),
            EntityKind::Function | EntityKind::Task => None,
        }
    }

    /// Remove a cached value; later lookups report it absent
    pub fn invalidate(&self, id: Id) -> bool {
        let removed = match self.ids.kind_of(id) {
            Some(EntityKind::Data) => self.data.remove(id),
            Some(EntityKind::Integer) => self.integers.remove(id),
            Some(EntityKind::Double) => self.doubles.remove(id),
            Some(EntityKind::String) => self.strings.remove(id),
            _ => false,
        };
        if removed {
            self.scheduler.memo().forget_value(id);
            debug!(id, "Invalidated cached value");
        }
        removed
    }

    /// Record an access to a value; false if it is gone
    pub(crate) fn touch_value(&self, id: Id) -> bool {
        match self.ids.kind_of(id) {
            Some(EntityKind::Data) => self.data.touch(id),
            Some(EntityKind::Integer) => self.integers.touch(id),
            Some(EntityKind::Double) => self.doubles.touch(id),
            Some(EntityKind::String) => self.strings.touch(id),
            _ => false,
        }
    }

    /// Store a function's output with its measured build cost
    pub(crate) fn store_output(&self, value: CacheValue, build_nanos: u64) -> Id {
        let cost = build_nanos as f32 / value.memory_used().max(1) as f32;
        match value {
            CacheValue::Data(data) => {
                let item = CacheItem::function_output(data, cost);
                let memory_used = item.memory_used();
                self.admitted(self.data.insert(Some(Arc::new(item)), memory_used, cost))
            }
            scalar => self.store_value(scalar, cost),
        }
    }

    fn store_value(&self, value: CacheValue, cost: f32) -> Id {
        let memory_used = value.memory_used();
        let insertion = match value {
            CacheValue::Integer(v) => self.integers.insert(v, memory_used, cost),
            CacheValue::Double(v) => self.doubles.insert(v, memory_used, cost),
            CacheValue::String(s) => self.strings.insert(Some(s), memory_used, cost),
            CacheValue::Data(data) => {
                let item = CacheItem::new(data).with_build_cost(cost);
                let memory_used = item.memory_used();
                self.data.insert(Some(Arc::new(item)), memory_used, cost)
            }
        };
        self.admitted(insertion)
    }

    /// Drop memo entries that read or produced evicted values
    fn admitted(&self, insertion: Insertion) -> Id {
        for evicted in &insertion.evicted {
            self.scheduler.memo().forget_value(*evicted);
        }
        insertion.id
    }

    // =========================================================================
    // Functions and tasks
    // =========================================================================

    pub fn add_function(&self, function: FunctionData) -> Id {
        let id = self.ids.mint(EntityKind::Function);
        debug!(id, name = function.name(), "Registered function");
        self.scheduler.register_function(id, function);
        id
    }

    pub fn function(&self, id: Id) -> Option<FunctionData> {
        self.scheduler.function(id)
    }

    /// Request `function` over `inputs`
    ///
    /// Returns the cached output, or the task computing it. Identical
    /// requests share one task. A `Pending` result registers the caller as a
    /// waiter that must retrieve the output once.
    #[instrument(level = "debug", skip(self, inputs))]
    pub fn run_function(&self, function: Id, inputs: impl Into<IdArray>) -> Result<RunOutcome> {
        self.ensure_running()?;
        self.scheduler.run(self, function, inputs.into())
    }

    /// Create an unqueued task that resumes `function` with `state`
    ///
    /// Register dependencies with [`wait_for_function`](Self::wait_for_function),
    /// then call [`submit_deferred`](Self::submit_deferred). The task is queued
    /// once it is submitted and every registered dependency has completed.
    /// The caller is its waiter.
    pub fn defer_function(&self, function: Id, state: impl Any + Send) -> Result<Id> {
        self.ensure_running()?;
        self.scheduler.defer(self, function, Box::new(state), false)
    }

    /// Close dependency registration on a deferred task
    ///
    /// A task with no outstanding dependencies is queued immediately.
    pub fn submit_deferred(&self, deferred: Id) -> Result<()> {
        self.ensure_running()?;
        self.scheduler.submit(self, deferred)
    }

    /// Resume `deferred` only after `dependency` completes
    pub fn wait_for_function(&self, deferred: Id, dependency: Id) -> Result<()> {
        self.wait_for_functions(deferred, &[dependency])
    }

    /// Resume `deferred` only after every task in `dependencies` completes
    pub fn wait_for_functions(&self, deferred: Id, dependencies: &[Id]) -> Result<()> {
        self.ensure_running()?;
        self.scheduler.wait(self, deferred, dependencies)
    }

    /// Poll a task's output
    ///
    /// Returns `INVALID_ID` until the task completes. A successful retrieval
    /// settles one waiter registration; do not call again for the same
    /// registration. Retrieving past the last registration panics in debug
    /// builds.
    pub fn retrieve_task_output(&self, task: Id) -> Id {
        match self.scheduler.retrieve(self, task) {
            Ok(Some(output)) => output,
            Ok(None) => INVALID_ID,
            Err(e) => {
                error!(task, error = %e, "Task output unavailable");
                INVALID_ID
            }
        }
    }

    /// Poll a task's output, surfacing failures
    pub fn try_retrieve_task_output(&self, task: Id) -> Result<Option<Id>> {
        self.scheduler.retrieve(self, task)
    }

    /// State of a live task; `None` once reclaimed
    pub fn task_state(&self, task: Id) -> Option<TaskState> {
        self.scheduler.task_state(task)
    }

    /// Execute one ready task on this thread
    pub fn run_next(&self) -> bool {
        !self.is_shut_down() && self.scheduler.run_next(self)
    }

    /// Execute ready tasks on this thread until none remain
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        while self.run_next() {
            executed += 1;
        }
        executed
    }

    pub(crate) fn execute_task(&self, task: Id) {
        if !self.is_shut_down() {
            self.scheduler.execute(self, task);
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(Error::ShutDown)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Service
    // =========================================================================

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            data: TableStats::of(&self.data),
            integers: TableStats::of(&self.integers),
            doubles: TableStats::of(&self.doubles),
            strings: TableStats::of(&self.strings),
            functions: self.scheduler.function_count(),
            memo_entries: self.scheduler.memo().len(),
            live_tasks: self.scheduler.task_count(),
            queued_tasks: self.scheduler.queued_count(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Abandon unfinished tasks, stop workers and drop every cached value
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let abandoned = self.scheduler.abandon_queued();
        let pool = self.workers.lock().take();
        if let Some(pool) = pool {
            self.scheduler.queue().stop(pool.len());
            pool.join();
        }
        let tasks = self.scheduler.clear(self);
        self.data.clear();
        self.integers.clear();
        self.doubles.clear();
        self.strings.clear();
        info!(abandoned, tasks, "Cache service shut down");
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
