//! NEData Demo Runner
//!
//! Starts a cache service, drives a memoized workload through it and prints
//! the resulting statistics as JSON.
//!
//! # Workload
//!
//! ```text
//! fib(n) ──run_function──▶ fib(n-1), fib(n-2)
//!    │                         │ pending
//!    └──defer + wait ◀─────────┘
//!          │ both complete
//!          ▼
//!    resumed fib(n): retrieve outputs, add, complete
//! ```

use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nedata::{
    CacheConfig, CacheManager, Error, FunctionContext, FunctionData, Id, Outcome, Result,
    RunOutcome,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// NEData - memoizing cache service demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data table budget in bytes
    #[arg(long, env = "NEDATA_DATA_BUDGET", default_value_t = nedata::cache::DEFAULT_DATA_BUDGET)]
    data_budget: u64,

    /// Integer table budget in bytes
    #[arg(long, env = "NEDATA_INTEGER_BUDGET", default_value_t = nedata::cache::DEFAULT_SCALAR_BUDGET)]
    integer_budget: u64,

    /// Double table budget in bytes
    #[arg(long, env = "NEDATA_DOUBLE_BUDGET", default_value_t = nedata::cache::DEFAULT_SCALAR_BUDGET)]
    double_budget: u64,

    /// String table budget in bytes
    #[arg(long, env = "NEDATA_STRING_BUDGET", default_value_t = nedata::cache::DEFAULT_STRING_BUDGET)]
    string_budget: u64,

    /// Rebuild cost assigned to directly cached values
    #[arg(long, env = "NEDATA_CYCLES_PER_BYTE", default_value_t = nedata::cache::DEFAULT_CYCLES_PER_BYTE)]
    cycles_per_byte: f32,

    /// Worker threads (0 runs tasks on the main thread)
    #[arg(long, env = "NEDATA_WORKERS", default_value = "4")]
    workers: usize,

    /// Fibonacci index to compute
    #[arg(long, env = "NEDATA_FIB", default_value = "40")]
    fib: i64,

    /// Repeated additions to run through the memo table
    #[arg(long, env = "NEDATA_ITERATIONS", default_value = "1000")]
    iterations: i64,

    /// Seconds to wait for a result
    #[arg(long, env = "NEDATA_TIMEOUT_SECONDS", default_value = "30")]
    timeout_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            data_budget: self.data_budget,
            integer_budget: self.integer_budget,
            double_budget: self.double_budget,
            string_budget: self.string_budget,
            default_cycles_per_byte: self.cycles_per_byte,
            workers: self.workers,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting NEData demo");
    info!("  Workers: {}", args.workers);
    info!("  Fibonacci index: {}", args.fib);
    info!("  Iterations: {}", args.iterations);

    let cache = CacheManager::new(args.cache_config())?;
    let timeout = Duration::from_secs(args.timeout_seconds);

    let fib = cache.add_function(FunctionData::new("fib", fib_body).with_arity(1));
    let add = cache.add_function(
        FunctionData::new("add", |ctx| Ok(Outcome::value(ctx.integer(0)? + ctx.integer(1)?)))
            .with_arity(2),
    );

    let started = Instant::now();
    let n = cache.cache_integer(args.fib);
    let output = resolve(&cache, cache.run_function(fib, [n])?, timeout)?;
    info!(
        "fib({}) = {:?} in {:?}",
        args.fib,
        cache.lookup_cache_integer(output),
        started.elapsed()
    );

    let started = Instant::now();
    let mut total = 0i64;
    for i in 0..args.iterations {
        let inputs = [cache.cache_integer(i % 16), cache.cache_integer(1)];
        let output = resolve(&cache, cache.run_function(add, inputs)?, timeout)?;
        total += cache.lookup_cache_integer(output).unwrap_or_default();
    }
    info!(
        "{} additions summed to {} in {:?}",
        args.iterations,
        total,
        started.elapsed()
    );

    let stats = cache.stats();
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!("Failed to serialize stats: {}", e),
    }

    cache.shutdown();
    Ok(())
}

/// Block the caller until a run's output is available
fn resolve(cache: &CacheManager, outcome: RunOutcome, timeout: Duration) -> Result<Id> {
    let task = match outcome {
        RunOutcome::Cached(output) => return Ok(output),
        RunOutcome::Pending(task) => task,
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(output) = cache.try_retrieve_task_output(task)? {
            return Ok(output);
        }
        if Instant::now() >= deadline {
            return Err(Error::TaskFailed {
                task,
                reason: format!("no output after {:?}", timeout),
            });
        }
        if !cache.run_next() {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}

// =============================================================================
// Demo Functions
// =============================================================================

/// Runs of the two predecessors a deferred `fib` resumes with
struct FibState {
    parts: [RunOutcome; 2],
}

fn fib_body(ctx: &mut FunctionContext<'_>) -> Result<Outcome> {
    if let Some(FibState { parts }) = ctx.take_state::<FibState>() {
        let mut sum = 0;
        for part in parts {
            let output = match part {
                RunOutcome::Cached(output) => output,
                RunOutcome::Pending(task) => ctx.try_retrieve_task_output(task)?.ok_or_else(|| {
                    Error::FunctionFailed(format!("dependency {} resumed before completion", task))
                })?,
            };
            sum += ctx
                .cache()
                .lookup_cache_integer(output)
                .ok_or(Error::UnknownId(output))?;
        }
        return Ok(Outcome::value(sum));
    }

    let n = ctx.integer(0)?;
    if n < 2 {
        return Ok(Outcome::value(n));
    }

    let cache = ctx.cache();
    let function = ctx.function_id();
    let parts = [
        ctx.run_function(function, [cache.cache_integer(n - 1)])?,
        ctx.run_function(function, [cache.cache_integer(n - 2)])?,
    ];
    let pending: Vec<Id> = parts
        .iter()
        .filter(|part| !part.already_done())
        .map(|part| part.id())
        .collect();

    if pending.is_empty() {
        let mut sum = 0;
        for part in parts {
            sum += cache
                .lookup_cache_integer(part.id())
                .ok_or(Error::UnknownId(part.id()))?;
        }
        return Ok(Outcome::value(sum));
    }

    let deferred = ctx.defer(FibState { parts })?;
    ctx.wait_for_functions(deferred, &pending)?;
    Ok(Outcome::Deferred(deferred))
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
