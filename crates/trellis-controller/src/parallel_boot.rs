//! Parallel execution of subsystem boot operations.
//!
//! Subsystem operations are grouped into chunks, each run by a worker thread
//! in its own `ParallelBoot` context that shares the boot transaction. The
//! primary context coordinates the workers through three synchronization
//! points: every chunk has prepared MODEL, every chunk has prepared RUNTIME,
//! and every chunk has finalized with the primary's decision.

use crate::context::{ContextKind, OperationContext, ResultAction, Stage, StepRecord, Transaction};
use crate::rendezvous::{Arrivals, Broadcast};
use crate::ControllerError;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};
use trellis_model::{Operation, SubsystemName};

pub const SUBSYSTEM: &str = "subsystem";
pub const LOGGING_SUBSYSTEM: &str = "logging";

/// Boot operations split around the subsystem section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootPartition {
    /// Operations ahead of the first subsystem operation.
    pub before: Vec<Operation>,
    /// Subsystem operations by subsystem, in order of first appearance.
    pub subsystems: IndexMap<SubsystemName, Vec<Operation>>,
    /// Non-subsystem operations following the first subsystem operation.
    pub after: Vec<Operation>,
}

impl BootPartition {
    pub fn new(operations: Vec<Operation>) -> Self {
        let mut partition = Self::default();
        for operation in operations {
            let subsystem = operation
                .address
                .element(0)
                .filter(|e| e.key() == SUBSYSTEM)
                .map(|e| SubsystemName::new(e.value()));
            match subsystem {
                Some(name) => partition.subsystems.entry(name).or_default().push(operation),
                None if partition.subsystems.is_empty() => partition.before.push(operation),
                None => partition.after.push(operation),
            }
        }
        partition
    }

    pub fn subsystem_order(&self) -> Vec<String> {
        self.subsystems.keys().map(ToString::to_string).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootChunk {
    pub subsystems: Vec<SubsystemName>,
    pub operations: Vec<Operation>,
}

impl BootChunk {
    fn push(&mut self, name: SubsystemName, operations: Vec<Operation>) {
        self.subsystems.push(name);
        self.operations.extend(operations);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkPlan {
    /// The logging subsystem, isolated and started first.
    pub logging: Option<BootChunk>,
    pub chunks: Vec<BootChunk>,
}

impl ChunkPlan {
    pub fn len(&self) -> usize {
        self.chunks.len() + usize::from(self.logging.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subsystems per worker, logging first.
    pub fn summary(&self) -> Vec<Vec<SubsystemName>> {
        self.logging
            .iter()
            .chain(&self.chunks)
            .map(|c| c.subsystems.clone())
            .collect()
    }
}

/// Greedy bin packing: subsystems by descending operation count, the first
/// `max_parallel` each open a chunk, every later one joins the chunk with
/// the fewest operations (the earliest one on ties). Logging never shares.
pub fn plan_chunks(
    subsystems: IndexMap<SubsystemName, Vec<Operation>>,
    max_parallel: usize,
) -> ChunkPlan {
    let max_parallel = max_parallel.max(1);
    let mut plan = ChunkPlan::default();
    let mut sorted: Vec<(SubsystemName, Vec<Operation>)> = Vec::with_capacity(subsystems.len());
    for (name, operations) in subsystems {
        if name.as_str() == LOGGING_SUBSYSTEM {
            let mut chunk = BootChunk::default();
            chunk.push(name, operations);
            plan.logging = Some(chunk);
        } else {
            sorted.push((name, operations));
        }
    }
    sorted.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

    for (name, operations) in sorted {
        if plan.chunks.len() < max_parallel {
            let mut chunk = BootChunk::default();
            chunk.push(name, operations);
            plan.chunks.push(chunk);
            continue;
        }
        let smallest = plan
            .chunks
            .iter()
            .enumerate()
            .min_by_key(|(i, c)| (c.operations.len(), *i))
            .map_or(0, |(i, _)| i);
        plan.chunks[smallest].push(name, operations);
    }
    plan
}

struct BootSync {
    logging_prepared: Arrivals,
    model_prepared: Arrivals,
    runtime_go: Broadcast<bool>,
    runtime_prepared: Arrivals,
    finalize: Broadcast<ResultAction>,
    complete: Arrivals,
    model_failures: Mutex<Vec<String>>,
}

impl BootSync {
    fn new(workers: usize, logging: bool) -> Self {
        Self {
            logging_prepared: Arrivals::new(usize::from(logging)),
            model_prepared: Arrivals::new(workers),
            runtime_go: Broadcast::new(),
            runtime_prepared: Arrivals::new(workers),
            finalize: Broadcast::new(),
            complete: Arrivals::new(workers),
            model_failures: Mutex::new(Vec::new()),
        }
    }
}

#[derive(Default)]
struct Progress {
    model: bool,
    runtime: bool,
    complete: bool,
}

impl Progress {
    /// Arrive at every point this worker has not reached yet.
    fn arrive_remaining(&self, sync: &BootSync, logging: bool) {
        if !self.model {
            if logging {
                sync.logging_prepared.arrive();
            }
            sync.model_prepared.arrive();
        }
        if !self.runtime {
            sync.runtime_prepared.arrive();
        }
        if !self.complete {
            sync.complete.arrive();
        }
    }
}

type Worker = JoinHandle<Vec<StepRecord>>;

/// Queue the parallel boot of `plan` as a MODEL step of `ctx`.
pub(crate) fn add_parallel_boot_step(
    ctx: &mut OperationContext,
    plan: ChunkPlan,
    subsystem_order: Vec<String>,
    operation: Operation,
) -> Result<(), ControllerError> {
    ctx.add_step_fn(Stage::Model, operation, move |ctx, operation| {
        execute_parallel_boot(ctx, operation, plan, &subsystem_order)
    })
}

fn execute_parallel_boot(
    ctx: &mut OperationContext,
    operation: &Operation,
    plan: ChunkPlan,
    subsystem_order: &[String],
) -> Result<(), ControllerError> {
    ctx.acquire_controller_lock()?;
    let has_logging = plan.logging.is_some();
    let sync = Arc::new(BootSync::new(plan.len(), has_logging));
    let workers: Arc<Mutex<Vec<Worker>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let sync = Arc::clone(&sync);
        let workers = Arc::clone(&workers);
        ctx.complete_step(move |ctx, action| {
            sync.runtime_go.publish(false);
            sync.finalize.publish(action);
            sync.complete.wait();
            for worker in workers.lock().drain(..) {
                match worker.join() {
                    Ok(trace) => ctx.extend_trace(trace),
                    Err(_) => error!("parallel boot worker panicked while finalizing"),
                }
            }
            debug!("parallel boot finalized: {action:?}");
        })?;
    }

    info!(
        "booting {} subsystem chunks in parallel{}",
        plan.chunks.len(),
        if has_logging { " after logging" } else { "" }
    );
    let tx = Arc::clone(ctx.transaction());
    let stack_size = ctx.config().boot_stack_size;
    if let Some(chunk) = plan.logging {
        spawn_worker(&tx, &sync, &workers, chunk, true, stack_size);
        sync.logging_prepared.wait();
    }
    for chunk in plan.chunks {
        spawn_worker(&tx, &sync, &workers, chunk, false, stack_size);
    }

    sync.model_prepared.wait();
    let failures = sync.model_failures.lock().clone();
    if !failures.is_empty() {
        return Err(ControllerError::failed(format!(
            "subsystem boot failed: {}",
            failures.join("; ")
        )));
    }
    ctx.sort_root_children(SUBSYSTEM, subsystem_order);

    ctx.add_step_fn(Stage::Runtime, operation.clone(), move |_ctx, _operation| {
        sync.runtime_go.publish(true);
        sync.runtime_prepared.wait();
        Ok(())
    })
}

fn spawn_worker(
    tx: &Arc<Transaction>,
    sync: &Arc<BootSync>,
    workers: &Mutex<Vec<Worker>>,
    chunk: BootChunk,
    logging: bool,
    stack_size: usize,
) {
    let name = chunk
        .subsystems
        .first()
        .map_or_else(|| "boot".to_owned(), ToString::to_string);
    let description = chunk
        .subsystems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let worker_tx = Arc::clone(tx);
    let worker_sync = Arc::clone(sync);
    let spawned = thread::Builder::new()
        .name(format!("trellis-boot-{name}"))
        .stack_size(stack_size)
        .spawn(move || run_chunk(worker_tx, &worker_sync, chunk, logging));
    match spawned {
        Ok(handle) => workers.lock().push(handle),
        Err(e) => {
            error!("cannot start boot worker for {description}: {e}");
            sync.model_failures
                .lock()
                .push(format!("cannot start boot worker for {description}: {e}"));
            Progress::default().arrive_remaining(sync, logging);
        }
    }
}

fn run_chunk(
    tx: Arc<Transaction>,
    sync: &BootSync,
    chunk: BootChunk,
    logging: bool,
) -> Vec<StepRecord> {
    let subsystems = chunk
        .subsystems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let mut progress = Progress::default();
    let mut trace = Vec::new();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut ctx = OperationContext::new(tx, ContextKind::ParallelBoot);
        for operation in chunk.operations {
            if let Err(e) = ctx.add_operation_step(operation, Stage::Model) {
                ctx.fail(e.to_string());
            }
        }
        debug!("boot chunk [{subsystems}]: model");
        ctx.execute_stage(Stage::Model);
        if let Some(failure) = ctx.failure_description() {
            sync.model_failures
                .lock()
                .push(format!("[{subsystems}] {failure}"));
        }
        progress.model = true;
        if logging {
            sync.logging_prepared.arrive();
        }
        sync.model_prepared.arrive();

        if sync.runtime_go.wait() && !ctx.has_failed() {
            debug!("boot chunk [{subsystems}]: runtime");
            ctx.execute_stage(Stage::Runtime);
            ctx.execute_stage(Stage::Verify);
        }
        progress.runtime = true;
        sync.runtime_prepared.arrive();

        let action = sync.finalize.wait();
        ctx.complete(action);
        trace = ctx.take_trace();
        progress.complete = true;
        sync.complete.arrive();
    }));
    if let Err(panic) = outcome {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_owned());
        error!("boot chunk [{subsystems}] failed unexpectedly: {message}");
        if !progress.model {
            sync.model_failures
                .lock()
                .push(format!("[{subsystems}] unexpected failure: {message}"));
        }
        progress.arrive_remaining(sync, logging);
    }
    trace
}
