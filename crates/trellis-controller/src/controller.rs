use crate::boot::{BootErrorCollector, BootOutcome};
use crate::cancel::CancelToken;
use crate::config::ControllerConfig;
use crate::container::{ContainerStateMonitor, ServiceContainer};
use crate::context::{
    panic_message, ContextKind, OperationContext, ProcessState, Stage, StepRecord, Transaction,
};
use crate::control::TransactionControl;
use crate::parallel_boot::{add_parallel_boot_step, plan_chunks, BootPartition};
use crate::permit_lock::{Permit, PermitLock};
use crate::registration::ResourceRegistration;
use crate::ControllerError;
use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use trellis_capability::{CapabilityRegistry, CapabilitySet, RuntimeStatus};
use trellis_model::{Operation, OperationResponse, PathAddress, Resource, SubsystemName};

const BOOT_OPERATION: &str = "boot";

/// State shared by every operation executed by one controller.
pub(crate) struct Shared {
    pub(crate) lock: PermitLock,
    pub(crate) model: RwLock<Resource>,
    pub(crate) capabilities: Arc<CapabilityRegistry>,
    pub(crate) registration: Arc<ResourceRegistration>,
    pub(crate) monitor: ContainerStateMonitor,
    pub(crate) process_state: Mutex<ProcessState>,
    pub(crate) config: ControllerConfig,
    active: Mutex<BTreeMap<Permit, CancelToken>>,
    active_changed: Condvar,
    next_permit: AtomicU64,
}

impl Shared {
    fn begin(&self, cancel: CancelToken) -> Permit {
        let permit = self.next_permit.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(permit, cancel);
        permit
    }

    fn end(&self, permit: Permit) {
        self.active.lock().remove(&permit);
        self.active_changed.notify_all();
    }

    fn await_inactive(&self, permit: Permit) {
        let mut active = self.active.lock();
        while active.contains_key(&permit) {
            self.active_changed.wait(&mut active);
        }
    }
}

/// Entry point for executing management operations against one model.
#[derive(Clone)]
pub struct ModelController {
    shared: Arc<Shared>,
}

impl fmt::Debug for ModelController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelController")
            .field("config", &self.shared.config)
            .field("active", &self.active_operations())
            .finish_non_exhaustive()
    }
}

impl ModelController {
    pub fn new(
        registration: ResourceRegistration,
        container: Arc<dyn ServiceContainer>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                lock: PermitLock::new(),
                model: RwLock::new(Resource::new()),
                capabilities: CapabilityRegistry::new(),
                registration: Arc::new(registration),
                monitor: ContainerStateMonitor::new(container),
                process_state: Mutex::new(ProcessState::Running),
                config,
                active: Mutex::new(BTreeMap::new()),
                active_changed: Condvar::new(),
                next_permit: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Execute `operation` on the calling thread.
    pub fn execute(&self, operation: Operation) -> OperationResponse {
        self.execute_traced(operation).0
    }

    /// Like [`Self::execute`], also returning every step executed.
    pub fn execute_traced(&self, operation: Operation) -> (OperationResponse, Vec<StepRecord>) {
        let cancel = CancelToken::new();
        let permit = self.shared.begin(cancel.clone());
        let outcome = run_operation(&self.shared, permit, cancel, operation);
        self.shared.end(permit);
        outcome
    }

    /// Execute `operation` on the calling thread, letting `control` decide
    /// whether a prepared transaction is committed.
    pub fn execute_with_control(
        &self,
        operation: Operation,
        control: &dyn TransactionControl,
    ) -> OperationResponse {
        let cancel = CancelToken::new();
        let permit = self.shared.begin(cancel.clone());
        debug!("operation {permit}: {operation} (controlled)");
        let tx = Transaction::new(Arc::clone(&self.shared), permit, cancel, None);
        let mut ctx = OperationContext::for_operation(tx, &operation);
        let response = match ctx.add_operation_step(operation, Stage::Model) {
            Ok(()) => ctx.run_controlled(control).0,
            Err(e) => {
                let response = OperationResponse::failed(e.to_string());
                control.operation_failed(&response);
                response
            }
        };
        self.shared.end(permit);
        response
    }

    /// Execute `operation` on its own thread.
    pub fn execute_async(&self, operation: Operation) -> Result<OperationHandle, ControllerError> {
        let cancel = CancelToken::new();
        let permit = self.shared.begin(cancel.clone());
        let shared = Arc::clone(&self.shared);
        let worker_cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("trellis-op-{permit}"))
            .spawn(move || {
                let outcome = run_operation(&shared, permit, worker_cancel, operation);
                shared.end(permit);
                outcome
            });
        match spawned {
            Ok(handle) => Ok(OperationHandle {
                permit,
                cancel,
                shared: Arc::clone(&self.shared),
                handle,
            }),
            Err(e) => {
                self.shared.end(permit);
                Err(ControllerError::failed(format!(
                    "cannot start operation thread: {e}"
                )))
            }
        }
    }

    /// Boot the model from `operations`, running subsystem operations in
    /// parallel when configured. Runs on a dedicated thread sized by
    /// `boot_stack_size`. A panic on that thread fails the boot, but a stack
    /// overflow aborts the process, so deep operation graphs need the size
    /// raised before booting.
    pub fn boot(&self, operations: Vec<Operation>) -> BootOutcome {
        let started_at = Utc::now();
        let count = operations.len();
        let stack_size = self.shared.config.boot_stack_size;
        let shared = Arc::clone(&self.shared);
        info!("booting {count} operations");

        let spawned = thread::Builder::new()
            .name("trellis-boot".to_owned())
            .stack_size(stack_size)
            .spawn(move || boot_operations(&shared, operations));
        let result = match spawned {
            Ok(handle) => handle
                .join()
                .map_err(|panic| boot_thread_panicked(panic.as_ref())),
            Err(e) => Err(format!(
                "cannot start boot thread with a {stack_size} byte stack: {e}; \
                 lower boot_stack_size"
            )),
        };

        let (response, errors, chunks) = match result {
            Ok(booted) => booted,
            Err(description) => {
                error!("{description}");
                (OperationResponse::failed(description), Vec::new(), Vec::new())
            }
        };
        let success = response.is_success();
        if success {
            info!("boot complete with {} operation errors", errors.len());
        } else {
            warn!(
                "boot failed: {}",
                response.failure_description.as_deref().unwrap_or("unknown")
            );
        }
        BootOutcome {
            success,
            response,
            errors,
            chunks,
            operations: count,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// A copy of the published model.
    pub fn model(&self) -> Resource {
        self.shared.model.read().clone()
    }

    /// A copy of the published capability registry.
    pub fn capabilities(&self) -> CapabilitySet {
        self.shared.capabilities.snapshot()
    }

    pub fn process_state(&self) -> ProcessState {
        *self.shared.process_state.lock()
    }

    pub fn runtime_status(&self, address: &PathAddress) -> RuntimeStatus {
        let registration = &*self.shared.registration;
        self.shared
            .capabilities
            .read(|set| set.runtime_status(address, registration))
    }

    /// Ids of operations currently executing.
    pub fn active_operations(&self) -> Vec<Permit> {
        self.shared.active.lock().keys().copied().collect()
    }

    /// Cancel a running operation by id. Returns `false` if it is not active.
    pub fn cancel(&self, permit: Permit) -> bool {
        match self.shared.active.lock().get(&permit) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// An operation executing on another thread.
pub struct OperationHandle {
    permit: Permit,
    cancel: CancelToken,
    shared: Arc<Shared>,
    handle: JoinHandle<(OperationResponse, Vec<StepRecord>)>,
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("permit", &self.permit)
            .finish_non_exhaustive()
    }
}

impl OperationHandle {
    pub fn operation_id(&self) -> Permit {
        self.permit
    }

    /// Request cancellation and block until the operation has unwound and
    /// released the controller lock.
    pub fn cancel(&self) {
        debug!("cancelling operation {}", self.permit);
        self.cancel.cancel();
        self.shared.await_inactive(self.permit);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn wait(self) -> OperationResponse {
        self.wait_traced().0
    }

    pub fn wait_traced(self) -> (OperationResponse, Vec<StepRecord>) {
        self.handle.join().unwrap_or_else(|_| {
            (
                OperationResponse::failed("operation thread failed unexpectedly"),
                Vec::new(),
            )
        })
    }
}

fn run_operation(
    shared: &Arc<Shared>,
    permit: Permit,
    cancel: CancelToken,
    operation: Operation,
) -> (OperationResponse, Vec<StepRecord>) {
    debug!("operation {permit}: {operation}");
    let tx = Transaction::new(Arc::clone(shared), permit, cancel, None);
    let mut ctx = OperationContext::for_operation(tx, &operation);
    if let Err(e) = ctx.add_operation_step(operation, Stage::Model) {
        return (OperationResponse::failed(e.to_string()), Vec::new());
    }
    ctx.run()
}

type Booted = (
    OperationResponse,
    Vec<crate::boot::BootError>,
    Vec<Vec<SubsystemName>>,
);

fn boot_operations(shared: &Arc<Shared>, operations: Vec<Operation>) -> Booted {
    let cancel = CancelToken::new();
    let permit = shared.begin(cancel.clone());
    let collector = Arc::new(BootErrorCollector::new());
    let tx = Transaction::new(Arc::clone(shared), permit, cancel, Some(Arc::clone(&collector)));
    let mut ctx = OperationContext::new(tx, ContextKind::Primary);

    let mut chunks = Vec::new();
    let queued = if shared.config.parallel_boot {
        let partition = BootPartition::new(operations);
        let order = partition.subsystem_order();
        let plan = plan_chunks(partition.subsystems, shared.config.max_parallel_boot_tasks);
        chunks = plan.summary();
        queue_all(&mut ctx, partition.before)
            .and_then(|()| {
                if plan.is_empty() {
                    return Ok(());
                }
                add_parallel_boot_step(
                    &mut ctx,
                    plan,
                    order,
                    Operation::new(BOOT_OPERATION, PathAddress::empty()),
                )
            })
            .and_then(|()| queue_all(&mut ctx, partition.after))
    } else {
        queue_all(&mut ctx, operations)
    };

    let response = match queued {
        Ok(()) => ctx.run().0,
        Err(e) => OperationResponse::failed(e.to_string()),
    };
    shared.end(permit);
    (response, collector.errors(), chunks)
}

fn queue_all(ctx: &mut OperationContext, operations: Vec<Operation>) -> Result<(), ControllerError> {
    operations
        .into_iter()
        .try_for_each(|operation| ctx.add_operation_step(operation, Stage::Model))
}

fn boot_thread_panicked(panic: &(dyn Any + Send)) -> String {
    format!("boot thread panicked: {}", panic_message(panic))
}
