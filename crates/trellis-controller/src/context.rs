//! The staged operation pipeline.
//!
//! An `OperationContext` keeps one queue of steps per stage and executes them
//! strictly in stage order: MODEL, RUNTIME, VERIFY, then DONE. Steps may add
//! steps to their own or a later stage. Every executed step is pushed on a
//! stack so that its result handler runs in reverse execution order when the
//! transaction completes, with the final `ResultAction`.
//!
//! All contexts working for one operation share a `Transaction`: the permit
//! used for the controller lock, the copy-on-write model, the capability
//! registry shadow copy and the attachments. Only the primary context
//! publishes or discards them.

use crate::attachment::{AttachmentKey, Attachments};
use crate::boot::BootErrorCollector;
use crate::cancel::CancelToken;
use crate::config::ControllerConfig;
use crate::container::ServiceContainer;
use crate::control::{PreparedTransaction, TransactionControl};
use crate::controller::Shared;
use crate::handlers::OperationStepHandler;
use crate::permit_lock::Permit;
use crate::registration::ResourceRegistration;
use crate::rendezvous::Broadcast;
use crate::{ControllerError, LockError};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use trellis_capability::{
    CapabilityRegistration, CapabilityScope, CapabilitySet, RegistrationPoint,
    RequirementRegistration, RuntimeCapability, ShadowRegistry,
};
use trellis_model::{Operation, OperationResponse, PathAddress, Resource, ServiceName};

pub const ROLLBACK_ON_RUNTIME_FAILURE: &str = "rollback-on-runtime-failure";
pub const PROCESS_STATE: &str = "process-state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Model,
    Runtime,
    Verify,
    Done,
}

impl Stage {
    fn next(self) -> Stage {
        match self {
            Stage::Model => Stage::Runtime,
            Stage::Runtime => Stage::Verify,
            Stage::Verify | Stage::Done => Stage::Done,
        }
    }

    fn queue(self) -> usize {
        match self {
            Stage::Model => 0,
            Stage::Runtime => 1,
            Stage::Verify | Stage::Done => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Model => write!(f, "model"),
            Stage::Runtime => write!(f, "runtime"),
            Stage::Verify => write!(f, "verify"),
            Stage::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultAction {
    Keep,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKind {
    /// Owns the transaction and decides commit or rollback.
    Primary,
    /// A parallel boot worker sharing the primary's transaction.
    ParallelBoot,
    /// Reads only; every mutation fails with `IllegalState`.
    ReadOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessState {
    #[default]
    Running,
    ReloadRequired,
    RestartRequired,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::ReloadRequired => write!(f, "reload-required"),
            ProcessState::RestartRequired => write!(f, "restart-required"),
        }
    }
}

/// One executed step, for the execution trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepRecord {
    pub id: usize,
    pub parent: Option<usize>,
    pub stage: Stage,
    pub operation: String,
    pub address: PathAddress,
    pub failed: bool,
}

type StepFn =
    Box<dyn FnOnce(&mut OperationContext, &Operation) -> Result<(), ControllerError> + Send>;
type ResultHandler = Box<dyn FnOnce(&mut OperationContext, ResultAction) + Send>;

enum StepHandler {
    Shared(Arc<dyn OperationStepHandler>),
    Once(StepFn),
}

struct Step {
    id: usize,
    parent: Option<usize>,
    stage: Stage,
    operation: Operation,
    handler: StepHandler,
}

struct ExecutedStep {
    id: usize,
    address: PathAddress,
    result_handler: Option<ResultHandler>,
}

#[derive(Debug)]
struct ProcessMark {
    address: PathAddress,
    target: ProcessState,
    previous: ProcessState,
    capabilities: Vec<trellis_capability::CapabilityId>,
}

/// State shared by every context working for one operation.
pub(crate) struct Transaction {
    pub(crate) permit: Permit,
    pub(crate) shared: Arc<Shared>,
    pub(crate) cancel: CancelToken,
    pub(crate) boot_errors: Option<Arc<BootErrorCollector>>,
    working_model: Mutex<Option<Resource>>,
    capabilities: Mutex<Option<ShadowRegistry>>,
    capabilities_modified: AtomicBool,
    services_touched: AtomicBool,
    attachments: Mutex<Attachments>,
    next_step_id: AtomicUsize,
}

impl Transaction {
    pub(crate) fn new(
        shared: Arc<Shared>,
        permit: Permit,
        cancel: CancelToken,
        boot_errors: Option<Arc<BootErrorCollector>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            permit,
            shared,
            cancel,
            boot_errors,
            working_model: Mutex::new(None),
            capabilities: Mutex::new(None),
            capabilities_modified: AtomicBool::new(false),
            services_touched: AtomicBool::new(false),
            attachments: Mutex::new(Attachments::default()),
            next_step_id: AtomicUsize::new(1),
        })
    }

    pub(crate) fn is_booting(&self) -> bool {
        self.boot_errors.is_some()
    }

    fn next_step_id(&self) -> usize {
        self.next_step_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Read the transaction's view of the model: the working copy once
    /// anything was written, the published model before that.
    fn with_model<R>(&self, f: impl FnOnce(&Resource) -> R) -> R {
        let working = self.working_model.lock();
        match working.as_ref() {
            Some(root) => f(root),
            None => f(&*self.shared.model.read()),
        }
    }

    fn with_model_mut<R>(&self, f: impl FnOnce(&mut Resource) -> R) -> R {
        let mut working = self.working_model.lock();
        let root = working.get_or_insert_with(|| {
            trace!("operation {} copies the model for update", self.permit);
            self.shared.model.read().clone()
        });
        f(root)
    }

    /// The shadow registry is copied on first use, which for writers is
    /// after the controller lock was taken.
    fn with_capabilities<R>(&self, f: impl FnOnce(&mut CapabilitySet) -> R) -> R {
        let mut shadow = self.capabilities.lock();
        let shadow = shadow.get_or_insert_with(|| self.shared.capabilities.create_shadow_copy());
        f(&mut **shadow)
    }

    fn read_capabilities<R>(&self, f: impl FnOnce(&CapabilitySet) -> R) -> R {
        let shadow = self.capabilities.lock();
        match shadow.as_ref() {
            Some(shadow) => f(&**shadow),
            None => self.shared.capabilities.read(f),
        }
    }

    fn publish(&self) {
        let working = self.working_model.lock().take();
        if let Some(root) = working {
            *self.shared.model.write() = root;
        }
        let shadow = self.capabilities.lock().take();
        if let Some(shadow) = shadow {
            if self.capabilities_modified.load(Ordering::SeqCst) {
                shadow.publish();
            } else {
                shadow.rollback();
            }
        }
    }

    fn discard(&self) {
        self.working_model.lock().take();
        if let Some(shadow) = self.capabilities.lock().take() {
            shadow.rollback();
        }
    }
}

pub struct OperationContext {
    tx: Arc<Transaction>,
    kind: ContextKind,
    stage: Stage,
    queues: [VecDeque<Step>; 3],
    pending_first: Vec<Step>,
    executed: Vec<ExecutedStep>,
    trace: Vec<StepRecord>,
    active_step: Option<usize>,
    current_address: PathAddress,
    result_handler: Option<ResultHandler>,
    lock_holds: u32,
    shared_holds: u32,
    lock_step: Option<usize>,
    rollback_only: bool,
    cancelled: bool,
    failure: Option<String>,
    result: Value,
    rollback_on_runtime_failure: bool,
    process_marks: Vec<ProcessMark>,
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("operation_id", &self.tx.permit)
            .field("kind", &self.kind)
            .field("stage", &self.stage)
            .field("rollback_only", &self.rollback_only)
            .finish_non_exhaustive()
    }
}

impl OperationContext {
    pub(crate) fn new(tx: Arc<Transaction>, kind: ContextKind) -> Self {
        let rollback_on_runtime_failure = !tx.is_booting();
        Self {
            tx,
            kind,
            stage: Stage::Model,
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            pending_first: Vec::new(),
            executed: Vec::new(),
            trace: Vec::new(),
            active_step: None,
            current_address: PathAddress::empty(),
            result_handler: None,
            lock_holds: 0,
            shared_holds: 0,
            lock_step: None,
            rollback_only: false,
            cancelled: false,
            failure: None,
            result: Value::Null,
            rollback_on_runtime_failure,
            process_marks: Vec::new(),
        }
    }

    /// Context for a client operation; honours its
    /// `rollback-on-runtime-failure` header.
    pub(crate) fn for_operation(tx: Arc<Transaction>, operation: &Operation) -> Self {
        let mut ctx = Self::new(tx, ContextKind::Primary);
        if let Some(flag) = operation
            .headers
            .get(ROLLBACK_ON_RUNTIME_FAILURE)
            .and_then(Value::as_bool)
        {
            ctx.rollback_on_runtime_failure = flag;
        }
        ctx
    }

    // ---- identity -------------------------------------------------------

    pub fn operation_id(&self) -> Permit {
        self.tx.permit
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn current_stage(&self) -> Stage {
        self.stage
    }

    /// Address of the operation of the step being executed.
    pub fn current_address(&self) -> &PathAddress {
        &self.current_address
    }

    pub fn is_booting(&self) -> bool {
        self.tx.is_booting()
    }

    pub fn is_rollback_on_runtime_failure(&self) -> bool {
        self.rollback_on_runtime_failure
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.tx.shared.config
    }

    pub fn root_registration(&self) -> Arc<ResourceRegistration> {
        Arc::clone(&self.tx.shared.registration)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.tx.cancel
    }

    /// Steps executed so far by this context, in execution order.
    pub fn trace(&self) -> &[StepRecord] {
        &self.trace
    }

    // ---- steps ----------------------------------------------------------

    /// Queue `handler` at the end of `stage`.
    pub fn add_step(
        &mut self,
        handler: Arc<dyn OperationStepHandler>,
        operation: Operation,
        stage: Stage,
    ) -> Result<(), ControllerError> {
        self.enqueue(StepHandler::Shared(handler), operation, stage, false)
    }

    /// Queue `handler` ahead of the steps already waiting in `stage`. Steps
    /// added this way from one step run in the order they were added.
    pub fn add_step_first(
        &mut self,
        handler: Arc<dyn OperationStepHandler>,
        operation: Operation,
        stage: Stage,
    ) -> Result<(), ControllerError> {
        self.enqueue(StepHandler::Shared(handler), operation, stage, true)
    }

    pub fn add_step_fn<F>(
        &mut self,
        stage: Stage,
        operation: Operation,
        step: F,
    ) -> Result<(), ControllerError>
    where
        F: FnOnce(&mut OperationContext, &Operation) -> Result<(), ControllerError> + Send + 'static,
    {
        self.enqueue(StepHandler::Once(Box::new(step)), operation, stage, false)
    }

    /// Queue the registered handler for `operation`.
    pub fn add_operation_step(
        &mut self,
        operation: Operation,
        stage: Stage,
    ) -> Result<(), ControllerError> {
        let handler = self.handler_for(&operation)?;
        self.add_step(handler, operation, stage)
    }

    pub fn add_operation_step_first(
        &mut self,
        operation: Operation,
        stage: Stage,
    ) -> Result<(), ControllerError> {
        let handler = self.handler_for(&operation)?;
        self.add_step_first(handler, operation, stage)
    }

    pub(crate) fn handler_for(
        &self,
        operation: &Operation,
    ) -> Result<Arc<dyn OperationStepHandler>, ControllerError> {
        self.tx
            .shared
            .registration
            .operation_handler(&operation.address, &operation.name)
            .ok_or_else(|| ControllerError::NoHandler {
                operation: operation.name.clone(),
                address: operation.address.to_string(),
            })
    }

    fn enqueue(
        &mut self,
        handler: StepHandler,
        operation: Operation,
        stage: Stage,
        first: bool,
    ) -> Result<(), ControllerError> {
        if stage < self.stage {
            return Err(ControllerError::illegal_state(format!(
                "cannot add a {stage} step while executing stage {}",
                self.stage
            )));
        }
        if stage == Stage::Done {
            return Err(ControllerError::illegal_state(
                "steps cannot be added to stage done",
            ));
        }
        let step = Step {
            id: self.tx.next_step_id(),
            parent: self.active_step,
            stage,
            operation,
            handler,
        };
        trace!(
            "queued {} step {} for {}",
            stage,
            step.id,
            step.operation
        );
        let queue = &mut self.queues[stage.queue()];
        match (first, self.active_step.is_some()) {
            (true, true) => self.pending_first.push(step),
            (true, false) => queue.push_front(step),
            (false, _) => queue.push_back(step),
        }
        Ok(())
    }

    /// Register the handler told whether the transaction was kept or rolled
    /// back. At most one per step.
    pub fn complete_step<F>(&mut self, handler: F) -> Result<(), ControllerError>
    where
        F: FnOnce(&mut OperationContext, ResultAction) + Send + 'static,
    {
        if self.active_step.is_none() {
            return Err(ControllerError::illegal_state(
                "complete_step called outside of a step",
            ));
        }
        if self.result_handler.is_some() {
            return Err(ControllerError::illegal_state("step already completed"));
        }
        self.result_handler = Some(Box::new(handler));
        Ok(())
    }

    pub fn complete_step_with_rollback<F>(&mut self, rollback: F) -> Result<(), ControllerError>
    where
        F: FnOnce(&mut OperationContext) + Send + 'static,
    {
        self.complete_step(move |ctx, action| {
            if action == ResultAction::Rollback {
                rollback(ctx);
            }
        })
    }

    pub fn set_rollback_only(&mut self) {
        if !self.rollback_only {
            debug!("operation {} marked rollback-only", self.tx.permit);
        }
        self.rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Record a failure and force rollback. The first description wins.
    pub fn fail(&mut self, description: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(description.into());
        }
        self.set_rollback_only();
    }

    pub fn failure_description(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn set_result(&mut self, result: Value) {
        self.result = result;
    }

    pub fn result(&self) -> &Value {
        &self.result
    }

    // ---- execution ------------------------------------------------------

    fn should_stop(&mut self) -> bool {
        if !self.cancelled && self.tx.cancel.is_cancelled() {
            debug!("operation {} cancelled", self.tx.permit);
            self.cancelled = true;
        }
        self.rollback_only || self.cancelled
    }

    /// Execute queued steps until `last` is drained, the transaction fails,
    /// or DONE is reached.
    pub(crate) fn execute_through(&mut self, last: Stage) {
        loop {
            if self.should_stop() || self.stage == Stage::Done {
                return;
            }
            if let Some(step) = self.queues[self.stage.queue()].pop_front() {
                self.execute_step(step);
                continue;
            }
            if self.stage >= last {
                return;
            }
            self.advance_stage();
        }
    }

    /// Run a single stage's queue. Used by parallel boot workers, whose
    /// stages are driven by the primary context.
    pub(crate) fn execute_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.execute_through(stage);
    }

    fn advance_stage(&mut self) {
        let next = self.stage.next();
        trace!("operation {}: stage {} -> {next}", self.tx.permit, self.stage);
        self.stage = next;
        if next == Stage::Verify && self.kind == ContextKind::Primary {
            self.verify();
        }
    }

    fn execute_step(&mut self, step: Step) {
        let Step {
            id,
            parent,
            stage,
            operation,
            handler,
        } = step;
        self.trace.push(StepRecord {
            id,
            parent,
            stage,
            operation: operation.name.clone(),
            address: operation.address.clone(),
            failed: false,
        });
        let record = self.trace.len() - 1;
        self.active_step = Some(id);
        self.current_address = operation.address.clone();
        self.result_handler = None;
        debug!("executing {stage} step {id} for {operation}");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match handler {
            StepHandler::Shared(handler) => handler.execute(self, &operation),
            StepHandler::Once(step) => step(self, &operation),
        }));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("unexpected failure executing {operation} in stage {stage}: {message}");
                Some(ControllerError::failed(format!(
                    "unexpected failure executing {operation}: {message}"
                )))
            }
        };

        self.executed.push(ExecutedStep {
            id,
            address: operation.address.clone(),
            result_handler: self.result_handler.take(),
        });
        for step in self.pending_first.drain(..).rev() {
            self.queues[step.stage.queue()].push_front(step);
        }
        if let Some(e) = failure {
            self.trace[record].failed = true;
            self.step_failed(e, &operation);
        }
        self.active_step = None;
    }

    fn step_failed(&mut self, e: ControllerError, operation: &Operation) {
        if matches!(e, ControllerError::Cancelled) {
            self.cancelled = true;
            return;
        }
        let description = e.to_string();
        if let Some(collector) = &self.tx.boot_errors {
            collector.record(operation, self.stage, description.clone());
        }
        if self.stage == Stage::Runtime && !self.rollback_on_runtime_failure {
            warn!("{operation} failed in stage runtime, continuing: {description}");
            return;
        }
        warn!("{operation} failed in stage {}: {description}", self.stage);
        self.fail(description);
    }

    /// Entry checks for VERIFY: container stability after service changes,
    /// then capability resolution after registry changes.
    fn verify(&mut self) {
        if self.tx.services_touched.load(Ordering::SeqCst) {
            let timeout = self.tx.shared.config.stability_timeout();
            match self.tx.shared.monitor.await_stability(timeout, &self.tx.cancel) {
                Ok(()) => {
                    if let Some(report) = self
                        .tx
                        .shared
                        .monitor
                        .create_container_state_change_report(false)
                    {
                        if report.has_new_problems() {
                            if self.rollback_on_runtime_failure {
                                self.fail(format!(
                                    "operation caused service container problems: {report}"
                                ));
                            } else {
                                warn!("service container problems after boot: {report}");
                            }
                        }
                    }
                }
                Err(ControllerError::Cancelled) => self.cancelled = true,
                Err(e) => self.fail(e.to_string()),
            }
        }
        if self.should_stop() || !self.tx.capabilities_modified.load(Ordering::SeqCst) {
            return;
        }
        let host_xml_only = self.tx.shared.config.host_xml_only;
        let validation = self.tx.with_model(|root| {
            self.tx
                .with_capabilities(|set| set.resolve_capabilities(root, host_xml_only))
        });
        if !validation.is_valid() {
            self.fail(validation.failure_description());
        }
    }

    /// Run the queued stages to DONE and complete the transaction.
    pub(crate) fn run(mut self) -> (OperationResponse, Vec<StepRecord>) {
        self.execute_through(Stage::Verify);
        let action = self.result_action();
        self.complete(action);
        let response = self.response();
        (response, self.trace)
    }

    /// Like [`Self::run`], leaving the commit decision to `control`.
    pub(crate) fn run_controlled(
        mut self,
        control: &dyn TransactionControl,
    ) -> (OperationResponse, Vec<StepRecord>) {
        self.execute_through(Stage::Verify);
        if self.result_action() == ResultAction::Rollback {
            self.complete(ResultAction::Rollback);
            let response = self.response();
            control.operation_failed(&response);
            return (response, self.trace);
        }

        let decision = Arc::new(Broadcast::new());
        let mut prepared = OperationResponse::success(self.result.clone());
        self.add_process_state(&mut prepared);
        control.operation_prepared(PreparedTransaction::new(Arc::clone(&decision)), &prepared);
        let action = decision.wait();
        if action == ResultAction::Rollback {
            debug!("operation {} rolled back by its caller", self.tx.permit);
            self.rollback_only = true;
        }
        self.complete(action);
        let response = self.response();
        control.operation_completed(&response);
        (response, self.trace)
    }

    pub(crate) fn result_action(&self) -> ResultAction {
        if self.rollback_only || self.cancelled {
            ResultAction::Rollback
        } else {
            ResultAction::Keep
        }
    }

    /// Publish or discard the transaction (primary only) and run result
    /// handlers newest first. The controller lock is released once the step
    /// that acquired it is finalized, and at the latest here.
    pub(crate) fn complete(&mut self, action: ResultAction) {
        self.stage = Stage::Done;
        let primary = self.kind == ContextKind::Primary;
        match action {
            ResultAction::Keep => {
                if primary {
                    self.tx.publish();
                }
                self.run_result_handlers(action);
                if primary && self.tx.services_touched.load(Ordering::SeqCst) {
                    self.tx.shared.monitor.reset_baseline();
                }
            }
            ResultAction::Rollback => {
                debug!("rolling back operation {}", self.tx.permit);
                self.run_result_handlers(action);
                if primary {
                    self.tx.discard();
                }
            }
        }
        self.release_locks();
    }

    fn run_result_handlers(&mut self, action: ResultAction) {
        while let Some(step) = self.executed.pop() {
            if let Some(handler) = step.result_handler {
                self.active_step = Some(step.id);
                self.current_address = step.address;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(self, action)));
                if let Err(panic) = outcome {
                    error!(
                        "result handler of step {} failed: {}",
                        step.id,
                        panic_message(panic.as_ref())
                    );
                }
                self.active_step = None;
            }
            // The lock goes once the step that took it has been finalized.
            if self.lock_step == Some(step.id) && self.kind == ContextKind::Primary {
                self.release_locks();
            }
        }
    }

    fn response(&mut self) -> OperationResponse {
        let mut response = if self.cancelled {
            OperationResponse::cancelled()
        } else if self.rollback_only {
            OperationResponse::failed(
                self.failure
                    .take()
                    .unwrap_or_else(|| "operation rolled back".to_owned()),
            )
        } else {
            OperationResponse::success(std::mem::take(&mut self.result))
        };
        self.add_process_state(&mut response);
        response
    }

    fn add_process_state(&self, response: &mut OperationResponse) {
        let state = *self.tx.shared.process_state.lock();
        if state != ProcessState::Running {
            response
                .response_headers
                .insert(PROCESS_STATE.to_owned(), Value::String(state.to_string()));
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.rollback_only || self.cancelled
    }

    pub(crate) fn take_trace(&mut self) -> Vec<StepRecord> {
        std::mem::take(&mut self.trace)
    }

    pub(crate) fn extend_trace(&mut self, records: Vec<StepRecord>) {
        self.trace.extend(records);
    }

    // ---- locking --------------------------------------------------------

    /// Take the exclusive controller lock for this operation. Read-only
    /// contexts take a shared hold instead. Held until the transaction
    /// completes.
    pub fn acquire_controller_lock(&mut self) -> Result<(), ControllerError> {
        if self.lock_holds > 0 || self.shared_holds > 0 {
            return Ok(());
        }
        let permit = self.tx.permit;
        let timeout = self.tx.shared.config.lock_timeout();
        let lock = &self.tx.shared.lock;
        if self.kind == ContextKind::ReadOnly {
            if !lock
                .try_lock_shared(permit, timeout, &self.tx.cancel)
                .map_err(lock_failure)?
            {
                return Err(lock_timeout(timeout));
            }
            self.shared_holds += 1;
            return Ok(());
        }
        let acquired = match lock.detect_deadlock_and_get_lock(permit).map_err(lock_failure)? {
            true => true,
            false => {
                debug!("operation {permit} waiting for the controller lock");
                lock.try_lock(permit, timeout, &self.tx.cancel)
                    .map_err(lock_failure)?
            }
        };
        if !acquired {
            return Err(lock_timeout(timeout));
        }
        trace!("operation {permit} acquired the controller lock");
        self.lock_holds += 1;
        self.lock_step = self.active_step;
        Ok(())
    }

    fn release_locks(&mut self) {
        let permit = self.tx.permit;
        let lock = &self.tx.shared.lock;
        if self.lock_holds > 0 {
            trace!(
                "operation {permit} releasing the controller lock taken by step {:?}",
                self.lock_step
            );
        }
        for _ in 0..self.lock_holds {
            match lock.unlock(permit) {
                Ok(true) => {}
                Ok(false) => error!("controller lock is not held by operation {permit}"),
                Err(e) => error!("releasing controller lock for operation {permit}: {e}"),
            }
        }
        for _ in 0..self.shared_holds {
            if let Err(e) = lock.unlock_shared(permit) {
                error!("releasing shared controller lock for operation {permit}: {e}");
            }
        }
        self.lock_holds = 0;
        self.shared_holds = 0;
        self.lock_step = None;
    }

    // ---- model ----------------------------------------------------------

    fn require_model_write(&mut self, what: &str) -> Result<(), ControllerError> {
        if self.kind == ContextKind::ReadOnly {
            return Err(ControllerError::illegal_state(format!(
                "{what} is not allowed in a read-only context"
            )));
        }
        if self.stage != Stage::Model {
            return Err(ControllerError::illegal_state(format!(
                "{what} is only allowed in stage model, not {}",
                self.stage
            )));
        }
        self.acquire_controller_lock()
    }

    pub fn read_resource(
        &self,
        address: &PathAddress,
        recursive: bool,
    ) -> Result<Resource, ControllerError> {
        Ok(self
            .tx
            .with_model(|root| root.read_resource(address, recursive))?)
    }

    pub fn read_model(&self, address: &PathAddress) -> Result<Map<String, Value>, ControllerError> {
        Ok(self.tx.with_model(|root| {
            root.navigate(address)
                .map(|r| r.model().clone())
                .ok_or_else(|| trellis_model::ModelError::ResourceNotFound(address.to_string()))
        })?)
    }

    pub fn resource_exists(&self, address: &PathAddress) -> bool {
        self.tx.with_model(|root| root.exists(address))
    }

    pub fn with_resource_for_update<R>(
        &mut self,
        address: &PathAddress,
        update: impl FnOnce(&mut Resource) -> R,
    ) -> Result<R, ControllerError> {
        self.require_model_write("modifying a resource")?;
        Ok(self
            .tx
            .with_model_mut(|root| root.read_resource_for_update(address).map(update))?)
    }

    pub fn create_resource(&mut self, address: &PathAddress) -> Result<(), ControllerError> {
        self.require_model_write("creating a resource")?;
        Ok(self.tx.with_model_mut(|root| root.create_resource(address))?)
    }

    pub fn add_resource(
        &mut self,
        address: &PathAddress,
        index: Option<usize>,
        resource: Resource,
    ) -> Result<(), ControllerError> {
        self.require_model_write("adding a resource")?;
        Ok(self
            .tx
            .with_model_mut(|root| root.add_resource(address, index, resource))?)
    }

    pub fn remove_resource(&mut self, address: &PathAddress) -> Result<Resource, ControllerError> {
        self.require_model_write("removing a resource")?;
        Ok(self.tx.with_model_mut(|root| root.remove_resource(address))?)
    }

    /// Reorder the root's children of `child_type` to `order`.
    pub(crate) fn sort_root_children(&mut self, child_type: &str, order: &[String]) {
        self.tx
            .with_model_mut(|root| root.sort_children(child_type, order));
    }

    // ---- capabilities ---------------------------------------------------

    fn registration_point(&self, attribute: Option<&str>) -> RegistrationPoint {
        match attribute {
            Some(attribute) => {
                RegistrationPoint::for_attribute(self.current_address.clone(), attribute)
            }
            None => RegistrationPoint::new(self.current_address.clone()),
        }
    }

    fn modify_capabilities<R>(
        &mut self,
        what: &str,
        f: impl FnOnce(&mut CapabilitySet) -> R,
    ) -> Result<R, ControllerError> {
        self.require_model_write(what)?;
        self.tx.capabilities_modified.store(true, Ordering::SeqCst);
        Ok(self.tx.with_capabilities(f))
    }

    /// Register `capability` for the current address. Dynamic capabilities
    /// take the address's last element value.
    pub fn register_capability(
        &mut self,
        capability: &RuntimeCapability,
        attribute: Option<&str>,
    ) -> Result<(), ControllerError> {
        let concrete = capability.for_address(&self.current_address);
        let scope = CapabilityScope::for_address(&self.current_address);
        let registration =
            CapabilityRegistration::new(concrete, scope, self.registration_point(attribute));
        self.modify_capabilities("registering a capability", |set| {
            set.register_capability(registration)
        })??;
        Ok(())
    }

    pub fn deregister_capability(
        &mut self,
        capability: &RuntimeCapability,
        attribute: Option<&str>,
    ) -> Result<(), ControllerError> {
        let concrete = capability.for_address(&self.current_address);
        let scope = CapabilityScope::for_address(&self.current_address);
        let point = self.registration_point(attribute);
        self.modify_capabilities("removing a capability", |set| {
            set.remove_capability(concrete.name(), &scope, &point)
        })?;
        Ok(())
    }

    pub fn register_requirement(
        &mut self,
        dependent: &str,
        required: &str,
        attribute: Option<&str>,
        runtime_only: bool,
    ) -> Result<(), ControllerError> {
        let mut requirement = RequirementRegistration::new(
            dependent,
            required,
            CapabilityScope::for_address(&self.current_address),
            self.registration_point(attribute),
        );
        if runtime_only {
            requirement = requirement.runtime_only();
        }
        self.modify_capabilities("registering a requirement", |set| {
            set.register_additional_requirement(requirement)
        })??;
        Ok(())
    }

    pub fn deregister_requirement(
        &mut self,
        dependent: &str,
        required: &str,
        attribute: Option<&str>,
    ) -> Result<(), ControllerError> {
        let hard = RequirementRegistration::new(
            dependent,
            required,
            CapabilityScope::for_address(&self.current_address),
            self.registration_point(attribute),
        );
        let soft = hard.clone().runtime_only();
        self.modify_capabilities("removing a requirement", |set| {
            set.remove_requirement(&hard);
            set.remove_requirement(&soft);
        })
    }

    /// Inspect the capability registry as this transaction sees it.
    pub fn with_capability_set<R>(&self, f: impl FnOnce(&CapabilitySet) -> R) -> R {
        self.tx.read_capabilities(f)
    }

    pub fn has_capability(&self, name: &str, scope: &CapabilityScope) -> bool {
        self.with_capability_set(|set| set.has_capability(name, scope))
    }

    // ---- services -------------------------------------------------------

    /// The service container. Asking for modification takes the controller
    /// lock and makes VERIFY wait for container stability.
    pub fn service_container(
        &mut self,
        modify: bool,
    ) -> Result<Arc<dyn ServiceContainer>, ControllerError> {
        if modify {
            if self.kind == ContextKind::ReadOnly {
                return Err(ControllerError::illegal_state(
                    "modifying services is not allowed in a read-only context",
                ));
            }
            if self.stage < Stage::Runtime {
                return Err(ControllerError::illegal_state(format!(
                    "modifying services is not allowed in stage {}",
                    self.stage
                )));
            }
            self.acquire_controller_lock()?;
            self.tx.services_touched.store(true, Ordering::SeqCst);
        }
        Ok(Arc::clone(self.tx.shared.monitor.container()))
    }

    pub fn remove_service(&mut self, name: &ServiceName) -> Result<bool, ControllerError> {
        Ok(self.service_container(true)?.remove(name))
    }

    // ---- process state --------------------------------------------------

    pub fn reload_required(&mut self) -> Result<(), ControllerError> {
        self.mark_process_state(ProcessState::ReloadRequired)
    }

    pub fn restart_required(&mut self) -> Result<(), ControllerError> {
        self.mark_process_state(ProcessState::RestartRequired)
    }

    pub fn revert_reload_required(&mut self) {
        self.revert_process_state(ProcessState::ReloadRequired);
    }

    pub fn revert_restart_required(&mut self) {
        self.revert_process_state(ProcessState::RestartRequired);
    }

    pub fn process_state(&self) -> ProcessState {
        *self.tx.shared.process_state.lock()
    }

    /// Raise the process state under the controller lock.
    fn mark_process_state(&mut self, target: ProcessState) -> Result<(), ControllerError> {
        if self.kind == ContextKind::ReadOnly {
            return Err(ControllerError::illegal_state(format!(
                "changing the process state to {target} is not allowed in a read-only context"
            )));
        }
        self.acquire_controller_lock()?;
        let previous = {
            let mut state = self.tx.shared.process_state.lock();
            let previous = *state;
            if target > previous {
                debug!("process state {previous} -> {target} by {}", self.current_address);
                *state = target;
            }
            previous
        };
        let address = self.current_address.clone();
        let capabilities = self.tx.with_capabilities(|set| match target {
            ProcessState::RestartRequired => set.capability_restart_required(&address),
            _ => set.capability_reload_required(&address),
        });
        if !capabilities.is_empty() {
            self.tx.capabilities_modified.store(true, Ordering::SeqCst);
        }
        self.process_marks.push(ProcessMark {
            address,
            target,
            previous,
            capabilities,
        });
        Ok(())
    }

    fn revert_process_state(&mut self, target: ProcessState) {
        let Some(index) = self
            .process_marks
            .iter()
            .rposition(|m| m.target == target && m.address == self.current_address)
        else {
            return;
        };
        let mark = self.process_marks.remove(index);
        {
            let mut state = self.tx.shared.process_state.lock();
            if *state == mark.target && mark.previous < mark.target {
                debug!("process state {} reverted to {}", mark.target, mark.previous);
                *state = mark.previous;
            }
        }
        self.tx.with_capabilities(|set| match target {
            ProcessState::RestartRequired => set.revert_restart_required(&mark.capabilities),
            _ => set.revert_reload_required(&mark.capabilities),
        });
    }

    // ---- attachments ----------------------------------------------------

    pub fn attach<T: Any + Send>(&self, key: AttachmentKey<T>, value: T) -> Option<T> {
        self.tx.attachments.lock().attach(key, value)
    }

    pub fn attach_if_absent<T: Any + Send + Clone>(
        &self,
        key: AttachmentKey<T>,
        value: T,
    ) -> Option<T> {
        self.tx.attachments.lock().attach_if_absent(key, value)
    }

    pub fn detach<T: Any + Send>(&self, key: AttachmentKey<T>) -> Option<T> {
        self.tx.attachments.lock().detach(key)
    }

    pub fn get_attachment<T: Any + Send + Clone>(&self, key: AttachmentKey<T>) -> Option<T> {
        self.tx.attachments.lock().get(key)
    }

    pub fn update_attachment<T, R>(&self, key: AttachmentKey<T>, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Any + Send + Default,
    {
        self.tx.attachments.lock().update(key, f)
    }

    // ---- nested read-only execution -------------------------------------

    /// Execute `operation` in a read-only context sharing this operation's
    /// transaction, and so seeing its uncommitted model.
    pub fn execute_read_only(&self, operation: Operation) -> OperationResponse {
        let mut ctx = OperationContext::new(Arc::clone(&self.tx), ContextKind::ReadOnly);
        if let Err(e) = ctx.add_operation_step(operation, Stage::Model) {
            return OperationResponse::failed(e.to_string());
        }
        ctx.run().0
    }

    pub(crate) fn transaction(&self) -> &Arc<Transaction> {
        &self.tx
    }
}

fn lock_failure(e: LockError) -> ControllerError {
    match e {
        LockError::Interrupted => ControllerError::Cancelled,
        other => ControllerError::Lock(other),
    }
}

fn lock_timeout(timeout: std::time::Duration) -> ControllerError {
    ControllerError::Timeout(format!(
        "controller lock not acquired within {} ms",
        timeout.as_millis()
    ))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
