//! Controller lock exclusivity, cancellation and lock timeouts.

mod common;

use common::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use trellis_controller::{
    from_fn, ControllerConfig, OperationContext, OperationHandle, OperationStepHandler,
};
use trellis_model::{Operation, Outcome, PathAddress};

/// Lets a test hold an operation inside its MODEL step.
#[derive(Default)]
struct Gate {
    entered: AtomicBool,
    released: AtomicBool,
}

impl Gate {
    fn wait_entered(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.entered.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "operation never started");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// `hold name=x`: creates `/subsystem=x` under the lock, then waits for the
/// gate to open or the operation to be cancelled.
fn hold(gate: &Arc<Gate>) -> Arc<dyn OperationStepHandler> {
    let gate = Arc::clone(gate);
    from_fn(move |ctx: &mut OperationContext, operation: &Operation| {
        let name = operation.require_string("name")?;
        ctx.create_resource(&address(&format!("/subsystem={name}")))?;
        gate.entered.store(true, Ordering::SeqCst);
        while !gate.released.load(Ordering::SeqCst) {
            ctx.cancel_token().check()?;
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    })
}

fn hold_op(name: &str) -> Operation {
    Operation::new("hold", PathAddress::empty()).with_param("name", name)
}

fn start(f: &Fixture, operation: Operation) -> OperationHandle {
    f.controller.execute_async(operation).unwrap()
}

#[test]
fn writers_are_serialized() {
    let events: Arc<Mutex<Vec<String>>> = Arc::default();
    let recorder = Arc::clone(&events);
    let slow = from_fn(move |ctx: &mut OperationContext, operation: &Operation| {
        let name = operation.require_string("name")?;
        ctx.create_resource(&address(&format!("/subsystem={name}")))?;
        recorder.lock().push(format!("enter {name}"));
        thread::sleep(Duration::from_millis(50));
        recorder.lock().push(format!("exit {name}"));
        Ok(())
    });
    let f = Arc::new(fixture_with(vec![("slow", slow)], test_config()));
    let barrier = Arc::new(Barrier::new(2));

    let threads: Vec<_> = ["one", "two"]
        .into_iter()
        .map(|name| {
            let f = Arc::clone(&f);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                f.controller.execute(
                    Operation::new("slow", PathAddress::empty()).with_param("name", name),
                )
            })
        })
        .collect();
    for t in threads {
        assert!(t.join().unwrap().is_success());
    }

    let events = events.lock().clone();
    assert_eq!(events.len(), 4);
    for pair in events.chunks(2) {
        let entered = pair[0].strip_prefix("enter ").unwrap();
        assert_eq!(pair[1], format!("exit {entered}"), "{events:?}");
    }
    let model = f.controller.model();
    assert!(model.exists(&address("/subsystem=one")));
    assert!(model.exists(&address("/subsystem=two")));
}

#[test]
fn cancelling_a_running_operation_rolls_it_back() {
    let gate = Arc::new(Gate::default());
    let f = fixture_with(vec![("hold", hold(&gate))], test_config());

    let handle = start(&f, hold_op("spin"));
    gate.wait_entered();
    assert_eq!(f.controller.active_operations(), [handle.operation_id()]);

    handle.cancel();
    assert!(f.controller.active_operations().is_empty());
    let response = handle.wait();
    assert_eq!(response.outcome, Outcome::Cancelled);
    assert!(!f.controller.model().exists(&address("/subsystem=spin")));

    let response = f
        .controller
        .execute(add("/socket-binding=http").with_param("port", 8080));
    assert!(response.is_success(), "{:?}", response.failure_description);
}

#[test]
fn cancel_by_id() {
    let gate = Arc::new(Gate::default());
    let f = fixture_with(vec![("hold", hold(&gate))], test_config());
    assert!(!f.controller.cancel(12_345));

    let handle = start(&f, hold_op("spin"));
    gate.wait_entered();
    assert!(f.controller.cancel(handle.operation_id()));
    assert_eq!(handle.wait().outcome, Outcome::Cancelled);
}

#[test]
fn waiting_for_the_lock_can_be_cancelled() {
    let gate = Arc::new(Gate::default());
    let f = fixture_with(vec![("hold", hold(&gate))], test_config());

    let holder = start(&f, hold_op("first"));
    gate.wait_entered();
    let waiter = start(&f, add("/socket-binding=http").with_param("port", 8080));
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    waiter.cancel();
    assert_eq!(waiter.wait().outcome, Outcome::Cancelled);

    gate.release();
    assert!(holder.wait().is_success());
    let model = f.controller.model();
    assert!(model.exists(&address("/subsystem=first")));
    assert!(!model.exists(&address("/socket-binding=http")));
}

#[test]
fn lock_wait_times_out() {
    let gate = Arc::new(Gate::default());
    let config = ControllerConfig {
        lock_timeout_ms: 100,
        ..test_config()
    };
    let f = fixture_with(vec![("hold", hold(&gate))], config);

    let holder = start(&f, hold_op("first"));
    gate.wait_entered();
    let response = f
        .controller
        .execute(add("/socket-binding=http").with_param("port", 8080));
    assert_eq!(response.outcome, Outcome::Failed);
    assert!(response
        .failure_description
        .as_deref()
        .is_some_and(|d| d.contains("100 ms")));

    gate.release();
    assert!(holder.wait().is_success());
}

#[test]
fn reads_do_not_wait_for_writers() {
    let gate = Arc::new(Gate::default());
    let f = fixture_with(vec![("hold", hold(&gate))], test_config());
    let response = f
        .controller
        .execute(add("/socket-binding=http").with_param("port", 8080));
    assert!(response.is_success());

    let holder = start(&f, hold_op("first"));
    gate.wait_entered();
    let response = f.controller.execute(
        Operation::new(trellis_model::READ_ATTRIBUTE, address("/socket-binding=http"))
            .with_param("name", "port"),
    );
    assert!(response.is_success());
    assert_eq!(response.result, serde_json::json!(8080));
    assert!(!f.controller.model().exists(&address("/subsystem=first")));

    gate.release();
    assert!(holder.wait().is_success());
    assert!(f.controller.model().exists(&address("/subsystem=first")));
}
