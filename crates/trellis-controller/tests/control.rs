//! Operations whose commit is decided by a `TransactionControl`.

mod common;

use common::*;
use parking_lot::Mutex;
use std::thread;
use trellis_capability::CapabilityScope;
use trellis_controller::{PreparedTransaction, TransactionControl};
use trellis_model::{OperationResponse, Outcome};

#[derive(Clone, Copy)]
enum Decision {
    Commit,
    CommitElsewhere,
    Rollback,
    Forget,
}

struct Recorder {
    decision: Decision,
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn new(decision: Decision) -> Self {
        Self {
            decision,
            events: Mutex::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl TransactionControl for Recorder {
    fn operation_prepared(&self, transaction: PreparedTransaction, result: &OperationResponse) {
        self.events.lock().push(format!("prepared:{}", result.outcome));
        match self.decision {
            Decision::Commit => transaction.commit(),
            Decision::CommitElsewhere => {
                thread::spawn(move || transaction.commit());
            }
            Decision::Rollback => transaction.rollback(),
            Decision::Forget => drop(transaction),
        }
    }

    fn operation_failed(&self, response: &OperationResponse) {
        self.events.lock().push(format!("failed:{}", response.outcome));
    }

    fn operation_completed(&self, response: &OperationResponse) {
        self.events.lock().push(format!("completed:{}", response.outcome));
    }
}

fn has_socket_binding(f: &Fixture) -> bool {
    f.controller
        .capabilities()
        .has_capability(&format!("{SOCKET_CAPABILITY}.http"), &CapabilityScope::Global)
}

#[test]
fn committed_transaction_is_published() {
    let f = fixture();
    let control = Recorder::new(Decision::Commit);
    let response = f.controller.execute_with_control(
        add("/socket-binding=http").with_param("port", 8080),
        &control,
    );
    assert!(response.is_success(), "{:?}", response.failure_description);
    assert_eq!(control.events(), vec!["prepared:success", "completed:success"]);
    assert!(f.controller.model().exists(&address("/socket-binding=http")));
    assert!(has_socket_binding(&f));
}

#[test]
fn commit_from_another_thread() {
    let f = fixture();
    let control = Recorder::new(Decision::CommitElsewhere);
    let response = f.controller.execute_with_control(
        add("/socket-binding=http").with_param("port", 8080),
        &control,
    );
    assert!(response.is_success());
    assert!(f.controller.model().exists(&address("/socket-binding=http")));
}

#[test]
fn caller_rollback_discards_changes() {
    let f = fixture();
    let control = Recorder::new(Decision::Rollback);
    let response = f.controller.execute_with_control(
        add("/socket-binding=http").with_param("port", 8080),
        &control,
    );
    assert_eq!(response.outcome, Outcome::Failed);
    assert_eq!(
        response.failure_description.as_deref(),
        Some("operation rolled back")
    );
    assert_eq!(control.events(), vec!["prepared:success", "completed:failed"]);
    assert!(!f.controller.model().exists(&address("/socket-binding=http")));
    assert!(!has_socket_binding(&f));
}

#[test]
fn forgotten_transaction_rolls_back() {
    let f = fixture();
    let control = Recorder::new(Decision::Forget);
    let response = f.controller.execute_with_control(
        add("/socket-binding=http").with_param("port", 8080),
        &control,
    );
    assert_eq!(response.outcome, Outcome::Failed);
    assert!(!f.controller.model().exists(&address("/socket-binding=http")));
}

#[test]
fn failure_skips_prepare() {
    let f = fixture();
    let control = Recorder::new(Decision::Commit);
    let response = f
        .controller
        .execute_with_control(add("/subsystem=web/connector=http"), &control);
    assert_eq!(response.outcome, Outcome::Failed);
    assert_eq!(control.events(), vec!["failed:failed"]);
    assert!(f.controller.active_operations().is_empty());
}
