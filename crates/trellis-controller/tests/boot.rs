//! Boot tests: parallel chunking, error collection and rollback of the boot.

mod common;

use common::*;
use trellis_capability::CapabilityScope;
use trellis_controller::{ControllerConfig, ServiceContainer, ServiceState, Stage};
use trellis_model::{Operation, ServiceName, ADD, READ_RESOURCE};

/// `add` for the subsystem followed by `count - 1` reads, so the subsystem
/// contributes `count` boot operations.
fn subsystem_ops(name: &str, count: usize) -> Vec<Operation> {
    let at = format!("/subsystem={name}");
    std::iter::once(add(&at))
        .chain((1..count).map(|_| Operation::new(READ_RESOURCE, address(&at))))
        .collect()
}

fn boot_script() -> Vec<Operation> {
    let mut operations = vec![add("/socket-binding=http").with_param("port", 8080)];
    operations.extend(subsystem_ops("logging", 1));
    operations.extend(subsystem_ops("c", 2));
    operations.extend(subsystem_ops("a", 10));
    operations.extend(subsystem_ops("b", 10));
    operations.push(add("/socket-binding=late").with_param("port", 9090));
    operations
}

fn chunk_names(chunks: &[Vec<trellis_model::SubsystemName>]) -> Vec<Vec<String>> {
    chunks
        .iter()
        .map(|c| c.iter().map(ToString::to_string).collect())
        .collect()
}

#[test]
fn parallel_boot_chunks_and_keeps_order() {
    let f = fixture();
    let outcome = f.controller.boot(boot_script());
    assert!(outcome.success, "{:?}", outcome.response.failure_description);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.operations, 25);
    assert_eq!(
        chunk_names(&outcome.chunks),
        [vec!["logging"], vec!["a", "c"], vec!["b"]]
    );

    let model = f.controller.model();
    assert_eq!(model.child_names("subsystem"), ["logging", "c", "a", "b"]);
    assert!(model.exists(&address("/socket-binding=http")));
    assert!(model.exists(&address("/socket-binding=late")));

    let capabilities = f.controller.capabilities();
    for name in ["logging", "a", "b", "c"] {
        assert!(capabilities.has_capability(
            &format!("{SUBSYSTEM_CAPABILITY}.{name}"),
            &CapabilityScope::Global
        ));
        assert_eq!(
            f.container
                .state(&ServiceName::new(format!("trellis.subsystem.{name}"))),
            Some(ServiceState::Up)
        );
    }
    assert!(outcome.finished_at >= outcome.started_at);
}

#[test]
fn sequential_boot_runs_in_script_order() {
    let config = ControllerConfig {
        parallel_boot: false,
        ..test_config()
    };
    let f = fixture_with(Vec::new(), config);
    let outcome = f.controller.boot(boot_script());
    assert!(outcome.success, "{:?}", outcome.response.failure_description);
    assert!(outcome.chunks.is_empty());
    assert_eq!(
        f.controller.model().child_names("subsystem"),
        ["logging", "c", "a", "b"]
    );
}

#[test]
fn runtime_failures_are_collected() {
    let f = fixture();
    let mut operations = boot_script();
    operations.push(add("/subsystem=mail").with_param("fail-runtime", true));

    let outcome = f.controller.boot(operations);
    assert!(outcome.success, "{:?}", outcome.response.failure_description);
    assert_eq!(outcome.errors.len(), 1);
    let error = &outcome.errors[0];
    assert_eq!(error.address.to_string(), "/subsystem=mail");
    assert_eq!(error.operation, ADD);
    assert_eq!(error.stage, Stage::Runtime);
    assert!(error.failure_description.contains("refused to start"));

    let model = f.controller.model();
    assert!(model.exists(&address("/subsystem=mail")));
    assert!(model.exists(&address("/subsystem=a")));
    assert_eq!(
        f.container.state(&ServiceName::new("trellis.subsystem.a")),
        Some(ServiceState::Up)
    );
    assert!(f
        .container
        .state(&ServiceName::new("trellis.subsystem.mail"))
        .is_none());
}

#[test]
fn model_failure_in_a_chunk_fails_the_boot() {
    let f = fixture();
    let mut operations = boot_script();
    operations.push(add("/subsystem=b/widget=x"));

    let outcome = f.controller.boot(operations);
    assert!(!outcome.success);
    let description = outcome.response.failure_description.unwrap_or_default();
    assert!(description.contains("subsystem boot failed"), "{description}");
    assert!(description.contains("widget"), "{description}");

    let model = f.controller.model();
    assert!(!model.has_children());
    assert!(f.controller.capabilities().is_empty());
}

#[test]
fn model_failure_before_subsystems_fails_the_boot() {
    let f = fixture();
    let mut operations = vec![add("/socket-binding=broken")];
    operations.extend(boot_script());

    let outcome = f.controller.boot(operations);
    assert!(!outcome.success);
    assert!(outcome
        .response
        .failure_description
        .as_deref()
        .is_some_and(|d| d.contains("port")));
    assert!(!f.controller.model().has_children());
    assert!(f
        .container
        .state(&ServiceName::new("trellis.subsystem.a"))
        .is_none());
}

#[test]
fn boot_is_followed_by_normal_operations() {
    let f = fixture();
    assert!(f.controller.boot(boot_script()).success);

    let response = f.controller.execute(remove("/subsystem=c"));
    assert!(response.is_success(), "{:?}", response.failure_description);
    assert_eq!(
        f.controller.model().child_names("subsystem"),
        ["logging", "a", "b"]
    );
    assert!(f.controller.active_operations().is_empty());
}

#[test]
fn single_worker_boot_puts_everything_in_one_chunk() {
    let config = ControllerConfig {
        max_parallel_boot_tasks: 1,
        ..test_config()
    };
    let f = fixture_with(Vec::new(), config);
    let outcome = f.controller.boot(boot_script());
    assert!(outcome.success, "{:?}", outcome.response.failure_description);
    assert_eq!(
        chunk_names(&outcome.chunks),
        [vec!["logging"], vec!["a", "b", "c"]]
    );
}
