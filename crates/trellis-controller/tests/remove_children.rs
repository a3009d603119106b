//! `remove` on resources with removable descendants.

mod common;

use common::*;
use serde_json::{Map, Value};
use std::sync::Arc;
use trellis_controller::{
    AddOperation, ControllerError, HandlerParameters, ModelController, ModelOnlyAddHandler,
    ModelOnlyRemoveHandler, OperationContext, RemoveOperation, RemoveStepHandler,
    ResourceRegistration, ServiceContainer, ServiceRegistry,
};
use trellis_model::{Operation, PathElement, ADD, REMOVE};

/// A `remove` that leaves its resource in place.
struct KeepResource {
    parameters: HandlerParameters,
}

impl RemoveStepHandler for KeepResource {
    fn parameters(&self) -> &HandlerParameters {
        &self.parameters
    }

    fn perform_remove(
        &self,
        _ctx: &mut OperationContext,
        _operation: &Operation,
        _model: &Map<String, Value>,
    ) -> Result<(), ControllerError> {
        Ok(())
    }

    fn requires_runtime(&self, _ctx: &OperationContext) -> bool {
        false
    }
}

fn model_only() -> ResourceRegistration {
    ResourceRegistration::new()
        .with_operation(
            ADD,
            Arc::new(AddOperation::new(ModelOnlyAddHandler::new(
                HandlerParameters::new(),
            ))),
        )
        .with_operation(
            REMOVE,
            Arc::new(RemoveOperation::new(ModelOnlyRemoveHandler::new())),
        )
}

/// `/tree=*/branch=*/twig=*/leaf=*`, plus `/tree=*/stuck=*` whose remove
/// keeps the resource.
fn controller() -> ModelController {
    let twig = model_only().with_child(&PathElement::wildcard("leaf"), model_only());
    let branch = model_only().with_child(&PathElement::wildcard("twig"), twig);
    let stuck = ResourceRegistration::new()
        .with_operation(
            ADD,
            Arc::new(AddOperation::new(ModelOnlyAddHandler::new(
                HandlerParameters::new(),
            ))),
        )
        .with_operation(
            REMOVE,
            Arc::new(RemoveOperation::new(KeepResource {
                parameters: HandlerParameters::new(),
            })),
        );
    let tree = model_only()
        .with_child(&PathElement::wildcard("branch"), branch)
        .with_child(&PathElement::wildcard("stuck"), stuck);
    let root = ResourceRegistration::new()
        .with_global_operations()
        .with_child(&PathElement::wildcard("tree"), tree);
    ModelController::new(
        root,
        ServiceRegistry::new() as Arc<dyn ServiceContainer>,
        test_config(),
    )
}

fn build(controller: &ModelController, addresses: &[&str]) {
    for at in addresses {
        let response = controller.execute(add(at));
        assert!(response.is_success(), "{at}: {:?}", response.failure_description);
    }
}

fn removed(controller: &ModelController, at: &str) -> Vec<String> {
    let (response, trace) = controller.execute_traced(remove(at));
    assert!(response.is_success(), "{:?}", response.failure_description);
    trace
        .iter()
        .filter(|step| step.operation == REMOVE)
        .map(|step| step.address.to_string())
        .collect()
}

#[test]
fn nested_descendants_go_before_their_ancestors() {
    let controller = controller();
    build(
        &controller,
        &[
            "/tree=t",
            "/tree=t/branch=b",
            "/tree=t/branch=b/twig=w",
            "/tree=t/branch=b/twig=w/leaf=l1",
            "/tree=t/branch=b/twig=w/leaf=l2",
        ],
    );

    assert_eq!(
        removed(&controller, "/tree=t"),
        [
            "/tree=t",
            "/tree=t/branch=b",
            "/tree=t/branch=b/twig=w",
            "/tree=t/branch=b/twig=w/leaf=l1",
            "/tree=t/branch=b/twig=w/leaf=l2",
            "/tree=t/branch=b/twig=w",
            "/tree=t/branch=b",
            "/tree=t",
        ]
    );
    assert!(!controller.model().exists(&address("/tree=t")));
}

#[test]
fn child_that_stays_does_not_loop() {
    let controller = controller();
    build(
        &controller,
        &["/tree=t", "/tree=t/branch=b", "/tree=t/stuck=s"],
    );

    assert_eq!(
        removed(&controller, "/tree=t"),
        [
            "/tree=t",
            "/tree=t/branch=b",
            "/tree=t/stuck=s",
            "/tree=t",
        ]
    );
    assert!(!controller.model().exists(&address("/tree=t")));
}

#[test]
fn removing_a_leaf_touches_nothing_else() {
    let controller = controller();
    build(
        &controller,
        &["/tree=t", "/tree=t/branch=b", "/tree=t/branch=b/twig=w"],
    );

    assert_eq!(
        removed(&controller, "/tree=t/branch=b/twig=w"),
        ["/tree=t/branch=b/twig=w"]
    );
    assert!(controller.model().exists(&address("/tree=t/branch=b")));
}
