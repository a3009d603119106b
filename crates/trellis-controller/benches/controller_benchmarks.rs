use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use trellis_capability::RuntimeCapability;
use trellis_controller::{
    AddOperation, CancelToken, ControllerConfig, HandlerParameters, ModelController,
    ModelOnlyAddHandler, ModelOnlyRemoveHandler, PermitLock, RemoveOperation,
    ResourceRegistration, ServiceContainer, ServiceRegistry,
};
use trellis_model::{
    AttributeDefinition, AttributeType, Operation, PathAddress, PathElement, ADD, REMOVE,
};

fn controller() -> ModelController {
    let port = AttributeDefinition::new("port", AttributeType::Int);
    let binding = ResourceRegistration::new()
        .with_attribute(port.clone())
        .with_capability(RuntimeCapability::new("org.trellis.socket-binding").dynamic())
        .with_operation(
            ADD,
            Arc::new(AddOperation::new(ModelOnlyAddHandler::new(
                HandlerParameters::new().with_attribute(port),
            ))),
        )
        .with_operation(
            REMOVE,
            Arc::new(RemoveOperation::new(ModelOnlyRemoveHandler::new())),
        );
    let root = ResourceRegistration::new()
        .with_global_operations()
        .with_child(&PathElement::wildcard("socket-binding"), binding);
    let container: Arc<dyn ServiceContainer> = ServiceRegistry::new();
    ModelController::new(root, container, ControllerConfig::default())
}

fn binding(name: &str) -> PathAddress {
    PathAddress::parse(&format!("/socket-binding={name}")).unwrap()
}

fn bench_add_remove(c: &mut Criterion) {
    let controller = controller();
    c.bench_function("controller_add_remove", |b| {
        b.iter(|| {
            let add = Operation::new(ADD, binding("http")).with_param("port", 8080);
            assert!(controller.execute(add).is_success());
            assert!(controller
                .execute(Operation::new(REMOVE, binding("http")))
                .is_success());
        });
    });
}

fn bench_add_with_200_capabilities(c: &mut Criterion) {
    c.bench_function("controller_add_200_capabilities", |b| {
        b.iter_with_setup(
            || {
                let controller = controller();
                for i in 0..200 {
                    let add = Operation::new(ADD, binding(&format!("b{i}"))).with_param("port", i);
                    assert!(controller.execute(add).is_success());
                }
                controller
            },
            |controller| {
                let add = Operation::new(ADD, binding("extra")).with_param("port", 1);
                assert!(controller.execute(add).is_success());
            },
        );
    });
}

fn bench_permit_lock_reentry(c: &mut Criterion) {
    let lock = PermitLock::new();
    let cancel = CancelToken::new();
    c.bench_function("permit_lock_reentry_x100", |b| {
        b.iter(|| {
            for _ in 0..100 {
                lock.try_lock(7, std::time::Duration::from_secs(1), &cancel)
                    .unwrap();
            }
            for _ in 0..100 {
                lock.unlock(7).unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_add_remove,
    bench_add_with_200_capabilities,
    bench_permit_lock_reentry
);
criterion_main!(benches);
