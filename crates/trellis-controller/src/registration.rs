//! Resource type metadata: attributes, operation handlers, capabilities and
//! child types, arranged in a tree matched against addresses.

use crate::handlers::OperationStepHandler;
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use trellis_capability::{CapabilityMetadata, RuntimeCapability};
use trellis_model::{
    AttributeDefinition, ModelError, PathAddress, PathElement, REMOVE, WILDCARD_VALUE,
};

type Handlers = BTreeMap<String, Arc<dyn OperationStepHandler>>;

#[derive(Clone, Default)]
pub struct ResourceRegistration {
    attributes: IndexMap<String, AttributeDefinition>,
    operations: Handlers,
    inherited_operations: Handlers,
    capabilities: Vec<RuntimeCapability>,
    incorporating: Option<Vec<RuntimeCapability>>,
    ordered_child_types: BTreeSet<String>,
    children: IndexMap<(String, String), ResourceRegistration>,
}

impl fmt::Debug for ResourceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistration")
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .field(
                "inherited_operations",
                &self.inherited_operations.keys().collect::<Vec<_>>(),
            )
            .field("capabilities", &self.capabilities)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl ResourceRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: AttributeDefinition) -> Self {
        self.attributes.insert(attribute.name.clone(), attribute);
        self
    }

    #[must_use]
    pub fn with_operation(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn OperationStepHandler>,
    ) -> Self {
        self.operations.insert(name.into(), handler);
        self
    }

    /// Register a handler that also serves every descendant without its own
    /// handler of that name.
    #[must_use]
    pub fn with_inherited_operation(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn OperationStepHandler>,
    ) -> Self {
        self.inherited_operations.insert(name.into(), handler);
        self
    }

    /// `read-resource` and `read-attribute` for this subtree.
    #[must_use]
    pub fn with_global_operations(self) -> Self {
        self.with_inherited_operation(
            trellis_model::READ_RESOURCE,
            Arc::new(crate::handlers::ReadResourceHandler),
        )
        .with_inherited_operation(
            trellis_model::READ_ATTRIBUTE,
            Arc::new(crate::handlers::ReadAttributeHandler),
        )
    }

    #[must_use]
    pub fn with_capability(mut self, capability: RuntimeCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Capabilities this resource contributes to without registering them.
    #[must_use]
    pub fn with_incorporating_capabilities(mut self, capabilities: Vec<RuntimeCapability>) -> Self {
        self.incorporating = Some(capabilities);
        self
    }

    /// Children of `child_type` keep their insertion order and honour
    /// `add-index`.
    #[must_use]
    pub fn with_ordered_child_type(mut self, child_type: impl Into<String>) -> Self {
        self.ordered_child_types.insert(child_type.into());
        self
    }

    /// Builder form of [`Self::register_sub_model`]; a duplicate element
    /// replaces the earlier registration.
    #[must_use]
    pub fn with_child(mut self, element: &PathElement, child: ResourceRegistration) -> Self {
        self.children
            .insert((element.key().to_owned(), element.value().to_owned()), child);
        self
    }

    pub fn register_sub_model(
        &mut self,
        element: &PathElement,
        child: ResourceRegistration,
    ) -> Result<(), ModelError> {
        let key = (element.key().to_owned(), element.value().to_owned());
        if self.children.contains_key(&key) {
            return Err(ModelError::DuplicateElement(element.to_string()));
        }
        self.children.insert(key, child);
        Ok(())
    }

    /// Registration for a direct child element. An exact `key=value`
    /// registration wins over `key=*`.
    pub fn child_registration(&self, element: &PathElement) -> Option<&ResourceRegistration> {
        self.children
            .get(&(element.key().to_owned(), element.value().to_owned()))
            .or_else(|| {
                self.children
                    .get(&(element.key().to_owned(), WILDCARD_VALUE.to_owned()))
            })
    }

    pub fn sub_registration(&self, address: &PathAddress) -> Option<&ResourceRegistration> {
        address
            .iter()
            .try_fold(self, |registration, element| {
                registration.child_registration(element)
            })
    }

    /// Handler for `operation` at `address`: the resource's own handler, or
    /// the nearest inherited one on the way down.
    pub fn operation_handler(
        &self,
        address: &PathAddress,
        operation: &str,
    ) -> Option<Arc<dyn OperationStepHandler>> {
        let mut inherited = self.inherited_operations.get(operation);
        let mut registration = self;
        for element in address {
            registration = registration.child_registration(element)?;
            if let Some(handler) = registration.inherited_operations.get(operation) {
                inherited = Some(handler);
            }
        }
        registration
            .operations
            .get(operation)
            .or(inherited)
            .cloned()
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDefinition> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.attributes.values()
    }

    pub fn capabilities(&self) -> &[RuntimeCapability] {
        &self.capabilities
    }

    pub fn is_ordered_child_type(&self, child_type: &str) -> bool {
        self.ordered_child_types.contains(child_type)
    }

    /// Whether a child at `element` is removed with its own `remove`
    /// operation when the parent is removed.
    pub fn is_removable(&self, element: &PathElement) -> bool {
        self.child_registration(element)
            .is_some_and(|child| child.operations.contains_key(REMOVE))
    }
}

impl CapabilityMetadata for ResourceRegistration {
    fn incorporating_capabilities(&self, address: &PathAddress) -> Option<Vec<RuntimeCapability>> {
        self.sub_registration(address)
            .and_then(|registration| registration.incorporating.clone())
    }
}
