//! TOML description of a management model.
//!
//! ```toml
//! [[resource]]
//! path = "/socket-binding=*"
//! capabilities = [{ name = "org.trellis.socket-binding", dynamic = true }]
//!
//! [[resource.attribute]]
//! name = "port"
//! type = "int"
//! required = true
//! ```
//!
//! Every declared resource gets `add`, `remove` and `write-attribute`
//! handlers; the root also serves `read-resource` and `read-attribute`.

use crate::handlers::{GenericAdd, GenericRemove, GenericWrite, ServiceTemplate};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use trellis_capability::RuntimeCapability;
use trellis_controller::{
    AddOperation, HandlerParameters, RemoveOperation, ResourceRegistration,
    WriteAttributeOperation,
};
use trellis_model::{
    AttributeDefinition, AttributeType, CapabilityReference, PathAddress, PathElement,
    RestartLevel, ADD, REMOVE, WRITE_ATTRIBUTE,
};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDescription {
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ResourceDescription {
    pub path: String,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescription>,
    #[serde(default)]
    pub ordered_children: Vec<String>,
    #[serde(default, rename = "attribute")]
    pub attributes: Vec<AttributeDescription>,
    /// Service installed when the resource is added. `{name}` expands to the
    /// value of the resource's last address element.
    pub service: Option<String>,
    #[serde(default)]
    pub requires_services: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityDescription {
    pub name: String,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AttributeDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default)]
    pub required: bool,
    pub default: Option<Value>,
    #[serde(default)]
    pub restart: RestartLevel,
    pub capability_reference: Option<ReferenceDescription>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ReferenceDescription {
    pub required: String,
    pub dependent: String,
    #[serde(default)]
    pub dynamic_dependent: bool,
}

impl AttributeDescription {
    fn definition(&self) -> AttributeDefinition {
        let mut attribute =
            AttributeDefinition::new(&self.name, self.kind).with_restart(self.restart);
        if self.required {
            attribute = attribute.required();
        }
        if let Some(default) = &self.default {
            attribute = attribute.with_default(default.clone());
        }
        if let Some(reference) = &self.capability_reference {
            let mut cap_ref = CapabilityReference::new(&reference.required, &reference.dependent);
            if reference.dynamic_dependent {
                cap_ref = cap_ref.with_dynamic_dependent();
            }
            attribute = attribute.with_capability_reference(cap_ref);
        }
        attribute
    }
}

impl CapabilityDescription {
    fn capability(&self) -> RuntimeCapability {
        let capability = self
            .requires
            .iter()
            .fold(RuntimeCapability::new(&self.name), |c, r| {
                c.with_requirement(r)
            });
        if self.dynamic {
            capability.dynamic()
        } else {
            capability
        }
    }
}

pub fn load(path: &Path) -> Result<ResourceRegistration, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("failed to read model '{}': {e}", path.display()))?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<ResourceRegistration, String> {
    let description: ModelDescription =
        toml::from_str(content).map_err(|e| format!("failed to parse model: {e}"))?;
    description.into_registration()
}

impl ModelDescription {
    /// Build the registration tree. Parents must be declared for every
    /// non-root resource.
    pub fn into_registration(self) -> Result<ResourceRegistration, String> {
        let mut by_address: BTreeMap<Vec<(String, String)>, ResourceDescription> = BTreeMap::new();
        for resource in self.resources {
            let address = PathAddress::parse(&resource.path)
                .map_err(|e| format!("model error: {e}"))?;
            if address.is_empty() {
                return Err("model error: the root resource cannot be declared".to_owned());
            }
            let key: Vec<(String, String)> = address
                .iter()
                .map(|e| (e.key().to_owned(), e.value().to_owned()))
                .collect();
            if by_address.contains_key(&key) {
                return Err(format!("model error: {} is declared twice", resource.path));
            }
            by_address.insert(key, resource);
        }
        for key in by_address.keys() {
            let parent = &key[..key.len() - 1];
            if !parent.is_empty() && !by_address.contains_key(parent) {
                return Err(format!(
                    "model error: parent of {} is not declared",
                    display(key)
                ));
            }
        }

        let mut root = ResourceRegistration::new().with_global_operations();
        for (key, _) in by_address.iter().filter(|(k, _)| k.len() == 1) {
            let (element, child) = build(key, &by_address)?;
            root.register_sub_model(&element, child)
                .map_err(|e| format!("model error: {e}"))?;
        }
        Ok(root)
    }
}

type Declarations = BTreeMap<Vec<(String, String)>, ResourceDescription>;

fn build(
    key: &[(String, String)],
    declarations: &Declarations,
) -> Result<(PathElement, ResourceRegistration), String> {
    let (child_type, value) = &key[key.len() - 1];
    let element = PathElement::new(child_type, value).map_err(|e| format!("model error: {e}"))?;
    let Some(resource) = declarations.get(key) else {
        return Err(format!("model error: {} is not declared", display(key)));
    };

    let attributes: Vec<AttributeDefinition> =
        resource.attributes.iter().map(AttributeDescription::definition).collect();
    let capabilities: Vec<RuntimeCapability> = resource
        .capabilities
        .iter()
        .map(CapabilityDescription::capability)
        .collect();
    let service = resource.service.as_ref().map(|name| ServiceTemplate {
        name: name.clone(),
        requires: resource.requires_services.clone(),
    });
    let parameters = attributes
        .iter()
        .cloned()
        .fold(HandlerParameters::new(), HandlerParameters::with_attribute);

    let mut registration = ResourceRegistration::new()
        .with_operation(
            ADD,
            Arc::new(AddOperation::new(GenericAdd::new(
                parameters.clone(),
                service.clone(),
            ))),
        )
        .with_operation(
            REMOVE,
            Arc::new(RemoveOperation::new(GenericRemove::new(parameters, service))),
        )
        .with_operation(
            WRITE_ATTRIBUTE,
            Arc::new(WriteAttributeOperation::new(GenericWrite::new(
                attributes.clone(),
            ))),
        );
    for attribute in attributes {
        registration = registration.with_attribute(attribute);
    }
    for capability in capabilities {
        registration = registration.with_capability(capability);
    }
    for child_type in &resource.ordered_children {
        registration = registration.with_ordered_child_type(child_type);
    }

    for child_key in declarations
        .keys()
        .filter(|k| k.len() == key.len() + 1 && k.starts_with(key))
    {
        let (child_element, child) = build(child_key, declarations)?;
        registration
            .register_sub_model(&child_element, child)
            .map_err(|e| format!("model error: {e}"))?;
    }
    Ok((element, registration))
}

fn display(key: &[(String, String)]) -> String {
    key.iter().map(|(k, v)| format!("/{k}={v}")).collect()
}
