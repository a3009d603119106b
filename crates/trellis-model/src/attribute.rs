use crate::{ModelError, Operation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Int,
    Boolean,
    List,
    Object,
    Any,
}

impl AttributeType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            AttributeType::String => value.is_string(),
            AttributeType::Int => value.is_i64() || value.is_u64(),
            AttributeType::Boolean => value.is_boolean(),
            AttributeType::List => value.is_array(),
            AttributeType::Object => value.is_object(),
            AttributeType::Any => true,
        }
    }
}

/// What a runtime change to an attribute disturbs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartLevel {
    /// Applied to the model only; no runtime effect.
    None,
    /// The runtime may apply the change, or ask for a reload.
    #[default]
    AllServices,
    /// Only the resource's own services are affected.
    ResourceServices,
    /// Takes effect only after a full process restart.
    Jvm,
}

/// Declares that an attribute's value names a capability the owning
/// resource's capability requires.
///
/// The required capability is dynamic: its full name is
/// `<required>.<attribute value>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityReference {
    pub required: String,
    pub dependent: String,
    #[serde(default)]
    pub dynamic_dependent: bool,
}

impl CapabilityReference {
    pub fn new(required: impl Into<String>, dependent: impl Into<String>) -> Self {
        Self {
            required: required.into(),
            dependent: dependent.into(),
            dynamic_dependent: false,
        }
    }

    #[must_use]
    pub fn with_dynamic_dependent(mut self) -> Self {
        self.dynamic_dependent = true;
        self
    }

    /// Full name of the required capability for a given attribute value.
    pub fn required_name(&self, value: &str) -> String {
        format!("{}.{value}", self.required)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributeDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub restart: RestartLevel,
    #[serde(default)]
    pub capability_reference: Option<CapabilityReference>,
}

impl AttributeDefinition {
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            restart: RestartLevel::default(),
            capability_reference: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_restart(mut self, restart: RestartLevel) -> Self {
        self.restart = restart;
        self
    }

    #[must_use]
    pub fn with_capability_reference(mut self, reference: CapabilityReference) -> Self {
        self.capability_reference = Some(reference);
        self
    }

    /// Validate a candidate value. `null` means undefined.
    pub fn validate(&self, value: &Value) -> Result<(), ModelError> {
        if value.is_null() {
            if self.required && self.default.is_none() {
                return Err(ModelError::MissingParameter(self.name.clone()));
            }
            return Ok(());
        }
        if !self.kind.accepts(value) {
            return Err(ModelError::InvalidParameter {
                name: self.name.clone(),
                reason: format!("expected {:?}, found {value}", self.kind),
            });
        }
        Ok(())
    }

    /// The effective value: the given one, or the default when undefined.
    pub fn resolve(&self, value: &Value) -> Value {
        if value.is_null() {
            self.default.clone().unwrap_or(Value::Null)
        } else {
            value.clone()
        }
    }

    /// Validate the operation's parameter for this attribute and copy it
    /// into `model` (undefined values are not stored).
    pub fn validate_and_set(
        &self,
        operation: &Operation,
        model: &mut Map<String, Value>,
    ) -> Result<(), ModelError> {
        let value = operation.param(&self.name).cloned().unwrap_or(Value::Null);
        self.validate(&value)?;
        if value.is_null() {
            model.remove(&self.name);
        } else {
            model.insert(self.name.clone(), value);
        }
        Ok(())
    }
}
