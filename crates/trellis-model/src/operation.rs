use crate::{ModelError, ModelNode, PathAddress};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const OP: &str = "operation";
pub const ADDRESS: &str = "address";
pub const OPERATION_HEADERS: &str = "operation-headers";

pub const ADD: &str = "add";
pub const REMOVE: &str = "remove";
pub const WRITE_ATTRIBUTE: &str = "write-attribute";
pub const READ_ATTRIBUTE: &str = "read-attribute";
pub const READ_RESOURCE: &str = "read-resource";

pub const NAME: &str = "name";
pub const VALUE: &str = "value";
pub const RECURSIVE: &str = "recursive";
pub const ADD_INDEX: &str = "add-index";

/// A management operation: a name, a target address, parameters and headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Operation {
    pub name: String,
    pub address: PathAddress,
    pub parameters: Map<String, Value>,
    pub headers: Map<String, Value>,
}

impl Operation {
    pub fn new(name: impl Into<String>, address: PathAddress) -> Self {
        Self {
            name: name.into(),
            address,
            parameters: Map::new(),
            headers: Map::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The parameter value, treating an explicit `null` as absent.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name).filter(|v| !v.is_null())
    }

    pub fn require_param(&self, name: &str) -> Result<&Value, ModelError> {
        self.param(name)
            .ok_or_else(|| ModelError::MissingParameter(name.to_owned()))
    }

    pub fn require_string(&self, name: &str) -> Result<&str, ModelError> {
        self.require_param(name)?
            .as_str()
            .ok_or_else(|| ModelError::InvalidParameter {
                name: name.to_owned(),
                reason: "expected a string".to_owned(),
            })
    }

    pub fn bool_param(&self, name: &str) -> bool {
        self.param(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Copy of this operation with all headers stripped.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        Self {
            name: self.name.clone(),
            address: self.address.clone(),
            parameters: self.parameters.clone(),
            headers: Map::new(),
        }
    }

    /// Wire form: `{"operation": .., "address": [..], ..params, "operation-headers": {..}}`.
    pub fn to_model_node(&self) -> ModelNode {
        let mut node = Map::new();
        node.insert(OP.to_owned(), Value::String(self.name.clone()));
        node.insert(ADDRESS.to_owned(), self.address.to_model_node());
        for (k, v) in &self.parameters {
            node.insert(k.clone(), v.clone());
        }
        if !self.headers.is_empty() {
            node.insert(
                OPERATION_HEADERS.to_owned(),
                Value::Object(self.headers.clone()),
            );
        }
        Value::Object(node)
    }

    pub fn from_model_node(node: &ModelNode) -> Result<Self, ModelError> {
        let Value::Object(map) = node else {
            return Err(ModelError::InvalidOperation(format!(
                "expected an object, found {node}"
            )));
        };
        let name = match map.get(OP) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => {
                return Err(ModelError::InvalidOperation(
                    "missing operation name".to_owned(),
                ))
            }
        };
        let address = PathAddress::from_model_node(map.get(ADDRESS).unwrap_or(&Value::Null))?;
        let headers = match map.get(OPERATION_HEADERS) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(h)) => h.clone(),
            Some(other) => {
                return Err(ModelError::InvalidOperation(format!(
                    "operation headers must be an object, found {other}"
                )))
            }
        };
        let parameters = map
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), OP | ADDRESS | OPERATION_HEADERS))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            name,
            address,
            parameters,
            headers,
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.name)
    }
}

impl TryFrom<Value> for Operation {
    type Error = ModelError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_model_node(&value)
    }
}

impl From<Operation> for Value {
    fn from(op: Operation) -> Self {
        op.to_model_node()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Response to an operation, in the client-facing wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OperationResponse {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_description: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub response_headers: Map<String, Value>,
}

impl OperationResponse {
    pub fn success(result: Value) -> Self {
        Self {
            outcome: Outcome::Success,
            result,
            failure_description: None,
            response_headers: Map::new(),
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failed,
            result: Value::Null,
            failure_description: Some(description.into()),
            response_headers: Map::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            outcome: Outcome::Cancelled,
            result: Value::Null,
            failure_description: Some("operation cancelled".to_owned()),
            response_headers: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}
