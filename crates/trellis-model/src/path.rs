use crate::{ModelError, ModelNode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

/// Element value matching any concrete value for the same key.
pub const WILDCARD_VALUE: &str = "*";

const HOST: &str = "host";
const SERVER: &str = "server";

/// A single `key=value` segment of a [`PathAddress`].
///
/// The value may be the wildcard `*` or a multi-target list `[a,b,c]`; both
/// only make sense for matching, never for addressing a concrete resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathElement {
    key: String,
    value: String,
}

impl PathElement {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self, ModelError> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() {
            return Err(ModelError::InvalidElement("empty key".to_owned()));
        }
        if value.is_empty() {
            return Err(ModelError::InvalidElement(format!(
                "empty value for key '{key}'"
            )));
        }
        Ok(Self { key, value })
    }

    /// Element matching every child of the given type.
    pub fn wildcard(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: WILDCARD_VALUE.to_owned(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_wildcard(&self) -> bool {
        self.value == WILDCARD_VALUE
    }

    pub fn is_multi_target(&self) -> bool {
        self.is_wildcard() || (self.value.starts_with('[') && self.value.ends_with(']'))
    }

    /// Individual values of a `[a,b]` element, or the single value otherwise.
    pub fn segments(&self) -> Vec<&str> {
        if self.value.len() > 1 && self.value.starts_with('[') && self.value.ends_with(']') {
            self.value[1..self.value.len() - 1]
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            vec![self.value.as_str()]
        }
    }

    /// Whether this element (possibly a wildcard or multi-target) matches `other`.
    pub fn matches(&self, other: &PathElement) -> bool {
        if self.key != other.key {
            return false;
        }
        if self.is_wildcard() {
            return true;
        }
        if self.is_multi_target() {
            return self.segments().contains(&other.value.as_str());
        }
        self.value == other.value
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", escape(&self.key), escape(&self.value))
    }
}

static EMPTY_ADDRESS: LazyLock<PathAddress> =
    LazyLock::new(|| PathAddress(Arc::from(Vec::<PathElement>::new())));

/// Immutable, hierarchical address of a resource in the management tree.
///
/// Cloning is cheap (the elements are shared). Equality and hashing are
/// structural.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathAddress(Arc<[PathElement]>);

impl PathAddress {
    /// The zero-length address of the root resource.
    pub fn empty() -> Self {
        EMPTY_ADDRESS.clone()
    }

    /// Build an address, rejecting duplicate keys.
    ///
    /// A `server` element directly after a `host` element re-roots the
    /// address, so keys seen before it may appear again.
    pub fn new(elements: Vec<PathElement>) -> Result<Self, ModelError> {
        if elements.is_empty() {
            return Ok(Self::empty());
        }
        {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut previous: Option<&str> = None;
            for element in &elements {
                if element.key == SERVER && previous == Some(HOST) {
                    seen.clear();
                }
                if !seen.insert(element.key.as_str()) {
                    return Err(ModelError::DuplicateElement(element.key.clone()));
                }
                previous = Some(element.key.as_str());
            }
        }
        Ok(Self(Arc::from(elements)))
    }

    /// Convenience constructor from `(key, value)` pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, ModelError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let elements = pairs
            .into_iter()
            .map(|(k, v)| PathElement::new(k, v))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(elements)
    }

    pub fn append(&self, element: PathElement) -> Result<Self, ModelError> {
        let mut elements = self.0.to_vec();
        elements.push(element);
        Self::new(elements)
    }

    pub fn append_address(&self, other: &PathAddress) -> Result<Self, ModelError> {
        let mut elements = self.0.to_vec();
        elements.extend(other.iter().cloned());
        Self::new(elements)
    }

    /// Address of the parent resource; the root is its own parent.
    pub fn parent(&self) -> Self {
        match self.0.len() {
            0 | 1 => Self::empty(),
            n => Self(Arc::from(&self.0[..n - 1])),
        }
    }

    /// Suffix of this address starting at `start`.
    pub fn sub_address(&self, start: usize) -> Self {
        if start >= self.0.len() {
            return Self::empty();
        }
        Self(Arc::from(&self.0[start..]))
    }

    /// Prefix of this address containing the first `len` elements.
    pub fn prefix(&self, len: usize) -> Self {
        if len == 0 {
            return Self::empty();
        }
        Self(Arc::from(&self.0[..len.min(self.0.len())]))
    }

    pub fn last_element(&self) -> Option<&PathElement> {
        self.0.last()
    }

    pub fn element(&self, index: usize) -> Option<&PathElement> {
        self.0.get(index)
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PathElement> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_multi_target(&self) -> bool {
        self.0.iter().any(PathElement::is_multi_target)
    }

    /// Whether this (possibly wildcarded) address matches the concrete `other`.
    pub fn matches(&self, other: &PathAddress) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a.matches(b))
    }

    /// Value of the first element with the given key.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|e| e.key == key).map(PathElement::value)
    }

    /// Wire form: a list of single-entry `{key: value}` objects.
    pub fn to_model_node(&self) -> ModelNode {
        Value::Array(
            self.0
                .iter()
                .map(|e| {
                    let mut entry = Map::new();
                    entry.insert(e.key.clone(), Value::String(e.value.clone()));
                    Value::Object(entry)
                })
                .collect(),
        )
    }

    /// Parse the wire form. `null` is the root address and a string is read
    /// as CLI syntax.
    pub fn from_model_node(node: &ModelNode) -> Result<Self, ModelError> {
        match node {
            Value::Null => Ok(Self::empty()),
            Value::String(s) => Self::parse(s),
            Value::Array(items) => {
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    let Value::Object(entry) = item else {
                        return Err(ModelError::InvalidAddressNode(format!(
                            "expected an object, found {item}"
                        )));
                    };
                    if entry.len() != 1 {
                        return Err(ModelError::InvalidAddressNode(format!(
                            "expected exactly one key per element, found {}",
                            entry.len()
                        )));
                    }
                    for (key, value) in entry {
                        let value = match value {
                            Value::String(s) => s.clone(),
                            Value::Number(n) => n.to_string(),
                            other => {
                                return Err(ModelError::InvalidAddressNode(format!(
                                    "value for '{key}' must be a string, found {other}"
                                )))
                            }
                        };
                        elements.push(PathElement::new(key.clone(), value)?);
                    }
                }
                Self::new(elements)
            }
            other => Err(ModelError::InvalidAddressNode(format!(
                "expected a list of elements, found {other}"
            ))),
        }
    }

    /// Parse `/key=value/key=value`, honouring `\` escapes of `/`, `=` and `\`.
    pub fn parse(input: &str) -> Result<Self, ModelError> {
        let illegal = |reason: &str| ModelError::IllegalAddress {
            address: input.to_owned(),
            reason: reason.to_owned(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Ok(Self::empty());
        }
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Err(illegal("address must start with '/'"));
        };

        let mut elements = Vec::new();
        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut chars = rest.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let Some(escaped) = chars.next() else {
                        return Err(illegal("dangling escape character"));
                    };
                    if in_value {
                        value.push(escaped);
                    } else {
                        key.push(escaped);
                    }
                }
                '=' if !in_value => in_value = true,
                '=' => return Err(illegal("unescaped '=' in element value")),
                '/' => {
                    elements.push(take_element(&mut key, &mut value, in_value).map_err(illegal)?);
                    in_value = false;
                }
                other if in_value => value.push(other),
                other => key.push(other),
            }
        }
        // A single trailing '/' is tolerated.
        if in_value || !key.is_empty() {
            elements.push(take_element(&mut key, &mut value, in_value).map_err(illegal)?);
        }

        Self::new(elements).map_err(|e| illegal(&e.to_string()))
    }

    /// CLI form of this address; the root is `/`.
    pub fn to_cli_string(&self) -> String {
        if self.0.is_empty() {
            return "/".to_owned();
        }
        let mut out = String::new();
        for element in self.0.iter() {
            out.push('/');
            out.push_str(&element.to_string());
        }
        out
    }
}

fn take_element(
    key: &mut String,
    value: &mut String,
    in_value: bool,
) -> Result<PathElement, &'static str> {
    if !in_value {
        return Err("path element is missing '='");
    }
    if key.is_empty() {
        return Err("path element has an empty key");
    }
    if value.is_empty() {
        return Err("path element has an empty value");
    }
    Ok(PathElement {
        key: std::mem::take(key),
        value: std::mem::take(value),
    })
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '/' | '=' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl Default for PathAddress {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for PathAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cli_string())
    }
}

impl fmt::Debug for PathAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathAddress({})", self.to_cli_string())
    }
}

impl FromStr for PathAddress {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'a> IntoIterator for &'a PathAddress {
    type Item = &'a PathElement;
    type IntoIter = std::slice::Iter<'a, PathElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for PathAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_model_node().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PathAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let node = Value::deserialize(deserializer)?;
        Self::from_model_node(&node).map_err(serde::de::Error::custom)
    }
}
