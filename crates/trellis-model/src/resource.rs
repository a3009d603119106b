//! In-memory configuration tree.
//!
//! A `Resource` holds its own attribute model plus children grouped by type
//! (the key of their `PathElement`) and keyed by name (the value). Children
//! keep insertion order so that persisted and iteration order follow the
//! order the configuration was written in.

use crate::{ModelError, ModelNode, PathAddress, PathElement};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    model: Map<String, Value>,
    #[serde(default)]
    children: IndexMap<String, IndexMap<String, Resource>>,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Map<String, Value>) -> Self {
        Self {
            model,
            children: IndexMap::new(),
        }
    }

    pub fn model(&self) -> &Map<String, Value> {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.model
    }

    pub fn child(&self, element: &PathElement) -> Option<&Resource> {
        self.children.get(element.key())?.get(element.value())
    }

    pub fn child_mut(&mut self, element: &PathElement) -> Option<&mut Resource> {
        self.children
            .get_mut(element.key())?
            .get_mut(element.value())
    }

    pub fn has_child(&self, element: &PathElement) -> bool {
        self.child(element).is_some()
    }

    pub fn has_children(&self) -> bool {
        self.children.values().any(|c| !c.is_empty())
    }

    pub fn child_types(&self) -> impl Iterator<Item = &str> {
        self.children
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(t, _)| t.as_str())
    }

    pub fn child_names(&self, child_type: &str) -> Vec<String> {
        self.children
            .get(child_type)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Elements of every direct child, in type then insertion order.
    pub fn child_elements(&self) -> Vec<PathElement> {
        self.children
            .iter()
            .flat_map(|(t, c)| {
                c.keys().filter_map(move |n| PathElement::new(t.clone(), n.clone()).ok())
            })
            .collect()
    }

    /// Insert a child, optionally at a position among its siblings of the
    /// same type. Indexes past the end append.
    pub fn register_child(
        &mut self,
        element: &PathElement,
        index: Option<usize>,
        child: Resource,
    ) -> Result<(), ModelError> {
        let siblings = self.children.entry(element.key().to_owned()).or_default();
        if siblings.contains_key(element.value()) {
            return Err(ModelError::DuplicateResource(element.to_string()));
        }
        match index {
            Some(i) if i < siblings.len() => {
                siblings.shift_insert(i, element.value().to_owned(), child);
            }
            _ => {
                siblings.insert(element.value().to_owned(), child);
            }
        }
        Ok(())
    }

    pub fn remove_child(&mut self, element: &PathElement) -> Option<Resource> {
        let siblings = self.children.get_mut(element.key())?;
        let removed = siblings.shift_remove(element.value());
        if siblings.is_empty() {
            self.children.shift_remove(element.key());
        }
        removed
    }

    /// Re-sort children of `child_type` so that names listed in `order` come
    /// first, in that order; unlisted children keep their relative order.
    pub fn sort_children(&mut self, child_type: &str, order: &[String]) {
        let Some(siblings) = self.children.get_mut(child_type) else {
            return;
        };
        let position = |name: &str| order.iter().position(|o| o == name).unwrap_or(usize::MAX);
        siblings.sort_by(|a, _, b, _| position(a.as_str()).cmp(&position(b.as_str())));
    }

    pub fn navigate(&self, address: &PathAddress) -> Option<&Resource> {
        let mut current = self;
        for element in address {
            current = current.child(element)?;
        }
        Some(current)
    }

    pub fn navigate_mut(&mut self, address: &PathAddress) -> Option<&mut Resource> {
        let mut current = self;
        for element in address {
            current = current.child_mut(element)?;
        }
        Some(current)
    }

    pub fn exists(&self, address: &PathAddress) -> bool {
        self.navigate(address).is_some()
    }

    /// Create an empty resource at `address`; the parent must exist.
    pub fn create_resource(&mut self, address: &PathAddress) -> Result<(), ModelError> {
        self.add_resource(address, None, Resource::new())
    }

    pub fn add_resource(
        &mut self,
        address: &PathAddress,
        index: Option<usize>,
        resource: Resource,
    ) -> Result<(), ModelError> {
        let Some(element) = address.last_element() else {
            return Err(ModelError::DuplicateResource(address.to_string()));
        };
        let parent_address = address.parent();
        let parent = self
            .navigate_mut(&parent_address)
            .ok_or_else(|| ModelError::ResourceNotFound(parent_address.to_string()))?;
        parent
            .register_child(element, index, resource)
            .map_err(|_| ModelError::DuplicateResource(address.to_string()))
    }

    /// Snapshot of the resource at `address`. A non-recursive read keeps the
    /// child structure but drops the children's own models.
    pub fn read_resource(
        &self,
        address: &PathAddress,
        recursive: bool,
    ) -> Result<Resource, ModelError> {
        let resource = self
            .navigate(address)
            .ok_or_else(|| ModelError::ResourceNotFound(address.to_string()))?;
        if recursive {
            Ok(resource.clone())
        } else {
            Ok(resource.shallow_copy())
        }
    }

    pub fn read_resource_for_update(
        &mut self,
        address: &PathAddress,
    ) -> Result<&mut Resource, ModelError> {
        self.navigate_mut(address)
            .ok_or_else(|| ModelError::ResourceNotFound(address.to_string()))
    }

    pub fn remove_resource(&mut self, address: &PathAddress) -> Result<Resource, ModelError> {
        let not_found = || ModelError::ResourceNotFound(address.to_string());
        let element = address.last_element().ok_or_else(not_found)?;
        self.navigate_mut(&address.parent())
            .and_then(|parent| parent.remove_child(element))
            .ok_or_else(not_found)
    }

    fn shallow_copy(&self) -> Resource {
        Resource {
            model: self.model.clone(),
            children: self
                .children
                .iter()
                .map(|(t, c)| {
                    (
                        t.clone(),
                        c.keys().map(|n| (n.clone(), Resource::new())).collect(),
                    )
                })
                .collect(),
        }
    }

    /// `read-resource` form: attributes plus `{type: {name: ..}}` children.
    /// Non-recursive output leaves child entries undefined.
    pub fn to_model_node(&self, recursive: bool) -> ModelNode {
        let mut node = self.model.clone();
        for (child_type, siblings) in &self.children {
            let mut entries = Map::new();
            for (name, child) in siblings {
                let value = if recursive {
                    child.to_model_node(true)
                } else {
                    Value::Null
                };
                entries.insert(name.clone(), value);
            }
            node.insert(child_type.clone(), Value::Object(entries));
        }
        Value::Object(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(s: &str) -> PathAddress {
        PathAddress::parse(s).unwrap()
    }

    fn tree() -> Resource {
        let mut root = Resource::new();
        root.create_resource(&addr("/subsystem=web")).unwrap();
        root.create_resource(&addr("/subsystem=web/connector=http")).unwrap();
        root.create_resource(&addr("/subsystem=web/connector=ajp")).unwrap();
        root.create_resource(&addr("/subsystem=logging")).unwrap();
        root
    }

    #[test]
    fn create_requires_existing_parent() {
        let mut root = Resource::new();
        let err = root.create_resource(&addr("/a=1/b=2")).unwrap_err();
        assert!(matches!(err, ModelError::ResourceNotFound(p) if p == "/a=1"));
    }

    #[test]
    fn create_rejects_duplicates() {
        let mut root = tree();
        let err = root.create_resource(&addr("/subsystem=web")).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateResource(_)));
        assert!(root.create_resource(&PathAddress::empty()).is_err());
    }

    #[test]
    fn remove_returns_subtree() {
        let mut root = tree();
        let removed = root.remove_resource(&addr("/subsystem=web")).unwrap();
        assert_eq!(removed.child_names("connector"), vec!["http", "ajp"]);
        assert!(!root.exists(&addr("/subsystem=web")));
        assert!(root.remove_resource(&addr("/subsystem=web")).is_err());
    }

    #[test]
    fn removing_last_child_drops_the_type() {
        let mut root = Resource::new();
        root.create_resource(&addr("/a=1")).unwrap();
        root.remove_resource(&addr("/a=1")).unwrap();
        assert!(!root.has_children());
        assert_eq!(root.child_types().count(), 0);
    }

    #[test]
    fn ordered_insert_honours_index() {
        let mut root = tree();
        root.add_resource(&addr("/subsystem=web/connector=https"), Some(1), Resource::new())
            .unwrap();
        let web = root.navigate(&addr("/subsystem=web")).unwrap();
        assert_eq!(web.child_names("connector"), vec!["http", "https", "ajp"]);

        root.add_resource(&addr("/subsystem=web/connector=last"), Some(99), Resource::new())
            .unwrap();
        let web = root.navigate(&addr("/subsystem=web")).unwrap();
        assert_eq!(web.child_names("connector").last().unwrap(), "last");
    }

    #[test]
    fn non_recursive_read_drops_child_models() {
        let mut root = tree();
        root.read_resource_for_update(&addr("/subsystem=web/connector=http"))
            .unwrap()
            .model_mut()
            .insert("port".to_owned(), json!(8080));

        let shallow = root.read_resource(&addr("/subsystem=web"), false).unwrap();
        let http = shallow
            .child(&PathElement::new("connector", "http").unwrap())
            .unwrap();
        assert!(http.model().is_empty());

        let deep = root.read_resource(&addr("/subsystem=web"), true).unwrap();
        let http = deep
            .child(&PathElement::new("connector", "http").unwrap())
            .unwrap();
        assert_eq!(http.model().get("port"), Some(&json!(8080)));
    }

    #[test]
    fn sort_children_restores_declared_order() {
        let mut root = Resource::new();
        for name in ["c", "a", "b"] {
            root.create_resource(&PathAddress::from_pairs([("subsystem", name)]).unwrap())
                .unwrap();
        }
        let order = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        root.sort_children("subsystem", &order);
        assert_eq!(root.child_names("subsystem"), order);
    }

    #[test]
    fn model_node_shape() {
        let mut root = tree();
        root.model_mut().insert("name".to_owned(), json!("server"));
        let node = root.to_model_node(false);
        assert_eq!(node["name"], "server");
        assert_eq!(node["subsystem"]["web"], Value::Null);

        let node = root.to_model_node(true);
        assert_eq!(node["subsystem"]["web"]["connector"]["http"], json!({}));
    }
}
