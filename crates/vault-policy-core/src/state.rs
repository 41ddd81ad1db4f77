//! # Applied State
//!
//! Read model of the Terraform state after an apply, built from the output of
//! `terraform show -json`.
//!
//! Attribute values are flattened into Terraform's classic "flatmap"
//! addressing so checks can name a single value with one key:
//!
//! | JSON value | flattened keys |
//! |---|---|
//! | `"name": "kv"` | `name = kv` |
//! | `"key_permissions": ["get"]` | `key_permissions.# = 1`, `key_permissions.0 = get` |
//! | `"tags": {"environment": "Production"}` | `tags.% = 1`, `tags.environment = Production` |
//! | `"sku": [{"name": "premium"}]` | `sku.# = 1`, `sku.0.name = premium` |
//!
//! Null values produce no key at all. Only resources of the root module are
//! read.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;

/// Errors reading a state document.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("State document is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("State document has an unexpected shape: {message}")]
    UnexpectedShape { message: String },
}

/// One managed or data resource from the applied state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    pub address: String,
    pub resource_type: String,
    pub name: String,
    pub mode: String,
    pub attributes: BTreeMap<String, String>,
}

impl ResourceState {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let name = name.into();
        Self {
            address: format!("{resource_type}.{name}"),
            resource_type,
            name,
            mode: "managed".to_string(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set a single flattened attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Replace the attributes with the flattened form of `values`.
    pub fn with_values(mut self, values: &Value) -> Self {
        self.attributes = flatten_attributes(values);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_managed(&self) -> bool {
        self.mode == "managed"
    }
}

/// Resources of the applied state keyed by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    resources: BTreeMap<String, ResourceState>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the output of `terraform show -json`.
    ///
    /// A document without `values` is an empty state, which is what
    /// Terraform prints once everything has been destroyed.
    pub fn from_show_json(document: &str) -> Result<Self, StateError> {
        let value: Value = serde_json::from_str(document)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, StateError> {
        if !value.is_object() {
            return Err(StateError::UnexpectedShape {
                message: "top-level value is not an object".to_string(),
            });
        }

        let document: ShowDocument = serde_json::from_value(value)?;
        let mut state = State::new();

        let Some(root) = document.values.and_then(|v| v.root_module) else {
            return Ok(state);
        };

        for resource in root.resources {
            let address = resource
                .address
                .unwrap_or_else(|| format!("{}.{}", resource.resource_type, resource.name));
            if state.resources.contains_key(&address) {
                return Err(StateError::UnexpectedShape {
                    message: format!("duplicate resource address {address}"),
                });
            }

            let attributes = resource
                .values
                .as_ref()
                .map(flatten_attributes)
                .unwrap_or_default();

            state.resources.insert(
                address.clone(),
                ResourceState {
                    address,
                    resource_type: resource.resource_type,
                    name: resource.name,
                    mode: resource.mode,
                    attributes,
                },
            );
        }

        Ok(state)
    }

    pub fn resource(&self, address: &str) -> Option<&ResourceState> {
        self.resources.get(address)
    }

    /// Managed resources of the given type, in address order.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = &'a ResourceState> + 'a {
        self.resources
            .values()
            .filter(move |r| r.is_managed() && r.resource_type == resource_type)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceState> {
        self.resources.values()
    }

    pub fn insert(&mut self, resource: ResourceState) {
        self.resources.insert(resource.address.clone(), resource);
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

// ============================================================================
// Flattening
// ============================================================================

/// Flatten a resource's `values` object into flatmap keys.
pub fn flatten_attributes(values: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Value::Object(fields) = values {
        for (key, value) in fields {
            flatten_into(&mut out, key, value);
        }
    }
    out
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => {
            out.insert(prefix.to_string(), b.to_string());
        }
        Value::Number(n) => {
            out.insert(prefix.to_string(), n.to_string());
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Array(items) => {
            out.insert(format!("{prefix}.#"), items.len().to_string());
            for (index, item) in items.iter().enumerate() {
                let key = format!("{prefix}.{index}");
                match item {
                    // Nested block: fields hang directly off the index.
                    Value::Object(fields) => {
                        for (field, inner) in fields {
                            flatten_into(out, &format!("{key}.{field}"), inner);
                        }
                    }
                    other => flatten_into(out, &key, other),
                }
            }
        }
        Value::Object(fields) => {
            let present = fields.values().filter(|v| !v.is_null()).count();
            out.insert(format!("{prefix}.%"), present.to_string());
            for (field, inner) in fields {
                flatten_into(out, &format!("{prefix}.{field}"), inner);
            }
        }
    }
}

// ============================================================================
// `terraform show -json` document
// ============================================================================

#[derive(Debug, Deserialize)]
struct ShowDocument {
    #[serde(default)]
    values: Option<ShowValues>,
}

#[derive(Debug, Deserialize)]
struct ShowValues {
    #[serde(default)]
    root_module: Option<ShowModule>,
}

#[derive(Debug, Deserialize)]
struct ShowModule {
    #[serde(default)]
    resources: Vec<ShowResource>,
}

#[derive(Debug, Deserialize)]
struct ShowResource {
    #[serde(default)]
    address: Option<String>,

    #[serde(default = "default_mode")]
    mode: String,

    #[serde(rename = "type")]
    resource_type: String,

    name: String,

    #[serde(default)]
    values: Option<Value>,
}

fn default_mode() -> String {
    "managed".to_string()
}
