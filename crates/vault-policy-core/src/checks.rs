//! # State Checks
//!
//! Checks run by a harness step after an apply. Each check reads the applied
//! [`State`], may consult the management API through the client in
//! [`CheckEnv`], and may retain values for later steps.
//!
//! Checks in a step run in order and the first failure ends the step.

use crate::access_policy::{ObjectId, Permissions, VaultRef};
use crate::context::CheckContext;
use crate::management::VaultClient;
use crate::state::{ResourceState, State};
use crate::verifier::{verify_policy_exists, verify_policy_missing, CheckError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

#[cfg(test)]
#[path = "checks_tests.rs"]
mod tests;

/// Values carried from one step of a test case to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Retained {
    values: BTreeMap<String, String>,
}

impl Retained {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything a check may use.
pub struct CheckEnv<'a> {
    pub state: &'a State,
    pub retained: &'a mut Retained,
    pub client: &'a dyn VaultClient,
    pub ctx: &'a CheckContext,
}

impl<'a> CheckEnv<'a> {
    pub fn new(
        state: &'a State,
        retained: &'a mut Retained,
        client: &'a dyn VaultClient,
        ctx: &'a CheckContext,
    ) -> Self {
        Self {
            state,
            retained,
            client,
            ctx,
        }
    }

    /// Resource at `address`, or [`CheckError::ResourceNotInState`].
    pub fn resource(&self, address: &str) -> Result<&'a ResourceState, CheckError> {
        self.state
            .resource(address)
            .ok_or_else(|| CheckError::ResourceNotInState {
                address: address.to_string(),
            })
    }
}

/// One assertion evaluated after an apply.
#[async_trait]
pub trait StateCheck: Send + Sync {
    /// Short description for logs and reports.
    fn describe(&self) -> String;

    async fn check(&self, env: &mut CheckEnv<'_>) -> Result<(), CheckError>;
}

pub(crate) fn required<'r>(resource: &'r ResourceState, key: &str) -> Result<&'r str, CheckError> {
    resource
        .attribute(key)
        .ok_or_else(|| CheckError::AttributeMissing {
            address: resource.address.clone(),
            key: key.to_string(),
        })
}

// ============================================================================
// Attribute checks
// ============================================================================

/// A flattened attribute equals an exact value.
#[derive(Debug, Clone)]
pub struct ResourceAttr {
    pub address: String,
    pub key: String,
    pub value: String,
}

impl ResourceAttr {
    pub fn new(
        address: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl StateCheck for ResourceAttr {
    fn describe(&self) -> String {
        format!("{}: {} = {:?}", self.address, self.key, self.value)
    }

    async fn check(&self, env: &mut CheckEnv<'_>) -> Result<(), CheckError> {
        let resource = env.resource(&self.address)?;
        let actual = resource.attribute(&self.key);
        if actual == Some(self.value.as_str()) {
            return Ok(());
        }

        Err(CheckError::AttributeMismatch {
            address: self.address.clone(),
            key: self.key.clone(),
            expected: self.value.clone(),
            actual: actual.map(str::to_string),
        })
    }
}

/// A flattened attribute is present and not empty, whatever its value.
#[derive(Debug, Clone)]
pub struct ResourceAttrSet {
    pub address: String,
    pub key: String,
}

impl ResourceAttrSet {
    pub fn new(address: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl StateCheck for ResourceAttrSet {
    fn describe(&self) -> String {
        format!("{}: {} is set", self.address, self.key)
    }

    async fn check(&self, env: &mut CheckEnv<'_>) -> Result<(), CheckError> {
        let resource = env.resource(&self.address)?;
        match resource.attribute(&self.key) {
            Some(value) if !value.is_empty() => Ok(()),
            _ => Err(CheckError::AttributeMissing {
                address: self.address.clone(),
                key: self.key.clone(),
            }),
        }
    }
}

/// Copy a flattened attribute into the retained values under `as_name`.
#[derive(Debug, Clone)]
pub struct RetainAttr {
    pub address: String,
    pub key: String,
    pub as_name: String,
}

impl RetainAttr {
    pub fn new(
        address: impl Into<String>,
        key: impl Into<String>,
        as_name: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            key: key.into(),
            as_name: as_name.into(),
        }
    }
}

#[async_trait]
impl StateCheck for RetainAttr {
    fn describe(&self) -> String {
        format!("retain {}: {} as {:?}", self.address, self.key, self.as_name)
    }

    async fn check(&self, env: &mut CheckEnv<'_>) -> Result<(), CheckError> {
        let resource = env.resource(&self.address)?;
        let value = required(resource, &self.key)?.to_string();
        debug!(name = %self.as_name, "Retained attribute");
        env.retained.insert(self.as_name.clone(), value);
        Ok(())
    }
}

// ============================================================================
// Management API checks
// ============================================================================

/// Where [`PolicyExists`] takes the expected application id from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationIdSource {
    Literal(String),
    /// The policy resource's own `application_id` attribute, which must be
    /// set.
    FromState,
}

/// The access policy resource at `address` exists on its vault, optionally
/// with exactly the given permissions and application id.
#[derive(Debug, Clone)]
pub struct PolicyExists {
    pub address: String,
    pub permissions: Option<Permissions>,
    pub application_id: Option<ApplicationIdSource>,
}

impl PolicyExists {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            permissions: None,
            application_id: None,
        }
    }

    /// Also require the entry to be bound to an application id.
    pub fn with_application_id(mut self, source: ApplicationIdSource) -> Self {
        self.application_id = Some(source);
        self
    }

    /// Also compare the permission lists returned by the API.
    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = Some(permissions);
        self
    }
}

#[async_trait]
impl StateCheck for PolicyExists {
    fn describe(&self) -> String {
        format!("access policy {} exists", self.address)
    }

    async fn check(&self, env: &mut CheckEnv<'_>) -> Result<(), CheckError> {
        let resource = env.resource(&self.address)?;
        let vault = VaultRef::new(
            required(resource, "vault_resource_group")?,
            required(resource, "vault_name")?,
        )?;
        let object_id = ObjectId::new(required(resource, "object_id")?);

        let entry = verify_policy_exists(env.client, env.ctx, &vault, &object_id).await?;

        if let Some(expected) = &self.permissions {
            if let Some(diff) = expected.diff(&entry.permissions) {
                return Err(CheckError::PermissionMismatch {
                    object_id: object_id.to_string(),
                    kind: diff.kind,
                    expected: diff.expected,
                    actual: diff.actual,
                });
            }
        }

        if let Some(source) = &self.application_id {
            let expected = match source {
                ApplicationIdSource::Literal(id) => id.as_str(),
                ApplicationIdSource::FromState => required(resource, "application_id")?,
            };
            if entry.application_id.as_deref() != Some(expected) {
                return Err(CheckError::ApplicationIdMismatch {
                    object_id: object_id.to_string(),
                    expected: expected.to_string(),
                    actual: entry.application_id,
                });
            }
        }
        Ok(())
    }
}

/// Where [`PolicyMissing`] takes the object id from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectIdSource {
    Literal(ObjectId),
    /// A value retained by an earlier step.
    Retained(String),
}

/// No access policy for the object id exists on the vault at
/// `vault_address`, while the vault itself still does.
#[derive(Debug, Clone)]
pub struct PolicyMissing {
    pub vault_address: String,
    pub object_id: ObjectIdSource,
}

impl PolicyMissing {
    pub fn new(vault_address: impl Into<String>, object_id: ObjectIdSource) -> Self {
        Self {
            vault_address: vault_address.into(),
            object_id,
        }
    }

    fn resolve_object_id(&self, retained: &Retained) -> Result<ObjectId, CheckError> {
        match &self.object_id {
            ObjectIdSource::Literal(id) => Ok(id.clone()),
            ObjectIdSource::Retained(key) => retained
                .get(key)
                .map(ObjectId::new)
                .ok_or_else(|| CheckError::RetainedValueMissing { key: key.clone() }),
        }
    }
}

#[async_trait]
impl StateCheck for PolicyMissing {
    fn describe(&self) -> String {
        format!("access policy missing from {}", self.vault_address)
    }

    async fn check(&self, env: &mut CheckEnv<'_>) -> Result<(), CheckError> {
        let resource = env.resource(&self.vault_address)?;
        let vault = VaultRef::new(
            required(resource, "resource_group_name")?,
            required(resource, "name")?,
        )?;
        let object_id = self.resolve_object_id(env.retained)?;

        verify_policy_missing(env.client, env.ctx, &vault, &object_id).await
    }
}
