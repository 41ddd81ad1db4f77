//! # Access Policy Module
//!
//! Data model for Key Vault access policies as returned by the management
//! API, plus the lookup used by every existence and absence check.
//!
//! A vault carries an ordered list of [`AccessPolicyEntry`] values. The
//! service guarantees that an object identifier appears at most once in that
//! list; the lookup still returns the first occurrence if it does not.

use crate::ValidationError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::{collections::BTreeMap, fmt, sync::OnceLock};

#[cfg(test)]
#[path = "access_policy_tests.rs"]
mod tests;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of the principal (user, group or service principal) that an
/// access policy grants permissions to.
///
/// Compared exactly: two identifiers that differ only in case are different.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ObjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Address of a vault in the management API.
///
/// Names are validated against the Azure naming rules so that a typo fails
/// before a request is sent:
/// - vault: 3-24 characters, letters, digits and hyphens, starting with a
///   letter and not ending with a hyphen
/// - resource group: 1-90 characters, letters, digits, `-`, `_`, `.`, `(`
///   and `)`, not ending with a period
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaultRef {
    resource_group: String,
    name: String,
}

impl VaultRef {
    pub fn new(
        resource_group: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let resource_group = resource_group.into();
        let name = name.into();

        if resource_group.is_empty() {
            return Err(ValidationError::Required {
                field: "resource_group".to_string(),
            });
        }
        if resource_group.len() > 90
            || resource_group.ends_with('.')
            || !resource_group_pattern().is_match(&resource_group)
        {
            return Err(ValidationError::InvalidFormat {
                field: "resource_group".to_string(),
                message: format!("{resource_group:?} is not a valid resource group name"),
            });
        }

        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "name".to_string(),
            });
        }
        if !vault_name_pattern().is_match(&name) {
            return Err(ValidationError::InvalidFormat {
                field: "name".to_string(),
                message: format!("{name:?} is not a valid Key Vault name"),
            });
        }

        Ok(Self {
            resource_group,
            name,
        })
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for VaultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_group, self.name)
    }
}

fn vault_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9-]{1,22}[a-zA-Z0-9]$").expect("vault name pattern")
    })
}

fn resource_group_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[-\w.()]+$").expect("resource group pattern"))
}

// ============================================================================
// Permissions
// ============================================================================

/// The three permission lists an access policy carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionKind {
    Key,
    Secret,
    Certificate,
}

impl PermissionKind {
    /// Attribute name of this list on the Terraform resource.
    pub fn attribute(&self) -> &'static str {
        match self {
            PermissionKind::Key => "key_permissions",
            PermissionKind::Secret => "secret_permissions",
            PermissionKind::Certificate => "certificate_permissions",
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.attribute())
    }
}

/// Ordered permission lists granted by one access policy.
///
/// The API omits or nulls lists that were never set; both deserialize as
/// empty. Storage permissions are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default, deserialize_with = "null_as_default")]
    pub keys: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub secrets: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub certificates: Vec<String>,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_secrets<I, S>(mut self, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secrets = secrets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_certificates<I, S>(mut self, certificates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.certificates = certificates.into_iter().map(Into::into).collect();
        self
    }

    pub fn list(&self, kind: PermissionKind) -> &[String] {
        match kind {
            PermissionKind::Key => &self.keys,
            PermissionKind::Secret => &self.secrets,
            PermissionKind::Certificate => &self.certificates,
        }
    }

    /// Compare against the permissions actually granted, list by list and
    /// element by element. Order matters; case does not, since the service
    /// may normalise permission names.
    ///
    /// Returns the first list that differs.
    pub fn diff(&self, actual: &Permissions) -> Option<PermissionDiff> {
        [
            PermissionKind::Key,
            PermissionKind::Secret,
            PermissionKind::Certificate,
        ]
        .into_iter()
        .find(|kind| !lists_match(self.list(*kind), actual.list(*kind)))
        .map(|kind| PermissionDiff {
            kind,
            expected: self.list(kind).to_vec(),
            actual: actual.list(kind).to_vec(),
        })
    }
}

fn lists_match(expected: &[String], actual: &[String]) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(e, a)| e.eq_ignore_ascii_case(a))
}

/// A permission list that did not match its expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDiff {
    pub kind: PermissionKind,
    pub expected: Vec<String>,
    pub actual: Vec<String>,
}

// ============================================================================
// Server-side representation
// ============================================================================

/// One grant within a vault's access policy list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicyEntry {
    pub tenant_id: String,

    pub object_id: ObjectId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,

    #[serde(default)]
    pub permissions: Permissions,
}

impl AccessPolicyEntry {
    pub fn new(
        tenant_id: impl Into<String>,
        object_id: impl Into<ObjectId>,
        permissions: Permissions,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            object_id: object_id.into(),
            application_id: None,
            permissions,
        }
    }

    pub fn with_application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }
}

/// Vault as returned by the management API. Read-only here: entries change
/// only through Terraform apply and destroy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    #[serde(default)]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub location: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: BTreeMap<String, String>,

    pub properties: VaultProperties,
}

impl Vault {
    /// Build a vault with no access policies.
    pub fn new(name: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            location: String::new(),
            tags: BTreeMap::new(),
            properties: VaultProperties {
                tenant_id: tenant_id.into(),
                sku: Some(Sku {
                    family: Some("A".to_string()),
                    name: "premium".to_string(),
                }),
                access_policies: Vec::new(),
                vault_uri: None,
            },
        }
    }

    pub fn with_policy(mut self, entry: AccessPolicyEntry) -> Self {
        self.properties.access_policies.push(entry);
        self
    }

    pub fn access_policies(&self) -> &[AccessPolicyEntry] {
        &self.properties.access_policies
    }

    pub fn find_policy(&self, object_id: &ObjectId) -> Option<&AccessPolicyEntry> {
        find_access_policy(object_id.as_str(), self.access_policies())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultProperties {
    #[serde(default)]
    pub tenant_id: String,

    #[serde(default)]
    pub sku: Option<Sku>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub access_policies: Vec<AccessPolicyEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sku {
    #[serde(default)]
    pub family: Option<String>,

    pub name: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Lookup
// ============================================================================

/// Find the entry granted to `object_id`.
///
/// Linear scan with an exact, case-sensitive comparison. Returns the first
/// match, or `None` when the principal has no policy on the vault; absence is
/// an expected outcome, not an error.
pub fn find_access_policy<'a>(
    object_id: &str,
    entries: &'a [AccessPolicyEntry],
) -> Option<&'a AccessPolicyEntry> {
    entries
        .iter()
        .find(|entry| entry.object_id.as_str() == object_id)
}
