//! # Verifier Module
//!
//! Existence and absence checks for an access policy, answered by the
//! management API.
//!
//! The client and the [`CheckContext`] are parameters. Nothing is read from
//! process-wide state, so the same verifier runs against the live API, a
//! mock server or [`crate::InMemoryVaultClient`].

use crate::access_policy::{AccessPolicyEntry, ObjectId, PermissionKind, VaultRef};
use crate::context::CheckContext;
use crate::management::{ManagementError, VaultClient};
use crate::ValidationError;
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "verifier_tests.rs"]
mod tests;

/// A check that did not hold, or could not be evaluated.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("Not found: {address} in state")]
    ResourceNotInState { address: String },

    #[error("{address}: attribute {key:?} not found in state")]
    AttributeMissing { address: String, key: String },

    #[error("{address}: attribute {key:?} expected {expected:?}, got {actual:?}")]
    AttributeMismatch {
        address: String,
        key: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("Bad: Key Vault {name:?} (resource group: {resource_group:?}) does not exist")]
    VaultNotFound {
        name: String,
        resource_group: String,
    },

    #[error(
        "Bad: Key Vault {vault:?} (resource group: {resource_group:?}) has no access policy for object id {object_id:?}"
    )]
    PolicyAbsent {
        vault: String,
        resource_group: String,
        object_id: String,
    },

    #[error(
        "Bad: Key Vault {vault:?} (resource group: {resource_group:?}) still has an access policy for object id {object_id:?}"
    )]
    PolicyPresent {
        vault: String,
        resource_group: String,
        object_id: String,
    },

    #[error("Access policy for {object_id:?}: {kind} expected {expected:?}, got {actual:?}")]
    PermissionMismatch {
        object_id: String,
        kind: PermissionKind,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Access policy for {object_id:?}: application id expected {expected:?}, got {actual:?}")]
    ApplicationIdMismatch {
        object_id: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("No value retained under {key:?}")]
    RetainedValueMissing { key: String },

    #[error("Key Vault {name:?} (resource group: {resource_group:?}) still exists")]
    VaultStillExists {
        name: String,
        resource_group: String,
    },

    #[error("Invalid vault reference in state: {0}")]
    InvalidReference(#[from] ValidationError),

    #[error("Bad: Get on keyVaultClient: {0}")]
    Management(#[from] ManagementError),
}

/// Outcome of looking a principal up on a vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyLookup {
    Found(AccessPolicyEntry),
    Absent,
}

impl PolicyLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, PolicyLookup::Found(_))
    }
}

/// Fetch the vault and look for the entry granted to `object_id`.
///
/// A missing vault is [`CheckError::VaultNotFound`]; any other API failure
/// is wrapped unchanged in [`CheckError::Management`].
#[instrument(skip(client, ctx), fields(vault = %vault, object_id = %object_id))]
pub async fn lookup_policy(
    client: &dyn VaultClient,
    ctx: &CheckContext,
    vault: &VaultRef,
    object_id: &ObjectId,
) -> Result<PolicyLookup, CheckError> {
    let state = match client.get_vault(ctx, vault).await {
        Ok(state) => state,
        Err(e) if e.is_not_found() => {
            warn!("Key Vault does not exist");
            return Err(CheckError::VaultNotFound {
                name: vault.name().to_string(),
                resource_group: vault.resource_group().to_string(),
            });
        }
        Err(e) => return Err(CheckError::Management(e)),
    };

    let lookup = match state.find_policy(object_id) {
        Some(entry) => PolicyLookup::Found(entry.clone()),
        None => PolicyLookup::Absent,
    };
    debug!(found = lookup.is_found(), "Looked up access policy");
    Ok(lookup)
}

/// Succeed with the entry when `object_id` has an access policy on the vault.
pub async fn verify_policy_exists(
    client: &dyn VaultClient,
    ctx: &CheckContext,
    vault: &VaultRef,
    object_id: &ObjectId,
) -> Result<AccessPolicyEntry, CheckError> {
    match lookup_policy(client, ctx, vault, object_id).await? {
        PolicyLookup::Found(entry) => Ok(entry),
        PolicyLookup::Absent => Err(CheckError::PolicyAbsent {
            vault: vault.name().to_string(),
            resource_group: vault.resource_group().to_string(),
            object_id: object_id.to_string(),
        }),
    }
}

/// Succeed when `object_id` has no access policy on the vault. The vault
/// itself must still exist.
pub async fn verify_policy_missing(
    client: &dyn VaultClient,
    ctx: &CheckContext,
    vault: &VaultRef,
    object_id: &ObjectId,
) -> Result<(), CheckError> {
    match lookup_policy(client, ctx, vault, object_id).await? {
        PolicyLookup::Absent => Ok(()),
        PolicyLookup::Found(_) => Err(CheckError::PolicyPresent {
            vault: vault.name().to_string(),
            resource_group: vault.resource_group().to_string(),
            object_id: object_id.to_string(),
        }),
    }
}
