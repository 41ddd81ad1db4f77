//! # In-Memory Vault Client
//!
//! Thread-safe stand-in for the management API, used by tests and by offline
//! runs of the harness. Vaults are mutated directly the way an apply or a
//! destroy would change them, and failures can be injected per vault.

use super::{map_status_error, ManagementError, VaultClient};
use crate::access_policy::{AccessPolicyEntry, ObjectId, Vault, VaultRef};
use crate::context::CheckContext;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// In-memory vault store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVaultClient {
    vaults: Arc<RwLock<HashMap<VaultRef, Vault>>>,
    failures: Arc<RwLock<HashMap<VaultRef, InjectedFailure>>>,
    requests: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    status: u16,
    body: String,
}

impl InMemoryVaultClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a vault.
    pub fn insert_vault(&self, vault_ref: VaultRef, vault: Vault) {
        self.vaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vault_ref, vault);
    }

    /// Remove a vault, returning it if it existed.
    pub fn remove_vault(&self, vault_ref: &VaultRef) -> Option<Vault> {
        self.vaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(vault_ref)
    }

    pub fn contains_vault(&self, vault_ref: &VaultRef) -> bool {
        self.vaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(vault_ref)
    }

    /// Set the entry for the entry's object id, replacing an existing entry
    /// in place or appending a new one.
    ///
    /// Returns `false` when the vault does not exist.
    pub fn upsert_policy(&self, vault_ref: &VaultRef, entry: AccessPolicyEntry) -> bool {
        let mut vaults = self.vaults.write().unwrap_or_else(PoisonError::into_inner);
        let Some(vault) = vaults.get_mut(vault_ref) else {
            return false;
        };

        let policies = &mut vault.properties.access_policies;
        match policies.iter_mut().find(|p| p.object_id == entry.object_id) {
            Some(existing) => *existing = entry,
            None => policies.push(entry),
        }
        true
    }

    /// Remove every entry for `object_id`. Returns whether anything was
    /// removed.
    pub fn remove_policy(&self, vault_ref: &VaultRef, object_id: &ObjectId) -> bool {
        let mut vaults = self.vaults.write().unwrap_or_else(PoisonError::into_inner);
        let Some(vault) = vaults.get_mut(vault_ref) else {
            return false;
        };

        let policies = &mut vault.properties.access_policies;
        let before = policies.len();
        policies.retain(|p| &p.object_id != object_id);
        policies.len() != before
    }

    /// Make requests for `vault_ref` fail as if the API returned `status`
    /// with `body`.
    pub fn fail_with_status(&self, vault_ref: VaultRef, status: u16, body: impl Into<String>) {
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                vault_ref,
                InjectedFailure {
                    status,
                    body: body.into(),
                },
            );
    }

    pub fn clear_failure(&self, vault_ref: &VaultRef) {
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(vault_ref);
    }

    /// Number of `get_vault` calls served so far.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn lookup(&self, vault_ref: &VaultRef) -> Result<Vault, ManagementError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = self
            .failures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vault_ref)
        {
            return Err(map_status_error(failure.status, &failure.body));
        }

        self.vaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vault_ref)
            .cloned()
            .ok_or_else(|| ManagementError::NotFound {
                message: format!(
                    "The Resource 'Microsoft.KeyVault/vaults/{}' under resource group '{}' was not found.",
                    vault_ref.name(),
                    vault_ref.resource_group()
                ),
            })
    }
}

#[async_trait]
impl VaultClient for InMemoryVaultClient {
    async fn get_vault(
        &self,
        ctx: &CheckContext,
        vault: &VaultRef,
    ) -> Result<Vault, ManagementError> {
        ctx.run(async { self.lookup(vault) }).await
    }
}
