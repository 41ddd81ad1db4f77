//! Common test utilities for the access policy acceptance tests
//!
//! This module provides:
//! - `SimulatedTerraform`, an apply engine that reads the rendered
//!   configurations and mutates an `InMemoryVaultClient` the way the provider
//!   would mutate Azure
//! - Fault injection for applies, destroys and policy creation
//! - Builders for `terraform show -json` documents

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use vault_policy_core::{
    AccessPolicyEntry, ApplyEngine, CheckContext, EngineError, InMemoryVaultClient, ObjectId,
    Permissions, State, Vault, VaultRef,
};

pub const TENANT_ID: &str = "72f988bf-86f1-41af-91ab-2d7cd011db47";
pub const OBJECT_ID: &str = "3a5b7c9d-1e2f-4a6b-8c0d-9e8f7a6b5c4d";
pub const APPLICATION_ID: &str = "9f8e7d6c-5b4a-4321-8fed-cba987654321";

// ============================================================================
// Configuration reader
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum AttrValue {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Block {
    kind: String,
    resource_type: String,
    name: String,
    attributes: BTreeMap<String, AttrValue>,
}

/// Read the top-level attributes of each block in a rendered configuration.
/// Nested blocks and maps are skipped.
fn read_blocks(config: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;
    let mut depth = 0usize;
    let mut open_list: Option<(String, Vec<String>)> = None;

    for line in config.lines().map(str::trim) {
        if let Some((key, mut items)) = open_list.take() {
            if line == "]" {
                if let Some(block) = current.as_mut() {
                    block.attributes.insert(key, AttrValue::List(items));
                }
            } else {
                items.push(unquote(line.trim_end_matches(',')));
                open_list = Some((key, items));
            }
            continue;
        }

        if depth == 0 {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 && (parts[0] == "resource" || parts[0] == "data") {
                current = Some(Block {
                    kind: parts[0].to_string(),
                    resource_type: unquote(parts[1]),
                    name: unquote(parts[2]),
                    attributes: BTreeMap::new(),
                });
                depth = if line.ends_with("{}") { 0 } else { 1 };
                if depth == 0 {
                    blocks.extend(current.take());
                }
            }
            continue;
        }

        if line == "}" {
            depth -= 1;
            if depth == 0 {
                blocks.extend(current.take());
            }
            continue;
        }
        if line.ends_with('{') {
            depth += 1;
            continue;
        }
        if depth != 1 {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim().to_string(), value.trim());
        if value == "[" {
            open_list = Some((key, Vec::new()));
        } else if value == "[]" {
            if let Some(block) = current.as_mut() {
                block.attributes.insert(key, AttrValue::List(Vec::new()));
            }
        } else if let Some(block) = current.as_mut() {
            block.attributes.insert(key, AttrValue::Text(unquote(value)));
        }
    }

    blocks
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

/// Resolve `${...}` references against the other blocks and the principal
/// the simulated provider runs as.
fn resolve(value: &str, blocks: &[Block]) -> String {
    let Some(reference) = value
        .strip_prefix("${")
        .and_then(|v| v.strip_suffix('}'))
    else {
        return value.to_string();
    };

    match reference {
        "data.azurerm_client_config.current.tenant_id" => return TENANT_ID.to_string(),
        "data.azurerm_client_config.current.service_principal_object_id" => {
            return OBJECT_ID.to_string()
        }
        "data.azurerm_client_config.current.service_principal_application_id" => {
            return APPLICATION_ID.to_string()
        }
        _ => {}
    }

    let parts: Vec<&str> = reference.split('.').collect();
    if let [resource_type, name, attribute] = parts.as_slice() {
        let target = blocks
            .iter()
            .find(|b| b.kind == "resource" && b.resource_type == *resource_type && b.name == *name);
        if let Some(AttrValue::Text(text)) = target.and_then(|b| b.attributes.get(*attribute)) {
            return resolve(text, blocks);
        }
    }
    value.to_string()
}

fn text(block: &Block, key: &str, blocks: &[Block]) -> Option<String> {
    match block.attributes.get(key) {
        Some(AttrValue::Text(value)) => Some(resolve(value, blocks)),
        _ => None,
    }
}

fn list(block: &Block, key: &str) -> Vec<String> {
    match block.attributes.get(key) {
        Some(AttrValue::List(items)) => items.clone(),
        _ => Vec::new(),
    }
}

// ============================================================================
// Simulated Terraform
// ============================================================================

/// Faults the simulated engine can inject.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// 1-based apply number that fails with a command error
    pub fail_apply: Option<usize>,
    /// Report the policy in state but never create it on the vault
    pub skip_policy_creation: bool,
    /// Create the policy with these permissions instead of the configured ones
    pub grant_override: Option<Permissions>,
    /// Leave the policy on the vault when the configuration drops it
    pub keep_removed_policy: bool,
    /// Ignore `application_id` entirely, in state and on the vault
    pub drop_application_id: bool,
    /// Record `application_id` in state but create the entry without it
    pub unbind_application_id: bool,
    /// Fail every destroy
    pub fail_destroy: bool,
    /// Report a successful destroy but leave the vault in place
    pub leave_vault: bool,
}

/// Apply engine that reads the rendered configuration and applies it to an
/// in-memory vault store.
pub struct SimulatedTerraform {
    client: InMemoryVaultClient,
    faults: Faults,
    applied_vault: Option<VaultRef>,
    applied_policy: Option<ObjectId>,
    pub applies: usize,
    pub destroys: usize,
    pub configs: Vec<String>,
}

impl SimulatedTerraform {
    pub fn new(client: InMemoryVaultClient) -> Self {
        Self::with_faults(client, Faults::default())
    }

    pub fn with_faults(client: InMemoryVaultClient, faults: Faults) -> Self {
        Self {
            client,
            faults,
            applied_vault: None,
            applied_policy: None,
            applies: 0,
            destroys: 0,
            configs: Vec::new(),
        }
    }

    #[allow(dead_code)]
    pub fn applied_vault(&self) -> Option<&VaultRef> {
        self.applied_vault.as_ref()
    }

    fn apply_blocks(&mut self, blocks: &[Block]) -> Result<Value, EngineError> {
        let mut resources = Vec::new();
        let mut vault_ref = None;

        for block in blocks {
            let address = format!("{}.{}", block.resource_type, block.name);
            match (block.kind.as_str(), block.resource_type.as_str()) {
                ("data", _) => resources.push(show_resource(
                    &format!("data.{address}"),
                    "data",
                    block,
                    json!({ "tenant_id": TENANT_ID, "service_principal_object_id": OBJECT_ID }),
                )),
                (_, "azurerm_resource_group") => {
                    let name = text(block, "name", blocks).unwrap_or_default();
                    let location = text(block, "location", blocks).unwrap_or_default();
                    resources.push(show_resource(
                        &address,
                        "managed",
                        block,
                        resource_group_values(&name, &location),
                    ));
                }
                (_, "azurerm_key_vault") => {
                    let name = text(block, "name", blocks).unwrap_or_default();
                    let resource_group = text(block, "resource_group_name", blocks).unwrap_or_default();
                    let location = text(block, "location", blocks).unwrap_or_default();
                    let vault = VaultRef::new(&resource_group, &name)
                        .map_err(|e| command_failed(e.to_string()))?;
                    if !self.client.contains_vault(&vault) {
                        self.client
                            .insert_vault(vault.clone(), Vault::new(&name, TENANT_ID));
                    }
                    vault_ref = Some(vault);
                    resources.push(show_resource(
                        &address,
                        "managed",
                        block,
                        vault_values(&name, &resource_group, &location),
                    ));
                }
                (_, "azurerm_key_vault_access_policy") => {
                    let vault = VaultRef::new(
                        text(block, "vault_resource_group", blocks).unwrap_or_default(),
                        text(block, "vault_name", blocks).unwrap_or_default(),
                    )
                    .map_err(|e| command_failed(e.to_string()))?;
                    let object_id = text(block, "object_id", blocks).unwrap_or_default();
                    let application_id = text(block, "application_id", blocks)
                        .filter(|_| !self.faults.drop_application_id);
                    let granted = Permissions::new()
                        .with_keys(list(block, "key_permissions"))
                        .with_secrets(list(block, "secret_permissions"))
                        .with_certificates(list(block, "certificate_permissions"));

                    if !self.faults.skip_policy_creation {
                        let permissions = self
                            .faults
                            .grant_override
                            .clone()
                            .unwrap_or_else(|| granted.clone());
                        let mut entry =
                            AccessPolicyEntry::new(TENANT_ID, object_id.as_str(), permissions);
                        if let Some(application_id) = application_id
                            .as_ref()
                            .filter(|_| !self.faults.unbind_application_id)
                        {
                            entry = entry.with_application_id(application_id.clone());
                        }
                        if !self.client.upsert_policy(&vault, entry) {
                            return Err(command_failed(format!("Key Vault {vault} not found")));
                        }
                    }
                    self.applied_policy = Some(ObjectId::new(object_id.as_str()));
                    resources.push(show_resource(
                        &address,
                        "managed",
                        block,
                        policy_values(&vault, &object_id, application_id.as_deref(), &granted),
                    ));
                }
                _ => {}
            }
        }

        let declares_policy = blocks
            .iter()
            .any(|b| b.resource_type == "azurerm_key_vault_access_policy");
        if !declares_policy {
            if let (Some(vault), Some(object_id)) = (&vault_ref, self.applied_policy.take()) {
                if !self.faults.keep_removed_policy {
                    self.client.remove_policy(vault, &object_id);
                }
            }
        }
        self.applied_vault = vault_ref;

        Ok(json!({
            "format_version": "1.0",
            "values": { "root_module": { "resources": resources } }
        }))
    }
}

#[async_trait]
impl ApplyEngine for SimulatedTerraform {
    async fn apply(&mut self, ctx: &CheckContext, config: &str) -> Result<State, EngineError> {
        if ctx.is_cancelled() {
            return Err(vault_policy_core::Interrupted::Cancelled.into());
        }
        self.applies += 1;
        self.configs.push(config.to_string());

        if self.faults.fail_apply == Some(self.applies) {
            return Err(command_failed("Error: simulated apply failure".to_string()));
        }

        let blocks = read_blocks(config);
        let document = self.apply_blocks(&blocks)?;
        Ok(State::from_value(document)?)
    }

    async fn destroy(&mut self, _ctx: &CheckContext) -> Result<(), EngineError> {
        self.destroys += 1;
        if self.faults.fail_destroy {
            return Err(EngineError::CommandFailed {
                command: "terraform destroy".to_string(),
                status: Some(1),
                stderr: "Error: simulated destroy failure".to_string(),
            });
        }
        if let Some(vault) = self.applied_vault.take() {
            if !self.faults.leave_vault {
                self.client.remove_vault(&vault);
            }
        }
        self.applied_policy = None;
        Ok(())
    }
}

fn command_failed(stderr: String) -> EngineError {
    EngineError::CommandFailed {
        command: "terraform apply".to_string(),
        status: Some(1),
        stderr,
    }
}

// ============================================================================
// show -json builders
// ============================================================================

fn show_resource(address: &str, mode: &str, block: &Block, values: Value) -> Value {
    json!({
        "address": address,
        "mode": mode,
        "type": block.resource_type,
        "name": block.name,
        "provider_name": "registry.terraform.io/hashicorp/azurerm",
        "schema_version": 0,
        "values": values,
    })
}

pub fn resource_group_values(name: &str, location: &str) -> Value {
    json!({
        "id": format!("/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/{name}"),
        "name": name,
        "location": location,
        "tags": null,
    })
}

pub fn vault_values(name: &str, resource_group: &str, location: &str) -> Value {
    json!({
        "id": format!(
            "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/{resource_group}/providers/Microsoft.KeyVault/vaults/{name}"
        ),
        "name": name,
        "resource_group_name": resource_group,
        "location": location,
        "tenant_id": TENANT_ID,
        "sku": [{ "name": "premium" }],
        "tags": { "environment": "Production" },
        "vault_uri": format!("https://{name}.vault.azure.net/"),
    })
}

pub fn policy_values(
    vault: &VaultRef,
    object_id: &str,
    application_id: Option<&str>,
    granted: &Permissions,
) -> Value {
    json!({
        "id": format!("{}/objectId/{object_id}", vault.name()),
        "vault_name": vault.name(),
        "vault_resource_group": vault.resource_group(),
        "tenant_id": TENANT_ID,
        "object_id": object_id,
        "application_id": application_id,
        "key_permissions": granted.keys,
        "secret_permissions": granted.secrets,
        "certificate_permissions": granted.certificates,
    })
}
