//! # Configuration Fixtures
//!
//! Renders the Terraform configurations applied by the access policy
//! acceptance tests.
//!
//! Every configuration declares a resource group, a premium Key Vault and,
//! except for [`Scenario::PolicyRemoved`], one `azurerm_key_vault_access_policy`
//! that grants the running service principal a scenario-specific set of
//! permissions. Names are suffixed with a random string so concurrent runs
//! never collide.

use crate::access_policy::Permissions;
use rand::Rng;
use std::{fmt, fmt::Write as _, str::FromStr};

#[cfg(test)]
#[path = "fixtures_tests.rs"]
mod tests;

/// Terraform address of the access policy under test.
pub const POLICY_ADDRESS: &str = "azurerm_key_vault_access_policy.test";

/// Terraform address of the vault holding the policy.
pub const VAULT_ADDRESS: &str = "azurerm_key_vault.test";

/// Terraform address of the resource group holding the vault.
pub const RESOURCE_GROUP_ADDRESS: &str = "azurerm_resource_group.test";

/// Length of the random suffix appended to resource names.
pub const SUFFIX_LENGTH: usize = 6;

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// The configurations exercised against the access policy resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Key `get`, secret `get`/`set`.
    Basic,
    /// Key, secret and certificate permissions plus an application id.
    Complete,
    /// Key `list`/`encrypt`, secret permissions cleared.
    Update,
    /// Vault retained, access policy resource removed.
    PolicyRemoved,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::Basic,
        Scenario::Complete,
        Scenario::Update,
        Scenario::PolicyRemoved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Basic => "basic",
            Scenario::Complete => "complete",
            Scenario::Update => "update",
            Scenario::PolicyRemoved => "policy-removed",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Scenario::Basic => "grant key get and secret get/set",
            Scenario::Complete => {
                "grant key, secret and certificate permissions with an application id"
            }
            Scenario::Update => "change key permissions to list/encrypt and clear secrets",
            Scenario::PolicyRemoved => "remove the access policy and keep the vault",
        }
    }

    /// Permissions the scenario's access policy grants, or `None` when the
    /// configuration declares no policy.
    pub fn expected_grant(&self) -> Option<Permissions> {
        match self {
            Scenario::Basic => Some(
                Permissions::new()
                    .with_keys(["get"])
                    .with_secrets(["get", "set"]),
            ),
            Scenario::Complete => Some(
                Permissions::new()
                    .with_keys(["create", "get"])
                    .with_secrets(["get", "delete"])
                    .with_certificates(["create", "delete"]),
            ),
            Scenario::Update => Some(
                Permissions::new()
                    .with_keys(["list", "encrypt"])
                    .with_secrets(Vec::<String>::new()),
            ),
            Scenario::PolicyRemoved => None,
        }
    }

    /// Whether the policy also binds the principal's application id.
    pub fn includes_application_id(&self) -> bool {
        matches!(self, Scenario::Complete)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = UnknownScenario;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "basic" => Ok(Scenario::Basic),
            "complete" => Ok(Scenario::Complete),
            "update" => Ok(Scenario::Update),
            "policy-removed" | "policyremoved" => Ok(Scenario::PolicyRemoved),
            _ => Err(UnknownScenario {
                name: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown scenario {name:?} (expected one of: basic, complete, update, policy-removed)")]
pub struct UnknownScenario {
    pub name: String,
}

/// Name of the resource group created for `suffix`.
pub fn resource_group_name(suffix: &str) -> String {
    format!("acctestRG-{suffix}")
}

/// Name of the vault created for `suffix`.
pub fn vault_name(suffix: &str) -> String {
    format!("acctestkv-{suffix}")
}

/// Random lowercase alphanumeric suffix, short enough to keep vault names
/// within the 24 character limit.
pub fn random_suffix() -> String {
    random_string(SUFFIX_LENGTH)
}

pub fn random_string(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Render the complete configuration for `scenario`.
pub fn render(scenario: Scenario, suffix: &str, location: &str) -> String {
    let mut config = String::new();
    write_common(&mut config, suffix, location);

    if let Some(grant) = scenario.expected_grant() {
        config.push('\n');
        write_policy(&mut config, &grant, scenario.includes_application_id());
    }

    config
}

// `write!` into a String cannot fail, so results below are discarded.

fn write_common(out: &mut String, suffix: &str, location: &str) {
    let _ = write!(
        out,
        r#"data "azurerm_client_config" "current" {{}}

resource "azurerm_resource_group" "test" {{
  name     = "{resource_group}"
  location = "{location}"
}}

resource "azurerm_key_vault" "test" {{
  name                = "{vault}"
  location            = "${{azurerm_resource_group.test.location}}"
  resource_group_name = "${{azurerm_resource_group.test.name}}"
  tenant_id           = "${{data.azurerm_client_config.current.tenant_id}}"

  sku {{
    name = "premium"
  }}

  tags = {{
    environment = "Production"
  }}
}}
"#,
        resource_group = resource_group_name(suffix),
        location = location,
        vault = vault_name(suffix),
    );
}

fn write_policy(out: &mut String, grant: &Permissions, with_application_id: bool) {
    out.push_str("resource \"azurerm_key_vault_access_policy\" \"test\" {\n");
    out.push_str("  vault_name           = \"${azurerm_key_vault.test.name}\"\n");
    out.push_str("  vault_resource_group = \"${azurerm_resource_group.test.name}\"\n\n");

    write_list(out, "key_permissions", &grant.keys);
    write_list(out, "secret_permissions", &grant.secrets);
    if !grant.certificates.is_empty() {
        write_list(out, "certificate_permissions", &grant.certificates);
    }
    out.push('\n');

    if with_application_id {
        out.push_str(
            "  application_id = \"${data.azurerm_client_config.current.service_principal_application_id}\"\n",
        );
    }
    out.push_str("  tenant_id      = \"${data.azurerm_client_config.current.tenant_id}\"\n");
    out.push_str(
        "  object_id      = \"${data.azurerm_client_config.current.service_principal_object_id}\"\n",
    );
    out.push_str("}\n");
}

fn write_list(out: &mut String, name: &str, values: &[String]) {
    if values.is_empty() {
        let _ = writeln!(out, "  {name} = []");
        return;
    }

    let _ = writeln!(out, "  {name} = [");
    for value in values {
        let _ = writeln!(out, "    \"{value}\",");
    }
    out.push_str("  ]\n");
}
