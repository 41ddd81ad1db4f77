//! # Vault Policy Core
//!
//! Acceptance-test building blocks for the Azure Key Vault access policy
//! resource (`azurerm_key_vault_access_policy`).
//!
//! The crate provides:
//! - Terraform configuration fixtures for the access policy scenarios
//! - A model of applied Terraform state with flattened attribute addressing
//! - A client for the Key Vault management API and an in-memory stand-in
//! - Verifiers that look up an access policy by object identifier
//! - A step runner that applies configurations, runs checks and tears down
//!
//! ## Architecture
//!
//! Verifiers never reach for ambient configuration. The management client and
//! the [`CheckContext`] (cancellation and deadline) are passed explicitly, so
//! the same checks run against the live API, a mock HTTP server or the
//! in-memory client.
//!
//! ## Usage
//!
//! ```rust
//! use vault_policy_core::{find_access_policy, fixtures, AccessPolicyEntry, Scenario};
//!
//! let config = fixtures::render(Scenario::Basic, "abc123", "westeurope");
//! assert!(config.contains("acctestkv-abc123"));
//!
//! let entries: Vec<AccessPolicyEntry> = Vec::new();
//! assert!(find_access_policy("00000000-0000-0000-0000-000000000000", &entries).is_none());
//! ```

pub mod access_policy;
pub mod checks;
pub mod config;
pub mod context;
pub mod fixtures;
pub mod harness;
pub mod management;
pub mod scenarios;
pub mod state;
pub mod verifier;

pub use access_policy::{
    find_access_policy, AccessPolicyEntry, ObjectId, PermissionDiff, PermissionKind, Permissions,
    Sku, Vault, VaultProperties, VaultRef,
};
pub use checks::{
    ApplicationIdSource, CheckEnv, ObjectIdSource, PolicyExists, PolicyMissing, ResourceAttr,
    ResourceAttrSet, RetainAttr, Retained, StateCheck,
};
pub use config::{acceptance_enabled, AcceptanceConfig, ConfigError};
pub use context::{CheckContext, Interrupted};
pub use fixtures::{random_suffix, Scenario, UnknownScenario};
pub use harness::{
    run_test_case, ApplyEngine, CaseReport, DestroyCheck, EngineError, HarnessError,
    KeyVaultDestroyed, TerraformCli, TestCase, TestStep,
};
pub use management::{
    memory::InMemoryVaultClient,
    token::{
        AccessToken, AzureCliCredential, ClientSecretCredential, StaticToken, TokenError,
        TokenProvider,
    },
    ArmVaultClient, ClientConfig, ManagementError, VaultClient,
};
pub use state::{ResourceState, State, StateError};
pub use verifier::{
    lookup_policy, verify_policy_exists, verify_policy_missing, CheckError, PolicyLookup,
};

/// Input validation errors.
///
/// Raised when an identifier or name does not satisfy the Azure naming rules
/// before any request is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required field is missing.
    #[error("Required field missing: {field}")]
    Required { field: String },

    /// A field has an invalid format.
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },
}
