//! # Acceptance Test Configuration
//!
//! Settings for live runs: Azure credentials, the location to deploy to and
//! the Terraform binary.
//!
//! Sources, later ones overriding earlier ones:
//! 1. An optional YAML/JSON/TOML file
//! 2. Environment variables prefixed `VPA__`, e.g. `VPA__LOCATION=northeurope`
//! 3. The Terraform provider's own variables: `ARM_SUBSCRIPTION_ID`,
//!    `ARM_TENANT_ID`, `ARM_CLIENT_ID`, `ARM_CLIENT_SECRET` and
//!    `ARM_TEST_LOCATION`
//!
//! Every field has a default, so an empty environment loads successfully;
//! [`AcceptanceConfig::validate`] decides whether a live run can proceed.

use crate::management::{
    token::{AzureCliCredential, ClientSecretCredential, TokenProvider, DEFAULT_LOGIN_ENDPOINT},
    ArmVaultClient, ClientConfig, ManagementError, DEFAULT_MANAGEMENT_ENDPOINT,
};
use serde::Deserialize;
use std::{fmt, path::Path, sync::Arc, time::Duration};
use tracing::{debug, info};

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Environment variable that enables live acceptance tests.
pub const ACCEPTANCE_ENV_VAR: &str = "TF_ACC";

/// Prefix of this tool's own environment variables.
pub const ENV_PREFIX: &str = "VPA";

/// Provider variables and the setting each one overrides.
const ARM_OVERRIDES: [(&str, &str); 5] = [
    ("ARM_SUBSCRIPTION_ID", "subscription_id"),
    ("ARM_TENANT_ID", "tenant_id"),
    ("ARM_CLIENT_ID", "client_id"),
    ("ARM_CLIENT_SECRET", "client_secret"),
    ("ARM_TEST_LOCATION", "location"),
];

/// Whether live acceptance tests were requested (`TF_ACC` is set to a
/// non-empty value).
pub fn acceptance_enabled() -> bool {
    std::env::var(ACCEPTANCE_ENV_VAR).is_ok_and(|v| !v.is_empty())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{setting} must be set for acceptance tests (environment variable {env_var})")]
    MissingSetting {
        setting: &'static str,
        env_var: &'static str,
    },

    #[error("Invalid value for {setting}: {reason}")]
    InvalidValue {
        setting: &'static str,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Settings for a live acceptance run.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AcceptanceConfig {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Azure region the test resources are created in
    pub location: String,
    /// Path or name of the terraform executable
    pub terraform_binary: String,
    pub management_endpoint: String,
    pub login_endpoint: String,
    pub request_timeout_seconds: u64,
    /// Upper bound for one apply or destroy
    pub step_timeout_seconds: u64,
}

impl Default for AcceptanceConfig {
    fn default() -> Self {
        Self {
            subscription_id: String::new(),
            tenant_id: String::new(),
            client_id: None,
            client_secret: None,
            location: "westeurope".to_string(),
            terraform_binary: "terraform".to_string(),
            management_endpoint: DEFAULT_MANAGEMENT_ENDPOINT.to_string(),
            login_endpoint: DEFAULT_LOGIN_ENDPOINT.to_string(),
            request_timeout_seconds: 30,
            step_timeout_seconds: 3600,
        }
    }
}

impl fmt::Debug for AcceptanceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptanceConfig")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("location", &self.location)
            .field("terraform_binary", &self.terraform_binary)
            .field("management_endpoint", &self.management_endpoint)
            .field("login_endpoint", &self.login_endpoint)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("step_timeout_seconds", &self.step_timeout_seconds)
            .finish()
    }
}

impl AcceptanceConfig {
    /// Load from the environment only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from an optional file, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        for (env_var, setting) in ARM_OVERRIDES {
            let value = std::env::var(env_var).ok().filter(|v| !v.is_empty());
            if value.is_some() {
                debug!(env_var, "Using provider environment variable");
            }
            builder = builder.set_override_option(setting, value)?;
        }

        let config: AcceptanceConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check everything a live Terraform run needs: the service principal
    /// credentials the provider is given, plus a location.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_management()?;

        if self.tenant_id.trim().is_empty() {
            return Err(ConfigError::MissingSetting {
                setting: "tenant_id",
                env_var: "ARM_TENANT_ID",
            });
        }
        if is_blank(&self.client_id) {
            return Err(ConfigError::MissingSetting {
                setting: "client_id",
                env_var: "ARM_CLIENT_ID",
            });
        }
        if is_blank(&self.client_secret) {
            return Err(ConfigError::MissingSetting {
                setting: "client_secret",
                env_var: "ARM_CLIENT_SECRET",
            });
        }
        if self.location.trim().is_empty() {
            return Err(ConfigError::MissingSetting {
                setting: "location",
                env_var: "ARM_TEST_LOCATION",
            });
        }
        if self.terraform_binary.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                setting: "terraform_binary",
                reason: "must not be empty".to_string(),
            });
        }
        if self.step_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                setting: "step_timeout_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Check what a direct management API query needs. Credentials may come
    /// from the Azure CLI, so only the subscription is mandatory.
    pub fn validate_management(&self) -> Result<(), ConfigError> {
        if self.subscription_id.trim().is_empty() {
            return Err(ConfigError::MissingSetting {
                setting: "subscription_id",
                env_var: "ARM_SUBSCRIPTION_ID",
            });
        }
        if is_blank(&self.client_id) != is_blank(&self.client_secret) {
            return Err(ConfigError::InvalidValue {
                setting: "client_secret",
                reason: "client_id and client_secret must be set together".to_string(),
            });
        }
        for (setting, value) in [
            ("management_endpoint", &self.management_endpoint),
            ("login_endpoint", &self.login_endpoint),
        ] {
            if let Err(e) = url::Url::parse(value) {
                return Err(ConfigError::InvalidValue {
                    setting,
                    reason: format!("{value:?} is not a URL: {e}"),
                });
            }
        }
        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                setting: "request_timeout_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_management_endpoint(self.management_endpoint.clone())
            .with_timeout(self.request_timeout())
    }

    /// Service principal credentials when a secret is configured, otherwise
    /// the signed-in Azure CLI.
    pub fn credential(&self) -> Arc<dyn TokenProvider> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Arc::new(
                ClientSecretCredential::new(
                    self.tenant_id.clone(),
                    id.clone(),
                    secret.clone(),
                    &self.management_endpoint,
                )
                .with_login_endpoint(self.login_endpoint.clone())
                .with_timeout(self.request_timeout()),
            ),
            _ => {
                let cli = AzureCliCredential::new(&self.management_endpoint);
                if self.tenant_id.is_empty() {
                    Arc::new(cli)
                } else {
                    Arc::new(cli.with_tenant(self.tenant_id.clone()))
                }
            }
        }
    }

    /// Management client for the configured subscription.
    pub fn vault_client(&self) -> Result<ArmVaultClient, ManagementError> {
        ArmVaultClient::with_config(
            self.subscription_id.clone(),
            self.credential(),
            self.client_config(),
        )
    }

    /// Variables exported to the terraform process so the provider
    /// authenticates as the same principal.
    pub fn arm_environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "ARM_SUBSCRIPTION_ID".to_string(),
                self.subscription_id.clone(),
            ),
            ("ARM_TENANT_ID".to_string(), self.tenant_id.clone()),
        ];
        if let Some(id) = &self.client_id {
            env.push(("ARM_CLIENT_ID".to_string(), id.clone()));
        }
        if let Some(secret) = &self.client_secret {
            env.push(("ARM_CLIENT_SECRET".to_string(), secret.clone()));
        }
        env.retain(|(_, value)| !value.is_empty());
        env
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}
