//! # Management API Module
//!
//! Read access to Key Vaults through the Azure Resource Manager API.
//!
//! Only one call is needed: fetching a vault, whose properties carry the full
//! access policy list. [`ArmVaultClient`] performs that call over HTTP;
//! [`memory::InMemoryVaultClient`] is a stand-in for tests and offline runs.
//!
//! Requests are never retried. Every failure is reported to the caller.

use crate::access_policy::{Vault, VaultRef};
use crate::context::{CheckContext, Interrupted};
use async_trait::async_trait;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

pub mod memory;
pub mod token;

use token::{TokenError, TokenProvider};

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

/// API version of the `Microsoft.KeyVault/vaults` resource.
pub const DEFAULT_API_VERSION: &str = "2018-02-14";

/// Resource Manager endpoint of the public cloud.
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

// ============================================================================
// Errors
// ============================================================================

/// Errors from management API operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagementError {
    #[error("Vault not found: {message}")]
    NotFound { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Access denied: {message}")]
    AuthorizationFailed { message: String },

    #[error("Management API returned {status} ({code}): {message}")]
    HttpError {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Response could not be decoded: {message}")]
    Decode { message: String },

    #[error("Could not obtain a token: {0}")]
    Authentication(#[from] TokenError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Client configuration error: {message}")]
    Configuration { message: String },
}

impl ManagementError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ManagementError::NotFound { .. })
    }

    /// Whether the failure is likely to clear on its own. Nothing here
    /// retries; callers use this to word their reports.
    pub fn is_transient(&self) -> bool {
        match self {
            ManagementError::HttpError { status, .. } => *status == 429 || *status >= 500,
            ManagementError::Transport(_) | ManagementError::Timeout => true,
            _ => false,
        }
    }
}

impl From<Interrupted> for ManagementError {
    fn from(value: Interrupted) -> Self {
        match value {
            Interrupted::Cancelled => ManagementError::Cancelled,
            Interrupted::DeadlineExceeded => ManagementError::DeadlineExceeded,
        }
    }
}

// ============================================================================
// Client trait
// ============================================================================

/// Read access to vaults.
#[async_trait]
pub trait VaultClient: Send + Sync {
    /// Fetch the vault, including its access policy list.
    ///
    /// A vault that does not exist is [`ManagementError::NotFound`].
    async fn get_vault(
        &self,
        ctx: &CheckContext,
        vault: &VaultRef,
    ) -> Result<Vault, ManagementError>;
}

#[async_trait]
impl<T: VaultClient + ?Sized> VaultClient for Arc<T> {
    async fn get_vault(
        &self,
        ctx: &CheckContext,
        vault: &VaultRef,
    ) -> Result<Vault, ManagementError> {
        (**self).get_vault(ctx, vault).await
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the management API client.
///
/// # Examples
///
/// ```
/// use vault_policy_core::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_timeout(Duration::from_secs(10))
///     .with_management_endpoint("https://management.usgovcloudapi.net");
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Resource Manager base URL
    pub management_endpoint: String,
    /// `api-version` query parameter
    pub api_version: String,
    /// User agent for API requests
    pub user_agent: String,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            management_endpoint: DEFAULT_MANAGEMENT_ENDPOINT.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            user_agent: format!("vault-policy-acctest/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn with_management_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.management_endpoint = endpoint.into();
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ============================================================================
// HTTP client
// ============================================================================

/// Key Vault management client over the Resource Manager REST API.
pub struct ArmVaultClient {
    subscription_id: String,
    token: Arc<dyn TokenProvider>,
    http_client: reqwest::Client,
    endpoint: Url,
    config: ClientConfig,
}

impl ArmVaultClient {
    /// Create a client for `subscription_id` with default configuration.
    pub fn new(
        subscription_id: impl Into<String>,
        token: Arc<dyn TokenProvider>,
    ) -> Result<Self, ManagementError> {
        Self::with_config(subscription_id, token, ClientConfig::default())
    }

    /// Create a client with explicit configuration.
    #[instrument(skip_all, fields(endpoint = %config.management_endpoint))]
    pub fn with_config(
        subscription_id: impl Into<String>,
        token: Arc<dyn TokenProvider>,
        config: ClientConfig,
    ) -> Result<Self, ManagementError> {
        let subscription_id = subscription_id.into();
        if subscription_id.trim().is_empty() {
            return Err(ManagementError::Configuration {
                message: "subscription_id is required".to_string(),
            });
        }

        let endpoint =
            Url::parse(&config.management_endpoint).map_err(|e| ManagementError::Configuration {
                message: format!(
                    "invalid management endpoint {:?}: {e}",
                    config.management_endpoint
                ),
            })?;
        if endpoint.cannot_be_a_base() {
            return Err(ManagementError::Configuration {
                message: format!(
                    "management endpoint {:?} cannot be used as a base URL",
                    config.management_endpoint
                ),
            });
        }

        let http_client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ManagementError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        info!(subscription_id = %subscription_id, "Created management API client");

        Ok(Self {
            subscription_id,
            token,
            http_client,
            endpoint,
            config,
        })
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resource URL of `vault`, including the `api-version` query.
    pub fn vault_url(&self, vault: &VaultRef) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "subscriptions",
                self.subscription_id.as_str(),
                "resourceGroups",
                vault.resource_group(),
                "providers",
                "Microsoft.KeyVault",
                "vaults",
                vault.name(),
            ]);
        }
        url.query_pairs_mut()
            .clear()
            .append_pair("api-version", &self.config.api_version);
        url
    }

    async fn fetch_vault(&self, vault: &VaultRef) -> Result<Vault, ManagementError> {
        let token = self.token.token().await?;
        let url = self.vault_url(vault);
        debug!(url = %url, "GET vault");

        let response = self
            .http_client
            .get(url)
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await.map_err(map_transport_error)?;
            return serde_json::from_slice(&body).map_err(|e| ManagementError::Decode {
                message: e.to_string(),
            });
        }

        Err(status_error(status.as_u16(), response.text().await))
    }
}

#[async_trait]
impl VaultClient for ArmVaultClient {
    #[instrument(skip(self, ctx), fields(vault = %vault))]
    async fn get_vault(
        &self,
        ctx: &CheckContext,
        vault: &VaultRef,
    ) -> Result<Vault, ManagementError> {
        let result = ctx.run(self.fetch_vault(vault)).await;
        match &result {
            Ok(found) => {
                debug!(policies = found.access_policies().len(), "Fetched vault");
            }
            Err(e) if e.is_not_found() => {
                debug!("Vault does not exist");
            }
            Err(e) => {
                error!(error = %e, "Failed to fetch vault");
            }
        }
        result
    }
}

fn map_transport_error(error: reqwest::Error) -> ManagementError {
    if error.is_timeout() {
        ManagementError::Timeout
    } else {
        ManagementError::Transport(error)
    }
}

/// Map a non-success response whose body may not have arrived in full. A
/// failed read keeps the status and carries the read error as the message.
fn status_error(status: u16, body: Result<String, reqwest::Error>) -> ManagementError {
    match body {
        Ok(body) => map_status_error(status, &body),
        Err(e) => {
            warn!(status, error = %e, "Failed to read error response body");
            map_status_error(status, &format!("response body could not be read: {e}"))
        }
    }
}

/// Map a non-success response to an error, reading the Resource Manager
/// error envelope `{"error": {"code", "message"}}` when present.
pub(crate) fn map_status_error(status: u16, body: &str) -> ManagementError {
    let (code, message) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.code, envelope.error.message),
        Err(_) => (String::new(), body.trim().to_string()),
    };

    match status {
        404 => ManagementError::NotFound { message },
        401 => ManagementError::AuthenticationFailed { message },
        403 => ManagementError::AuthorizationFailed { message },
        _ => ManagementError::HttpError {
            status,
            code,
            message,
        },
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}
