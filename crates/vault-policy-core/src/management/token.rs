//! Bearer token acquisition for the management API.
//!
//! Three providers are available:
//! - [`ClientSecretCredential`]: OAuth2 client-credentials flow for a service
//!   principal, the same credentials the Terraform provider is given
//! - [`AzureCliCredential`]: `az account get-access-token` for local runs
//! - [`StaticToken`]: a fixed token for tests

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Deserialize;
use std::{fmt, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;

/// Tokens are refreshed this long before they expire.
pub const EXPIRY_MARGIN_SECONDS: i64 = 60;

/// Token requests give up after this long unless configured otherwise.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default login endpoint for the public cloud.
pub const DEFAULT_LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";

/// Errors obtaining a token.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("Token endpoint rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Token response was not understood: {message}")]
    InvalidResponse { message: String },

    #[error("Azure CLI token request failed: {message}")]
    CliFailed { message: String },
}

/// A bearer token and its expiry. The secret is wiped on drop and never
/// printed by `Debug`.
#[derive(Clone)]
pub struct AccessToken {
    secret: Zeroizing<String>,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        self.secret.as_str()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the token expires within the refresh margin of `now`.
    pub fn is_expiring(&self, now: DateTime<Utc>) -> bool {
        match self
            .expires_at
            .checked_sub_signed(ChronoDuration::seconds(EXPIRY_MARGIN_SECONDS))
        {
            Some(refresh_at) => refresh_at <= now,
            None => true,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of bearer tokens for the management API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<AccessToken, TokenError>;
}

// ============================================================================
// Static
// ============================================================================

/// Always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: AccessToken,
}

impl StaticToken {
    /// A token that is valid for a day.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            token: AccessToken::new(secret, Utc::now() + ChronoDuration::hours(24)),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<AccessToken, TokenError> {
        Ok(self.token.clone())
    }
}

// ============================================================================
// Client credentials
// ============================================================================

/// OAuth2 client-credentials flow for a service principal.
///
/// Tokens are cached and reused until [`EXPIRY_MARGIN_SECONDS`] before they
/// expire.
pub struct ClientSecretCredential {
    tenant_id: String,
    client_id: String,
    client_secret: Zeroizing<String>,
    login_endpoint: String,
    scope: String,
    http_client: reqwest::Client,
    timeout: Duration,
    cache: Mutex<Option<AccessToken>>,
}

impl ClientSecretCredential {
    /// Create a credential for the public cloud, scoped to
    /// `management_endpoint`.
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        management_endpoint: &str,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: Zeroizing::new(client_secret.into()),
            login_endpoint: DEFAULT_LOGIN_ENDPOINT.to_string(),
            scope: format!("{}/.default", management_endpoint.trim_end_matches('/')),
            http_client: reqwest::Client::new(),
            timeout: DEFAULT_TOKEN_TIMEOUT,
            cache: Mutex::new(None),
        }
    }

    /// Use a different login endpoint (sovereign clouds, mock servers).
    pub fn with_login_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.login_endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Bound each token request, connect through to the last body byte.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = client;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    async fn request_token(&self) -> Result<AccessToken, TokenError> {
        let url = format!("{}/{}/oauth2/v2.0/token", self.login_endpoint, self.tenant_id);
        debug!(tenant_id = %self.tenant_id, client_id = %self.client_id, "Requesting management token");

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let response = self
            .http_client
            .post(&url)
            .timeout(self.timeout)
            .form(&params)
            .send()
            .await
            .map_err(TokenError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OAuthError>(&body)
                .map(|e| e.error_description.unwrap_or(e.error))
                .unwrap_or(body);
            warn!(status = status.as_u16(), "Token endpoint rejected request");
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::InvalidResponse {
                message: e.to_string(),
            })?;

        let expires_at = expiry_after(Utc::now(), body.expires_in.seconds()?)?;
        Ok(AccessToken::new(body.access_token, expires_at))
    }
}

impl fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("login_endpoint", &self.login_endpoint)
            .field("scope", &self.scope)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Expiry instant for a token issued at `now` that lives `expires_in`
/// seconds. Negative lifetimes and instants chrono cannot represent are
/// rejected as an invalid response.
fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, TokenError> {
    if expires_in < 0 {
        return Err(TokenError::InvalidResponse {
            message: format!("expires_in is negative: {expires_in}"),
        });
    }
    ChronoDuration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| TokenError::InvalidResponse {
            message: format!("expires_in is out of range: {expires_in}"),
        })
}

#[async_trait]
impl TokenProvider for ClientSecretCredential {
    #[instrument(skip(self), fields(tenant_id = %self.tenant_id))]
    async fn token(&self) -> Result<AccessToken, TokenError> {
        // Held across the request so concurrent callers share one refresh.
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if !token.is_expiring(Utc::now()) {
                return Ok(token.clone());
            }
        }

        let token = self.request_token().await?;
        *cache = Some(token.clone());
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: ExpiresIn,
}

/// `expires_in` arrives as a number from the v2 endpoint and as a string
/// from some older ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(i64),
    Text(String),
}

impl Default for ExpiresIn {
    fn default() -> Self {
        ExpiresIn::Seconds(3600)
    }
}

impl ExpiresIn {
    fn seconds(&self) -> Result<i64, TokenError> {
        match self {
            ExpiresIn::Seconds(s) => Ok(*s),
            ExpiresIn::Text(s) => s.trim().parse().map_err(|_| TokenError::InvalidResponse {
                message: format!("expires_in is not a number: {s:?}"),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OAuthError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

// ============================================================================
// Azure CLI
// ============================================================================

/// Token from the signed-in Azure CLI.
#[derive(Debug, Clone)]
pub struct AzureCliCredential {
    program: String,
    resource: String,
    tenant_id: Option<String>,
}

impl AzureCliCredential {
    pub fn new(management_endpoint: &str) -> Self {
        Self {
            program: "az".to_string(),
            resource: management_endpoint.trim_end_matches('/').to_string(),
            tenant_id: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Use a different executable than `az` on the `PATH`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl TokenProvider for AzureCliCredential {
    #[instrument(skip(self))]
    async fn token(&self) -> Result<AccessToken, TokenError> {
        let mut command = tokio::process::Command::new(&self.program);
        command.args([
            "account",
            "get-access-token",
            "--resource",
            &self.resource,
            "--output",
            "json",
        ]);
        if let Some(tenant) = &self.tenant_id {
            command.args(["--tenant", tenant]);
        }

        let output = command
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TokenError::CliFailed {
                message: format!("could not run {}: {e}", self.program),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TokenError::CliFailed {
                message: format!("{}. Run 'az login' first.", stderr.trim()),
            });
        }

        parse_cli_token(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenResponse {
    access_token: String,
    #[serde(default, rename = "expires_on")]
    expires_on: Option<i64>,
}

/// Parse `az account get-access-token` output. Older CLI versions omit the
/// numeric `expires_on`; those tokens are treated as valid for five minutes.
fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken, TokenError> {
    let response: CliTokenResponse =
        serde_json::from_slice(stdout).map_err(|e| TokenError::InvalidResponse {
            message: format!("az output: {e}"),
        })?;

    let expires_at = response
        .expires_on
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(|| Utc::now() + ChronoDuration::minutes(5));

    Ok(AccessToken::new(response.access_token, expires_at))
}
