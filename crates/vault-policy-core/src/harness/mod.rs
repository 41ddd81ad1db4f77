//! # Harness Module
//!
//! Runs an acceptance test case: apply each step's configuration, check the
//! result, then destroy everything and confirm the vaults are gone.
//!
//! ## Lifecycle
//!
//! 1. Pre-check (credentials present)
//! 2. For each step, in order: apply, then run the step's checks. The first
//!    failing apply or check ends the sequence.
//! 3. Destroy, always, even after a failure
//! 4. Destroy check, only when every step passed
//!
//! The first error wins: a destroy failure after a failed step is logged but
//! the step's error is what the caller sees.

use crate::checks::{required, CheckEnv, Retained, StateCheck};
use crate::context::{CheckContext, Interrupted};
use crate::management::VaultClient;
use crate::state::{State, StateError};
use crate::verifier::CheckError;
use crate::VaultRef;
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, error, info, instrument, warn};

pub mod terraform;

pub use terraform::TerraformCli;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

// ============================================================================
// Test case definition
// ============================================================================

/// Pre-flight check run before anything is applied.
pub type PreCheck = Box<dyn Fn() -> Result<(), String> + Send + Sync>;

/// One configuration to apply and the checks to run against the result.
pub struct TestStep {
    pub config: String,
    pub checks: Vec<Box<dyn StateCheck>>,
}

impl TestStep {
    pub fn new(config: impl Into<String>) -> Self {
        Self {
            config: config.into(),
            checks: Vec::new(),
        }
    }

    /// Append a check. Checks run in the order they were added.
    pub fn check(mut self, check: impl StateCheck + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }
}

impl fmt::Debug for TestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestStep")
            .field("config_bytes", &self.config.len())
            .field(
                "checks",
                &self.checks.iter().map(|c| c.describe()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A named sequence of steps with optional pre-check and destroy check.
pub struct TestCase {
    pub name: String,
    pub pre_check: Option<PreCheck>,
    pub steps: Vec<TestStep>,
    pub check_destroy: Option<Box<dyn DestroyCheck>>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pre_check: None,
            steps: Vec::new(),
            check_destroy: None,
        }
    }

    pub fn pre_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.pre_check = Some(Box::new(check));
        self
    }

    pub fn step(mut self, step: TestStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn check_destroy(mut self, check: impl DestroyCheck + 'static) -> Self {
        self.check_destroy = Some(Box::new(check));
        self
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("pre_check", &self.pre_check.is_some())
            .field("steps", &self.steps)
            .field("check_destroy", &self.check_destroy.is_some())
            .finish()
    }
}

// ============================================================================
// Apply engine
// ============================================================================

/// Errors from the apply engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{command} failed (exit status {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Could not read applied state: {0}")]
    State(#[from] StateError),

    #[error("Interrupted: {0}")]
    Interrupted(#[from] Interrupted),
}

/// Applies configurations and destroys what was applied.
#[async_trait]
pub trait ApplyEngine: Send {
    /// Apply `config`, replacing whatever the previous step applied, and
    /// return the resulting state.
    async fn apply(&mut self, ctx: &CheckContext, config: &str) -> Result<State, EngineError>;

    /// Destroy everything applied so far.
    async fn destroy(&mut self, ctx: &CheckContext) -> Result<(), EngineError>;
}

// ============================================================================
// Destroy checks
// ============================================================================

/// Check run after the destroy, against the last applied state.
#[async_trait]
pub trait DestroyCheck: Send + Sync {
    async fn check(
        &self,
        last_state: &State,
        client: &dyn VaultClient,
        ctx: &CheckContext,
    ) -> Result<(), CheckError>;
}

/// Every `azurerm_key_vault` from the last applied state is gone.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyVaultDestroyed;

#[async_trait]
impl DestroyCheck for KeyVaultDestroyed {
    async fn check(
        &self,
        last_state: &State,
        client: &dyn VaultClient,
        ctx: &CheckContext,
    ) -> Result<(), CheckError> {
        for resource in last_state.resources_of_type("azurerm_key_vault") {
            let name = required(resource, "name")?;
            let resource_group = required(resource, "resource_group_name")?;
            let vault = VaultRef::new(resource_group, name)?;

            match client.get_vault(ctx, &vault).await {
                Err(e) if e.is_not_found() => {
                    debug!(vault = %vault, "Key Vault destroyed");
                }
                Err(e) => return Err(CheckError::Management(e)),
                Ok(_) => {
                    return Err(CheckError::VaultStillExists {
                        name: name.to_string(),
                        resource_group: resource_group.to_string(),
                    })
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Why a test case failed.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Pre-check failed: {message}")]
    PreCheck { message: String },

    #[error("Step {step}: apply failed: {source}")]
    Apply {
        step: usize,
        #[source]
        source: EngineError,
    },

    #[error("Step {step}: check failed: {source}")]
    StepFailed {
        step: usize,
        #[source]
        source: CheckError,
    },

    #[error("Destroy failed: {0}")]
    Destroy(#[source] EngineError),

    #[error("Destroy check failed: {0}")]
    DestroyCheckFailed(#[source] CheckError),
}

impl HarnessError {
    /// 1-based index of the failing step, if a step failed.
    pub fn step(&self) -> Option<usize> {
        match self {
            HarnessError::Apply { step, .. } | HarnessError::StepFailed { step, .. } => {
                Some(*step)
            }
            _ => None,
        }
    }
}

/// Summary of a passing test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseReport {
    pub name: String,
    pub steps: usize,
    pub checks: usize,
    pub retained: Retained,
}

/// Run `case` to completion against `engine`, checking through `client`.
///
/// Steps run strictly in order. The destroy runs even when a step fails or
/// `ctx` has been cancelled; it uses its own context so that cleanup is not
/// cut short.
#[instrument(skip_all, fields(case = %case.name))]
pub async fn run_test_case(
    case: &TestCase,
    engine: &mut dyn ApplyEngine,
    client: &dyn VaultClient,
    ctx: &CheckContext,
) -> Result<CaseReport, HarnessError> {
    if let Some(pre_check) = &case.pre_check {
        pre_check().map_err(|message| HarnessError::PreCheck { message })?;
    }

    info!(steps = case.steps.len(), "Starting test case");

    let mut retained = Retained::new();
    let mut last_state = State::new();
    let mut checks_run = 0;
    let mut outcome = Ok(());

    for (index, step) in case.steps.iter().enumerate() {
        let number = index + 1;
        info!(step = number, "Applying step");

        let state = match engine.apply(ctx, &step.config).await {
            Ok(state) => state,
            Err(source) => {
                error!(step = number, error = %source, "Apply failed");
                outcome = Err(HarnessError::Apply {
                    step: number,
                    source,
                });
                break;
            }
        };
        last_state = state;

        let mut env = CheckEnv::new(&last_state, &mut retained, client, ctx);
        if let Err(source) = run_checks(&step.checks, &mut env).await {
            error!(step = number, error = %source, "Check failed");
            outcome = Err(HarnessError::StepFailed {
                step: number,
                source,
            });
            break;
        }
        checks_run += step.checks.len();
        info!(step = number, "Step passed");
    }

    info!("Destroying test resources");
    let destroy_ctx = CheckContext::new();
    let destroyed = engine.destroy(&destroy_ctx).await;

    match (outcome, destroyed) {
        (Err(e), Err(destroy_error)) => {
            warn!(error = %destroy_error, "Destroy failed after step failure; resources may remain");
            return Err(e);
        }
        (Err(e), Ok(())) => return Err(e),
        (Ok(()), Err(destroy_error)) => return Err(HarnessError::Destroy(destroy_error)),
        (Ok(()), Ok(())) => {}
    }

    if let Some(check) = &case.check_destroy {
        check
            .check(&last_state, client, ctx)
            .await
            .map_err(HarnessError::DestroyCheckFailed)?;
    }

    info!("Test case passed");
    Ok(CaseReport {
        name: case.name.clone(),
        steps: case.steps.len(),
        checks: checks_run,
        retained,
    })
}

async fn run_checks(
    checks: &[Box<dyn StateCheck>],
    env: &mut CheckEnv<'_>,
) -> Result<(), CheckError> {
    for check in checks {
        debug!(check = %check.describe(), "Running check");
        check.check(env).await?;
    }
    Ok(())
}
