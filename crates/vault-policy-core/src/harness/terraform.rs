//! Apply engine backed by the `terraform` command-line tool.
//!
//! Each engine owns a temporary working directory holding a single
//! `main.tf`. Every apply overwrites that file, so a step replaces the
//! previous step's configuration the same way an edited configuration would.
//! The directory is removed when the engine is dropped.

use super::{ApplyEngine, EngineError};
use crate::config::AcceptanceConfig;
use crate::context::CheckContext;
use crate::state::State;
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tempfile::TempDir;
use tracing::{debug, info, instrument};

#[cfg(test)]
#[path = "terraform_tests.rs"]
mod tests;

/// Name of the configuration file written into the working directory.
pub const CONFIG_FILE: &str = "main.tf";

/// Trailing bytes of stderr kept in [`EngineError::CommandFailed`].
const STDERR_TAIL: usize = 4096;

pub struct TerraformCli {
    binary: PathBuf,
    workdir: TempDir,
    env: Vec<(String, String)>,
    command_timeout: Option<Duration>,
    initialized: bool,
}

impl TerraformCli {
    /// Create an engine running `binary` in a fresh temporary directory.
    pub fn new(binary: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let workdir = tempfile::Builder::new()
            .prefix("vault-policy-acctest-")
            .tempdir()?;
        Ok(Self {
            binary: binary.into(),
            workdir,
            env: Vec::new(),
            command_timeout: None,
            initialized: false,
        })
    }

    /// Create an engine for the configured binary with the provider
    /// credentials exported to every command.
    pub fn from_config(config: &AcceptanceConfig) -> Result<Self, EngineError> {
        let mut engine =
            Self::new(&config.terraform_binary)?.with_command_timeout(config.step_timeout());
        for (key, value) in config.arm_environment() {
            engine = engine.with_env(key, value);
        }
        Ok(engine)
    }

    /// Export an environment variable to every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Bound every terraform invocation, on top of the caller's deadline.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn working_dir(&self) -> &Path {
        self.workdir.path()
    }

    #[instrument(skip(self, ctx), fields(binary = %self.binary.display()))]
    async fn terraform(&self, ctx: &CheckContext, args: &[&str]) -> Result<String, EngineError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(args)
            .current_dir(self.workdir.path())
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("Running terraform");
        let output = ctx
            .child(self.command_timeout)
            .run(async { command.output().await.map_err(EngineError::Io) })
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let start = (start..stderr.len())
                .find(|i| stderr.is_char_boundary(*i))
                .unwrap_or(stderr.len());
            return Err(EngineError::CommandFailed {
                command: format!("terraform {}", args.first().copied().unwrap_or_default()),
                status: output.status.code(),
                stderr: stderr[start..].trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ApplyEngine for TerraformCli {
    async fn apply(&mut self, ctx: &CheckContext, config: &str) -> Result<State, EngineError> {
        tokio::fs::write(self.workdir.path().join(CONFIG_FILE), config).await?;

        if !self.initialized {
            info!(dir = %self.workdir.path().display(), "Initializing terraform working directory");
            self.terraform(ctx, &["init", "-input=false", "-no-color"])
                .await?;
            self.initialized = true;
        }

        self.terraform(ctx, &["apply", "-auto-approve", "-input=false", "-no-color"])
            .await?;
        let show = self.terraform(ctx, &["show", "-json", "-no-color"]).await?;
        Ok(State::from_show_json(&show)?)
    }

    async fn destroy(&mut self, ctx: &CheckContext) -> Result<(), EngineError> {
        if !self.initialized {
            debug!("Nothing applied; skipping destroy");
            return Ok(());
        }
        self.terraform(ctx, &["destroy", "-auto-approve", "-input=false", "-no-color"])
            .await?;
        Ok(())
    }
}
