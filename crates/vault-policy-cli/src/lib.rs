//! # Vault Policy Acceptance CLI
//!
//! Command-line interface for the Key Vault access policy acceptance tests.
//!
//! This module provides CLI commands for:
//! - Listing and rendering the scenario configurations
//! - Checking a live vault for the presence or absence of an access policy
//! - Running a scenario end to end with Terraform

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::{path::PathBuf, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vault_policy_core::{
    fixtures::{self, resource_group_name, vault_name, Scenario},
    random_suffix, run_test_case, scenarios, verify_policy_exists, verify_policy_missing,
    AcceptanceConfig, CheckContext, CheckError, ConfigError, EngineError, HarnessError,
    ManagementError, ObjectId, TerraformCli, VaultRef,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Name of the installed binary, used for shell completions.
pub const BINARY_NAME: &str = "vault-policy-acctest";

// ============================================================================
// CLI Structure
// ============================================================================

/// Acceptance tests for Azure Key Vault access policies
#[derive(Debug, Parser)]
#[command(name = "vault-policy-acctest")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Acceptance tests for Azure Key Vault access policies")]
#[command(
    long_about = "Renders the access policy test configurations, checks live vaults for a principal's access policy and runs the scenarios end to end with Terraform"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VAULT_POLICY_ACCTEST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is not set
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Overall deadline for the command in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List the available scenarios
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the Terraform configuration for a scenario
    Render {
        /// Scenario to render (basic, complete, update, policy-removed)
        scenario: Scenario,

        /// Resource name suffix; random when omitted
        #[arg(short, long)]
        suffix: Option<String>,

        /// Azure region; defaults to the configured location
        #[arg(long)]
        location: Option<String>,
    },

    /// Check a live vault for a principal's access policy
    Verify {
        #[command(subcommand)]
        check: VerifyCommands,
    },

    /// Run a scenario end to end against Azure with Terraform
    Run {
        /// Scenario to run (basic, complete, update, policy-removed)
        scenario: Scenario,

        /// Resource name suffix; random when omitted
        #[arg(short, long)]
        suffix: Option<String>,

        /// Azure region; defaults to the configured location
        #[arg(long)]
        location: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Access policy checks
#[derive(Debug, Subcommand)]
pub enum VerifyCommands {
    /// Succeed when the principal has an access policy on the vault
    Exists(VerifyArgs),

    /// Succeed when the principal has no access policy on the vault
    Missing(VerifyArgs),
}

#[derive(Debug, clap::Args)]
pub struct VerifyArgs {
    /// Resource group holding the vault
    #[arg(short, long)]
    pub resource_group: String,

    /// Vault name
    #[arg(short, long)]
    pub vault: String,

    /// Object id of the principal
    #[arg(short, long)]
    pub object_id: String,

    /// Output format
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Failed to initialize logging: {message}")]
    Logging { message: String },

    #[error("Check failed: {0}")]
    Check(#[from] CheckError),

    #[error("Test case failed: {0}")]
    Harness(#[from] HarnessError),

    #[error("Management API error: {0}")]
    Client(#[from] ManagementError),

    #[error("Terraform error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Failed to serialize output: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error.
    ///
    /// A check that did not hold is 2, whether it failed on its own or inside
    /// a test case; a failure to run the test at all is 3.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Configuration(_) | CliError::Logging { .. } => 1,
            CliError::Check(_) => 2,
            CliError::Harness(HarnessError::StepFailed { .. })
            | CliError::Harness(HarnessError::DestroyCheckFailed(_)) => 2,
            CliError::Harness(HarnessError::PreCheck { .. }) => 1,
            CliError::Harness(_) | CliError::Client(_) | CliError::Engine(_) => 3,
            CliError::InvalidArgument { .. } => 4,
            CliError::Serialization(_) | CliError::Io(_) => 5,
        }
    }
}

// ============================================================================
// Entry points
// ============================================================================

/// Parse the command line, execute the command and print its output.
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let output = execute(&cli).await?;
    print!("{output}");
    Ok(())
}

/// Execute the parsed command and return what it prints on stdout.
pub async fn execute(cli: &Cli) -> Result<String, CliError> {
    match &cli.command {
        Commands::List { format } => list_scenarios(*format),
        Commands::Render {
            scenario,
            suffix,
            location,
        } => execute_render_command(cli, *scenario, suffix.as_deref(), location.as_deref()),
        Commands::Verify { check } => execute_verify_command(cli, check).await,
        Commands::Run {
            scenario,
            suffix,
            location,
        } => execute_run_command(cli, *scenario, suffix.as_deref(), location.as_deref()).await,
        Commands::Completions { shell } => generate_completions(*shell),
    }
}

/// Initialize the tracing subscriber. Logs go to stderr so that rendered
/// configurations and JSON output on stdout stay clean.
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::Logging {
            message: format!("invalid log level {:?}: {e}", cli.log_level),
        })?;

    let json_layer = cli
        .json_logs
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!cli.json_logs).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })
}

// ============================================================================
// Command implementations
// ============================================================================

#[derive(Debug, Serialize)]
struct ScenarioSummary {
    name: &'static str,
    test_case: &'static str,
    description: &'static str,
}

fn list_scenarios(format: OutputFormat) -> Result<String, CliError> {
    let summaries: Vec<ScenarioSummary> = Scenario::ALL
        .into_iter()
        .map(|scenario| ScenarioSummary {
            name: scenario.as_str(),
            test_case: scenarios::case_name(scenario),
            description: scenario.description(),
        })
        .collect();

    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&summaries)? + "\n"),
        OutputFormat::Text => Ok(summaries
            .iter()
            .map(|s| format!("{:<16}{}\n", s.name, s.description))
            .collect()),
    }
}

fn execute_render_command(
    cli: &Cli,
    scenario: Scenario,
    suffix: Option<&str>,
    location: Option<&str>,
) -> Result<String, CliError> {
    let location = match location {
        Some(location) => location.to_string(),
        None => load_configuration(cli)?.location,
    };
    let (suffix, _) = resolve_names(suffix)?;
    let location = require_non_empty("location", location)?;

    info!(scenario = %scenario, suffix = %suffix, "Rendering configuration");
    Ok(fixtures::render(scenario, &suffix, &location))
}

async fn execute_verify_command(cli: &Cli, check: &VerifyCommands) -> Result<String, CliError> {
    let (args, expect_present) = match check {
        VerifyCommands::Exists(args) => (args, true),
        VerifyCommands::Missing(args) => (args, false),
    };

    let vault = VaultRef::new(&args.resource_group, &args.vault).map_err(|e| {
        CliError::InvalidArgument {
            arg: "vault".to_string(),
            message: e.to_string(),
        }
    })?;
    let object_id = ObjectId::new(require_non_empty("object-id", args.object_id.clone())?);

    let config = load_configuration(cli)?;
    config.validate_management()?;
    let client = config.vault_client()?;
    let ctx = command_context(cli);

    info!(vault = %vault, object_id = %object_id, expect_present, "Verifying access policy");

    if expect_present {
        let entry = verify_policy_exists(&client, &ctx, &vault, &object_id).await?;
        match args.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(&entry)? + "\n"),
            OutputFormat::Text => {
                let mut out = format!("Access policy for {object_id} found on {vault}\n");
                if let Some(application_id) = &entry.application_id {
                    out.push_str(&format!("  application_id:          {application_id}\n"));
                }
                out.push_str(&format!(
                    "  key_permissions:         {}\n  secret_permissions:      {}\n  certificate_permissions: {}\n",
                    entry.permissions.keys.join(", "),
                    entry.permissions.secrets.join(", "),
                    entry.permissions.certificates.join(", "),
                ));
                Ok(out)
            }
        }
    } else {
        verify_policy_missing(&client, &ctx, &vault, &object_id).await?;
        match args.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(&serde_json::json!({
                "vault": vault.name(),
                "resource_group": vault.resource_group(),
                "object_id": object_id,
                "present": false,
            }))? + "\n"),
            OutputFormat::Text => Ok(format!("No access policy for {object_id} on {vault}\n")),
        }
    }
}

async fn execute_run_command(
    cli: &Cli,
    scenario: Scenario,
    suffix: Option<&str>,
    location: Option<&str>,
) -> Result<String, CliError> {
    let mut config = load_configuration(cli)?;
    if let Some(location) = location {
        config.location = location.to_string();
    }
    config.validate()?;

    let (suffix, vault) = resolve_names(suffix)?;
    let case = scenarios::test_case(scenario, &suffix, &config.location);
    let client = config.vault_client()?;
    let mut engine = TerraformCli::from_config(&config)?;

    let cancellation = CancellationToken::new();
    let ctx = command_context(cli).with_cancellation(cancellation.clone());
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling the run and destroying test resources");
            cancellation.cancel();
        }
    });

    info!(
        case = %case.name,
        vault = %vault,
        workdir = %engine.working_dir().display(),
        "Running scenario"
    );
    let result = run_test_case(&case, &mut engine, &client, &ctx).await;
    interrupt.abort();

    let report = result?;
    Ok(format!(
        "PASS {} ({} steps, {} checks)\n",
        report.name, report.steps, report.checks
    ))
}

fn generate_completions(shell: clap_complete::Shell) -> Result<String, CliError> {
    let mut buffer = Vec::new();
    clap_complete::generate(shell, &mut Cli::command(), BINARY_NAME, &mut buffer);
    String::from_utf8(buffer).map_err(|e| CliError::Io(std::io::Error::other(e)))
}

// ============================================================================
// Helpers
// ============================================================================

fn load_configuration(cli: &Cli) -> Result<AcceptanceConfig, CliError> {
    Ok(AcceptanceConfig::load(cli.config.as_deref())?)
}

fn command_context(cli: &Cli) -> CheckContext {
    match cli.timeout {
        Some(seconds) => CheckContext::with_timeout(Duration::from_secs(seconds)),
        None => CheckContext::new(),
    }
}

/// Pick the suffix, generating one when absent, and check the names it
/// produces are valid Azure resource names.
fn resolve_names(suffix: Option<&str>) -> Result<(String, VaultRef), CliError> {
    let suffix = suffix.map_or_else(random_suffix, str::to_string);
    let vault = VaultRef::new(resource_group_name(&suffix), vault_name(&suffix)).map_err(|e| {
        CliError::InvalidArgument {
            arg: "suffix".to_string(),
            message: e.to_string(),
        }
    })?;
    Ok((suffix, vault))
}

fn require_non_empty(arg: &str, value: String) -> Result<String, CliError> {
    if value.trim().is_empty() {
        return Err(CliError::InvalidArgument {
            arg: arg.to_string(),
            message: "must not be empty".to_string(),
        });
    }
    Ok(value)
}
