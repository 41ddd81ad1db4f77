//! Tests for the test case runner.

use super::*;
use crate::access_policy::{AccessPolicyEntry, ObjectId, Permissions, Vault};
use crate::checks::{ObjectIdSource, PolicyExists, PolicyMissing, ResourceAttr, RetainAttr};
use crate::management::memory::InMemoryVaultClient;
use crate::state::ResourceState;
use std::collections::VecDeque;

const POLICY: &str = "azurerm_key_vault_access_policy.test";
const VAULT: &str = "azurerm_key_vault.test";

fn vault_ref() -> VaultRef {
    VaultRef::new("acctestRG-abc123", "acctestkv-abc123").unwrap()
}

fn vault_resource() -> ResourceState {
    ResourceState::new("azurerm_key_vault", "test")
        .with_attribute("name", "acctestkv-abc123")
        .with_attribute("resource_group_name", "acctestRG-abc123")
}

fn policy_state() -> State {
    let mut state = State::new();
    state.insert(vault_resource());
    state.insert(
        ResourceState::new("azurerm_key_vault_access_policy", "test")
            .with_attribute("vault_name", "acctestkv-abc123")
            .with_attribute("vault_resource_group", "acctestRG-abc123")
            .with_attribute("object_id", "object-1")
            .with_attribute("key_permissions.0", "get"),
    );
    state
}

fn vault_only_state() -> State {
    let mut state = State::new();
    state.insert(vault_resource());
    state
}

/// Engine returning pre-recorded states. Destroy removes the vault from the
/// in-memory client unless told to fail.
struct ScriptedEngine {
    results: VecDeque<Result<State, EngineError>>,
    client: InMemoryVaultClient,
    applies: usize,
    destroys: usize,
    destroy_fails: bool,
    destroy_keeps_vault: bool,
}

impl ScriptedEngine {
    fn new(client: &InMemoryVaultClient, results: Vec<Result<State, EngineError>>) -> Self {
        Self {
            results: results.into(),
            client: client.clone(),
            applies: 0,
            destroys: 0,
            destroy_fails: false,
            destroy_keeps_vault: false,
        }
    }
}

#[async_trait]
impl ApplyEngine for ScriptedEngine {
    async fn apply(&mut self, _ctx: &CheckContext, _config: &str) -> Result<State, EngineError> {
        self.applies += 1;
        self.results.pop_front().unwrap_or_else(|| Ok(State::new()))
    }

    async fn destroy(&mut self, _ctx: &CheckContext) -> Result<(), EngineError> {
        self.destroys += 1;
        if self.destroy_fails {
            return Err(EngineError::CommandFailed {
                command: "terraform destroy".to_string(),
                status: Some(1),
                stderr: "boom".to_string(),
            });
        }
        if !self.destroy_keeps_vault {
            self.client.remove_vault(&vault_ref());
        }
        Ok(())
    }
}

fn client_with_policy() -> InMemoryVaultClient {
    let client = InMemoryVaultClient::new();
    client.insert_vault(
        vault_ref(),
        Vault::new("acctestkv-abc123", "tenant-1").with_policy(AccessPolicyEntry::new(
            "tenant-1",
            "object-1",
            Permissions::new().with_keys(["get"]),
        )),
    );
    client
}

fn basic_case() -> TestCase {
    TestCase::new("basic")
        .step(
            TestStep::new("config")
                .check(PolicyExists::new(POLICY))
                .check(ResourceAttr::new(POLICY, "key_permissions.0", "get")),
        )
        .check_destroy(KeyVaultDestroyed)
}

#[tokio::test]
async fn test_passing_case_applies_checks_and_destroys() {
    let client = client_with_policy();
    let mut engine = ScriptedEngine::new(&client, vec![Ok(policy_state())]);

    let report = run_test_case(&basic_case(), &mut engine, &client, &CheckContext::new())
        .await
        .unwrap();

    assert_eq!(report.name, "basic");
    assert_eq!(report.steps, 1);
    assert_eq!(report.checks, 2);
    assert_eq!(engine.applies, 1);
    assert_eq!(engine.destroys, 1);
}

#[tokio::test]
async fn test_pre_check_failure_runs_nothing() {
    let client = client_with_policy();
    let mut engine = ScriptedEngine::new(&client, vec![Ok(policy_state())]);
    let case = basic_case().pre_check(|| Err("ARM_CLIENT_ID must be set".to_string()));

    let err = run_test_case(&case, &mut engine, &client, &CheckContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::PreCheck { ref message } if message.contains("ARM_CLIENT_ID")));
    assert_eq!(engine.applies, 0);
    assert_eq!(engine.destroys, 0);
}

/// A failing check stops later steps but the destroy still runs.
#[tokio::test]
async fn test_failed_step_still_destroys_and_reports_index() {
    let client = client_with_policy();
    let mut engine = ScriptedEngine::new(&client, vec![Ok(policy_state()), Ok(policy_state())]);
    let case = TestCase::new("update")
        .step(TestStep::new("one").check(PolicyExists::new(POLICY)))
        .step(TestStep::new("two").check(ResourceAttr::new(POLICY, "key_permissions.0", "list")))
        .step(TestStep::new("three"))
        .check_destroy(KeyVaultDestroyed);

    let err = run_test_case(&case, &mut engine, &client, &CheckContext::new())
        .await
        .unwrap_err();

    assert_eq!(err.step(), Some(2));
    assert!(matches!(
        err,
        HarnessError::StepFailed {
            source: CheckError::AttributeMismatch { .. },
            ..
        }
    ));
    assert_eq!(engine.applies, 2);
    assert_eq!(engine.destroys, 1);
}

#[tokio::test]
async fn test_apply_failure_is_reported_with_step() {
    let client = client_with_policy();
    let mut engine = ScriptedEngine::new(
        &client,
        vec![Err(EngineError::CommandFailed {
            command: "terraform apply".to_string(),
            status: Some(1),
            stderr: "Error: building account".to_string(),
        })],
    );

    let err = run_test_case(&basic_case(), &mut engine, &client, &CheckContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Apply { step: 1, .. }));
    assert_eq!(engine.destroys, 1);
}

#[tokio::test]
async fn test_step_error_wins_over_destroy_error() {
    let client = InMemoryVaultClient::new();
    let mut engine = ScriptedEngine::new(&client, vec![Ok(policy_state())]);
    engine.destroy_fails = true;

    let err = run_test_case(&basic_case(), &mut engine, &client, &CheckContext::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::StepFailed {
            step: 1,
            source: CheckError::VaultNotFound { .. }
        }
    ));
}

#[tokio::test]
async fn test_destroy_failure_after_passing_steps() {
    let client = client_with_policy();
    let mut engine = ScriptedEngine::new(&client, vec![Ok(policy_state())]);
    engine.destroy_fails = true;

    let err = run_test_case(&basic_case(), &mut engine, &client, &CheckContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Destroy(_)));
}

#[tokio::test]
async fn test_destroy_check_fails_while_vault_exists() {
    let client = client_with_policy();
    let mut engine = ScriptedEngine::new(&client, vec![Ok(policy_state())]);
    engine.destroy_keeps_vault = true;

    let err = run_test_case(&basic_case(), &mut engine, &client, &CheckContext::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::DestroyCheckFailed(CheckError::VaultStillExists { .. })
    ));
}

/// A cancelled context fails the step, yet cleanup still happens.
#[tokio::test]
async fn test_cancelled_context_still_destroys() {
    let client = client_with_policy();
    let mut engine = ScriptedEngine::new(&client, vec![Ok(policy_state())]);
    let ctx = CheckContext::new();
    ctx.cancel();

    let err = run_test_case(&basic_case(), &mut engine, &client, &ctx)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::StepFailed {
            source: CheckError::Management(crate::ManagementError::Cancelled),
            ..
        }
    ));
    assert_eq!(engine.destroys, 1);
    assert!(!client.contains_vault(&vault_ref()));
}

/// Values retained in one step are visible to later steps.
#[tokio::test]
async fn test_retained_values_cross_steps() {
    let client = client_with_policy();
    let removal_client = client.clone();
    let mut engine = ScriptedEngine::new(&client, vec![Ok(policy_state()), Ok(vault_only_state())]);

    struct RemovePolicy(InMemoryVaultClient);

    #[async_trait]
    impl StateCheck for RemovePolicy {
        fn describe(&self) -> String {
            "simulate policy removal".to_string()
        }

        async fn check(&self, _env: &mut CheckEnv<'_>) -> Result<(), CheckError> {
            self.0.remove_policy(&vault_ref(), &ObjectId::new("object-1"));
            Ok(())
        }
    }

    let case = TestCase::new("removed")
        .step(
            TestStep::new("one")
                .check(PolicyExists::new(POLICY))
                .check(RetainAttr::new(POLICY, "object_id", "object_id"))
                .check(RemovePolicy(removal_client)),
        )
        .step(TestStep::new("two").check(PolicyMissing::new(
            VAULT,
            ObjectIdSource::Retained("object_id".to_string()),
        )))
        .check_destroy(KeyVaultDestroyed);

    let report = run_test_case(&case, &mut engine, &client, &CheckContext::new())
        .await
        .unwrap();

    assert_eq!(report.retained.get("object_id"), Some("object-1"));
}

#[tokio::test]
async fn test_key_vault_destroyed_rejects_vault_without_name() {
    let client = client_with_policy();
    let mut state = State::new();
    state.insert(ResourceState::new("azurerm_key_vault", "partial"));

    let err = KeyVaultDestroyed
        .check(&state, &client, &CheckContext::new())
        .await
        .unwrap_err();

    match err {
        CheckError::AttributeMissing { address, key } => {
            assert_eq!(address, "azurerm_key_vault.partial");
            assert_eq!(key, "name");
        }
        other => panic!("Expected AttributeMissing, got {other:?}"),
    }
}

#[tokio::test]
async fn test_key_vault_destroyed_rejects_vault_without_resource_group() {
    let client = client_with_policy();
    let mut state = State::new();
    state.insert(
        ResourceState::new("azurerm_key_vault", "partial").with_attribute("name", "acctestkv-abc123"),
    );

    let err = KeyVaultDestroyed
        .check(&state, &client, &CheckContext::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CheckError::AttributeMissing { ref key, .. } if key == "resource_group_name"
    ));
}

#[test]
fn test_debug_summarises_case() {
    let debug = format!("{:?}", basic_case());

    assert!(debug.contains("basic"));
    assert!(debug.contains("access policy azurerm_key_vault_access_policy.test exists"));
}
