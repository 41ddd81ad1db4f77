//! # Scenarios
//!
//! The four acceptance tests for `azurerm_key_vault_access_policy`, expressed
//! as [`TestCase`] values so they can run against live infrastructure or an
//! offline engine.

use crate::checks::{
    ApplicationIdSource, ObjectIdSource, PolicyExists, PolicyMissing, ResourceAttr,
    ResourceAttrSet, RetainAttr,
};
use crate::fixtures::{render, Scenario, POLICY_ADDRESS, VAULT_ADDRESS};
use crate::harness::{KeyVaultDestroyed, TestCase, TestStep};

#[cfg(test)]
#[path = "scenarios_tests.rs"]
mod tests;

/// Key under which the policy's object id is retained before the policy is
/// removed.
pub const RETAINED_OBJECT_ID: &str = "object_id";

/// Test case name for `scenario`, matching the classic acceptance test names.
pub fn case_name(scenario: Scenario) -> &'static str {
    match scenario {
        Scenario::Basic => "TestAccAzureRMKeyVaultAccessPolicy_basic",
        Scenario::Complete => "TestAccAzureRMKeyVaultAccessPolicy_complete",
        Scenario::Update => "TestAccAzureRMKeyVaultAccessPolicy_update",
        Scenario::PolicyRemoved => "TestAccAzureRMKeyVaultAccessPolicy_removed",
    }
}

/// Build the test case exercising `scenario`.
pub fn test_case(scenario: Scenario, suffix: &str, location: &str) -> TestCase {
    match scenario {
        Scenario::Basic => basic_case(suffix, location),
        Scenario::Complete => complete_case(suffix, location),
        Scenario::Update => update_case(suffix, location),
        Scenario::PolicyRemoved => policy_removed_case(suffix, location),
    }
}

/// Grant key `get` and secret `get`/`set`.
pub fn basic_case(suffix: &str, location: &str) -> TestCase {
    TestCase::new(case_name(Scenario::Basic))
        .step(basic_step(suffix, location))
        .check_destroy(KeyVaultDestroyed)
}

/// Grant key, secret and certificate permissions with an application id.
pub fn complete_case(suffix: &str, location: &str) -> TestCase {
    let step = policy_step(Scenario::Complete, suffix, location)
        .check(ResourceAttrSet::new(POLICY_ADDRESS, "application_id"))
        .check(attr("key_permissions.0", "create"))
        .check(attr("key_permissions.1", "get"))
        .check(attr("secret_permissions.0", "get"))
        .check(attr("secret_permissions.1", "delete"))
        .check(attr("certificate_permissions.0", "create"))
        .check(attr("certificate_permissions.1", "delete"));

    TestCase::new(case_name(Scenario::Complete))
        .step(step)
        .check_destroy(KeyVaultDestroyed)
}

/// Apply the basic grant, then change it in place.
pub fn update_case(suffix: &str, location: &str) -> TestCase {
    let updated = policy_step(Scenario::Update, suffix, location)
        .check(attr("key_permissions.0", "list"))
        .check(attr("key_permissions.1", "encrypt"));

    TestCase::new(case_name(Scenario::Update))
        .step(basic_step(suffix, location))
        .step(updated)
        .check_destroy(KeyVaultDestroyed)
}

/// Apply the basic grant, then drop the policy resource and confirm the
/// vault no longer lists the principal.
///
/// The object id is retained from the first step's state, since the second
/// step's state no longer contains the policy.
pub fn policy_removed_case(suffix: &str, location: &str) -> TestCase {
    let first = basic_step(suffix, location).check(RetainAttr::new(
        POLICY_ADDRESS,
        "object_id",
        RETAINED_OBJECT_ID,
    ));
    let removed = TestStep::new(render(Scenario::PolicyRemoved, suffix, location)).check(
        PolicyMissing::new(
            VAULT_ADDRESS,
            ObjectIdSource::Retained(RETAINED_OBJECT_ID.to_string()),
        ),
    );

    TestCase::new(case_name(Scenario::PolicyRemoved))
        .step(first)
        .step(removed)
        .check_destroy(KeyVaultDestroyed)
}

fn basic_step(suffix: &str, location: &str) -> TestStep {
    policy_step(Scenario::Basic, suffix, location)
        .check(attr("key_permissions.0", "get"))
        .check(attr("secret_permissions.0", "get"))
        .check(attr("secret_permissions.1", "set"))
}

/// Render `scenario` and check its policy exists with the scenario's grant
/// and, where the scenario sets one, its application id.
fn policy_step(scenario: Scenario, suffix: &str, location: &str) -> TestStep {
    let mut exists = PolicyExists::new(POLICY_ADDRESS);
    if let Some(grant) = scenario.expected_grant() {
        exists = exists.with_permissions(grant);
    }
    if scenario.includes_application_id() {
        exists = exists.with_application_id(ApplicationIdSource::FromState);
    }
    TestStep::new(render(scenario, suffix, location)).check(exists)
}

fn attr(key: &str, value: &str) -> ResourceAttr {
    ResourceAttr::new(POLICY_ADDRESS, key, value)
}
