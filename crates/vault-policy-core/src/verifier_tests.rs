//! Tests for the existence and absence verifiers.

use super::*;
use crate::access_policy::{Permissions, Vault};
use crate::management::memory::InMemoryVaultClient;
use std::time::Duration;

fn vault_ref() -> VaultRef {
    VaultRef::new("acctestRG-abc123", "acctestkv-abc123").unwrap()
}

fn client_with(policies: &[&str]) -> InMemoryVaultClient {
    let client = InMemoryVaultClient::new();
    let mut vault = Vault::new("acctestkv-abc123", "tenant-1");
    for id in policies {
        vault = vault.with_policy(AccessPolicyEntry::new(
            "tenant-1",
            *id,
            Permissions::new().with_keys(["get"]),
        ));
    }
    client.insert_vault(vault_ref(), vault);
    client
}

mod exists {
    use super::*;

    #[tokio::test]
    async fn test_returns_entry_when_present() {
        let client = client_with(&["other", "object-1"]);

        let entry = verify_policy_exists(
            &client,
            &CheckContext::new(),
            &vault_ref(),
            &ObjectId::new("object-1"),
        )
        .await
        .unwrap();

        assert_eq!(entry.object_id.as_str(), "object-1");
    }

    #[tokio::test]
    async fn test_absent_policy_fails() {
        let client = client_with(&["other"]);

        let err = verify_policy_exists(
            &client,
            &CheckContext::new(),
            &vault_ref(),
            &ObjectId::new("object-1"),
        )
        .await
        .unwrap_err();

        match err {
            CheckError::PolicyAbsent {
                vault,
                resource_group,
                object_id,
            } => {
                assert_eq!(vault, "acctestkv-abc123");
                assert_eq!(resource_group, "acctestRG-abc123");
                assert_eq!(object_id, "object-1");
            }
            other => panic!("Expected PolicyAbsent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_policy_list_fails() {
        let client = client_with(&[]);

        let err = verify_policy_exists(
            &client,
            &CheckContext::new(),
            &vault_ref(),
            &ObjectId::new("object-1"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CheckError::PolicyAbsent { .. }));
    }

    /// The lookup is exact: a differently-cased identifier is a different
    /// principal.
    #[tokio::test]
    async fn test_case_differing_id_is_absent() {
        let client = client_with(&["OBJECT-1"]);

        let err = verify_policy_exists(
            &client,
            &CheckContext::new(),
            &vault_ref(),
            &ObjectId::new("object-1"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CheckError::PolicyAbsent { .. }));
    }
}

mod missing {
    use super::*;

    #[tokio::test]
    async fn test_succeeds_when_absent() {
        let client = client_with(&["other"]);

        verify_policy_missing(
            &client,
            &CheckContext::new(),
            &vault_ref(),
            &ObjectId::new("object-1"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_present_policy_fails() {
        let client = client_with(&["object-1"]);

        let err = verify_policy_missing(
            &client,
            &CheckContext::new(),
            &vault_ref(),
            &ObjectId::new("object-1"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CheckError::PolicyPresent { .. }));
        assert!(err.to_string().contains("still has an access policy"));
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_missing_vault_fails_both_checks() {
        let client = InMemoryVaultClient::new();
        let ctx = CheckContext::new();
        let id = ObjectId::new("object-1");

        let exists = verify_policy_exists(&client, &ctx, &vault_ref(), &id)
            .await
            .unwrap_err();
        let missing = verify_policy_missing(&client, &ctx, &vault_ref(), &id)
            .await
            .unwrap_err();

        for err in [exists, missing] {
            match err {
                CheckError::VaultNotFound {
                    name,
                    resource_group,
                } => {
                    assert_eq!(name, "acctestkv-abc123");
                    assert_eq!(resource_group, "acctestRG-abc123");
                }
                other => panic!("Expected VaultNotFound, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_api_failure_is_wrapped_unchanged() {
        let client = client_with(&["object-1"]);
        client.fail_with_status(
            vault_ref(),
            500,
            r#"{"error":{"code":"InternalServerError","message":"boom"}}"#,
        );

        let err = verify_policy_exists(
            &client,
            &CheckContext::new(),
            &vault_ref(),
            &ObjectId::new("object-1"),
        )
        .await
        .unwrap_err();

        match err {
            CheckError::Management(ManagementError::HttpError { status, message, .. }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("Expected Management error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_as_management_error() {
        let client = client_with(&["object-1"]);
        let ctx = CheckContext::new();
        ctx.cancel();

        let err = verify_policy_missing(&client, &ctx, &vault_ref(), &ObjectId::new("x"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CheckError::Management(ManagementError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_expired_deadline_surfaces_as_management_error() {
        let client = client_with(&["object-1"]);
        let ctx = CheckContext::with_timeout(Duration::ZERO);

        let err = verify_policy_exists(&client, &ctx, &vault_ref(), &ObjectId::new("object-1"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CheckError::Management(ManagementError::DeadlineExceeded)
        ));
    }
}

#[tokio::test]
async fn test_lookup_reports_presence() {
    let client = client_with(&["object-1"]);
    let ctx = CheckContext::new();

    let found = lookup_policy(&client, &ctx, &vault_ref(), &ObjectId::new("object-1"))
        .await
        .unwrap();
    let absent = lookup_policy(&client, &ctx, &vault_ref(), &ObjectId::new("nobody"))
        .await
        .unwrap();

    assert!(found.is_found());
    assert_eq!(absent, PolicyLookup::Absent);
}
