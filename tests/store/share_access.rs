use super::common::{anonymous_auth, user_auth, Fixture};

use dittofs_store::error::StoreError;
use dittofs_store::model::{IdentityMapping, ShareOptions, SquashMode};
use dittofs_store::store::MetadataStore;

#[tokio::test]
async fn unknown_share_is_not_found() {
    let fixture = Fixture::new().await;
    let err = fixture
        .store
        .check_share_access(&fixture.cancel, "nowhere", &user_auth(1, 1))
        .await
        .expect_err("missing share");
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn deny_list_is_evaluated_before_allow_list() {
    let (fixture, _root) = Fixture::with_root("export").await;
    fixture
        .store
        .set_share_options(
            &fixture.cancel,
            "export",
            ShareOptions {
                denied_clients: vec!["10.0.0.5".into()],
                allowed_clients: vec!["10.0.0.0/8".into()],
                ..Default::default()
            },
        )
        .await
        .expect("set options");

    let mut denied = user_auth(1, 1);
    denied.client_addr = "10.0.0.5".parse().unwrap();
    let (decision, _) = fixture
        .store
        .check_share_access(&fixture.cancel, "export", &denied)
        .await
        .expect("evaluate");
    assert!(!decision.allowed);
    assert!(decision.reason.contains("denied"));

    let mut allowed = user_auth(1, 1);
    allowed.client_addr = "10.0.0.7".parse().unwrap();
    let (decision, _) = fixture
        .store
        .check_share_access(&fixture.cancel, "export", &allowed)
        .await
        .expect("evaluate");
    assert!(decision.allowed);
}

#[tokio::test]
async fn require_auth_blocks_anonymous_sessions() {
    let (fixture, _root) = Fixture::with_root("export").await;
    fixture
        .store
        .set_share_options(
            &fixture.cancel,
            "export",
            ShareOptions { require_auth: true, ..Default::default() },
        )
        .await
        .expect("set options");

    let (decision, _) = fixture
        .store
        .check_share_access(&fixture.cancel, "export", &anonymous_auth())
        .await
        .expect("evaluate");
    assert!(!decision.allowed);

    let (decision, _) = fixture
        .store
        .check_share_access(&fixture.cancel, "export", &user_auth(1, 1))
        .await
        .expect("evaluate");
    assert!(decision.allowed);
}

#[tokio::test]
async fn root_squash_produces_an_anonymous_effective_identity() {
    let (fixture, _root) = Fixture::with_root("export").await;
    fixture
        .store
        .set_share_options(
            &fixture.cancel,
            "export",
            ShareOptions {
                identity_mapping: Some(IdentityMapping {
                    squash: SquashMode::Root,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .expect("set options");

    let (decision, effective) = fixture
        .store
        .check_share_access(&fixture.cancel, "export", &user_auth(0, 0))
        .await
        .expect("evaluate");
    assert!(decision.allowed);
    assert!(effective.identity.is_anonymous());
}

#[tokio::test]
async fn read_only_flag_is_reported_in_the_decision() {
    let (fixture, _root) = Fixture::with_root("export").await;
    fixture
        .store
        .set_share_options(
            &fixture.cancel,
            "export",
            ShareOptions { read_only: true, ..Default::default() },
        )
        .await
        .expect("set options");
    let (decision, _) = fixture
        .store
        .check_share_access(&fixture.cancel, "export", &user_auth(1, 1))
        .await
        .expect("evaluate");
    assert!(decision.allowed);
    assert!(decision.read_only);
}

#[tokio::test]
async fn setting_options_on_a_missing_share_fails() {
    let fixture = Fixture::new().await;
    let err = fixture
        .store
        .set_share_options(&fixture.cancel, "nowhere", ShareOptions::default())
        .await
        .expect_err("missing share");
    assert!(matches!(err, StoreError::NotFound { .. }));
}
