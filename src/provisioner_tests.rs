use super::*;
use crate::clock::ManualClock;
use crate::cluster::{ClusterInfo, ClusterOp, MemoryCluster};
use crate::error::ErrorKind;
use chrono::Duration;

struct Fixture {
    clock: Arc<ManualClock>,
    cluster: Arc<MemoryCluster>,
    provisioner: Provisioner,
}

fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::starting_now());
    let scheme = Arc::new(Scheme::with_defaults());
    let info = ClusterInfo { server: "https://k8s.test:6443".into(), certificate_authority_data: None, insecure_skip_tls_verify: false };
    let cluster = Arc::new(MemoryCluster::new(scheme.clone(), clock.clone(), info));
    let config = ProvisionerConfig { namespace: "tka".into(), cluster_name: "test".into(), token_audiences: vec![] };
    let provisioner = Provisioner::new(cluster.clone(), scheme, clock.clone(), config);
    Fixture { clock, cluster, provisioner }
}

#[tokio::test]
async fn provision_creates_objects_and_bounds_token() {
    let f = fixture();
    let valid_until = f.clock.now() + Duration::minutes(5);
    let profile = f.provisioner.provision("alice", "viewer", valid_until).await.unwrap();
    assert_eq!(f.cluster.service_account_count(), 1);
    assert_eq!(f.cluster.binding_count(), 1);
    assert_eq!(profile.expiration_seconds, 300);
    assert_eq!(profile.token_expires_at, valid_until);

    let claims = f.cluster.decode_token(profile.kubeconfig.token().unwrap()).unwrap();
    assert_eq!(claims.exp, valid_until.timestamp());
    assert_eq!(profile.kubeconfig.current_context, "test-alice");

    let sa = f.cluster.get_service_account("tka", "tka-user-alice").await.unwrap().unwrap();
    assert_eq!(sa.metadata.annotation(VALID_UNTIL_ANNOTATION), Some(valid_until_value(valid_until).as_str()));
    assert_eq!(sa.metadata.label(PRINCIPAL_LABEL), Some("alice"));
    let b = f.cluster.get_binding("tka-user-alice-binding").await.unwrap().unwrap();
    assert!(b.binds("viewer", "tka", "tka-user-alice"));
}

#[tokio::test]
async fn late_mint_shrinks_token_lifetime() {
    let f = fixture();
    let valid_until = f.clock.now() + Duration::minutes(5);
    f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap();
    f.clock.advance(Duration::minutes(4));
    let profile = f.provisioner.issue_profile("alice", valid_until).await.unwrap();
    assert_eq!(profile.expiration_seconds, 60);
    let claims = f.cluster.decode_token(profile.kubeconfig.token().unwrap()).unwrap();
    assert_eq!(claims.exp - claims.iat, 60);

    f.clock.advance(Duration::minutes(2));
    let err = f.provisioner.issue_profile("alice", valid_until).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.code_str(), "signin_expired");
}

#[tokio::test]
async fn second_ensure_is_a_noop() {
    let f = fixture();
    let valid_until = f.clock.now() + Duration::minutes(5);
    let first = f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap();
    assert_eq!(first.created, 2);
    let second = f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap();
    assert!(second.is_noop(), "{:?}", second);
    assert_eq!(f.cluster.calls(ClusterOp::CreateServiceAccount), 1);
    assert_eq!(f.cluster.calls(ClusterOp::CreateBinding), 1);
}

#[tokio::test]
async fn partial_state_is_completed() {
    let f = fixture();
    let valid_until = f.clock.now() + Duration::minutes(5);
    f.cluster.inject_failures(ClusterOp::CreateBinding, 1);
    let err = f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Provision);
    assert_eq!(f.cluster.service_account_count(), 1);
    assert_eq!(f.cluster.binding_count(), 0);

    let report = f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap();
    assert_eq!(report, EnsureReport { created: 1, patched: 0, recreated: 0 });
    assert_eq!(f.cluster.service_account_count(), 1);
    assert_eq!(f.cluster.binding_count(), 1);
}

#[tokio::test]
async fn drift_is_repaired() {
    let f = fixture();
    let valid_until = f.clock.now() + Duration::minutes(5);
    f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap();

    // stale annotation gets patched
    let mut stale = BTreeMap::new();
    stale.insert(VALID_UNTIL_ANNOTATION.to_string(), "2000-01-01T00:00:00Z".to_string());
    f.cluster.annotate_service_account("tka", "tka-user-alice", &stale).await.unwrap();
    let report = f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap();
    assert_eq!(report.patched, 1);

    // a binding to another role is replaced
    let report = f.provisioner.ensure_objects("alice", "editor", valid_until).await.unwrap();
    assert_eq!(report.recreated, 1);
    let b = f.cluster.get_binding("tka-user-alice-binding").await.unwrap().unwrap();
    assert!(b.binds("editor", "tka", "tka-user-alice"));
    assert_eq!(f.cluster.binding_count(), 1);

    // an object deleted out of band comes back
    f.cluster.delete_binding("tka-user-alice-binding").await.unwrap();
    let report = f.provisioner.ensure_objects("alice", "editor", valid_until).await.unwrap();
    assert_eq!(report.created, 1);
}

#[tokio::test]
async fn profile_needs_service_account() {
    let f = fixture();
    let valid_until = f.clock.now() + Duration::minutes(5);
    let err = f.provisioner.issue_profile("alice", valid_until).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn teardown_tolerates_any_subset_absent() {
    let f = fixture();
    let valid_until = f.clock.now() + Duration::minutes(5);
    assert_eq!(f.provisioner.teardown("alice").await.unwrap(), 0);

    f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap();
    f.cluster.delete_binding("tka-user-alice-binding").await.unwrap();
    assert_eq!(f.provisioner.teardown("alice").await.unwrap(), 1);
    assert_eq!(f.cluster.service_account_count(), 0);

    f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap();
    f.cluster.delete_service_account("tka", "tka-user-alice").await.unwrap();
    assert_eq!(f.provisioner.teardown("alice").await.unwrap(), 1);
    assert_eq!(f.cluster.binding_count(), 0);

    f.provisioner.ensure_objects("alice", "viewer", valid_until).await.unwrap();
    f.cluster.inject_failures(ClusterOp::DeleteServiceAccount, 1);
    assert!(f.provisioner.teardown("alice").await.is_err());
    assert_eq!(f.provisioner.teardown("alice").await.unwrap(), 1);
}

#[tokio::test]
async fn managed_objects_map_back_to_principals() {
    let f = fixture();
    let v_alice = f.clock.now() + Duration::minutes(5);
    let v_bob = f.clock.now() + Duration::minutes(10);
    f.provisioner.ensure_objects("alice", "viewer", v_alice).await.unwrap();
    f.provisioner.ensure_objects("bob", "editor", v_bob).await.unwrap();
    let managed = f.provisioner.list_managed().await.unwrap();
    assert_eq!(managed.len(), 4);
    let bob_binding = managed
        .iter()
        .find(|m| m.kind == ManagedKind::ClusterRoleBinding && m.principal.as_deref() == Some("bob"))
        .unwrap();
    assert_eq!(bob_binding.name, "tka-user-bob-binding");
    assert_eq!(bob_binding.valid_until, Some(v_bob));
}
