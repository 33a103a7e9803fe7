//! # Convergence Integration Tests
//!
//! End-to-end passes of the normal path against the in-memory collaborators:
//! ordered creation, the DNS gate, idempotency, fault handling, bastion lifecycle and
//! unmanaged networks.

mod common;

use cluster_infra_controller::constants::{CLUSTER_FINALIZER, PAUSED_ANNOTATION};
use cluster_infra_controller::controller::conditions::{
    reasons, ConditionStatus, ConditionType, Severity,
};
use cluster_infra_controller::controller::events;
use cluster_infra_controller::controller::reconciler::{validation, ReconcileAction, ReconcilerError};
use cluster_infra_controller::crd::{AwsClusterSpec, SubnetStatus, VpcSpec};
use cluster_infra_controller::model::SubResourceKind;
use cluster_infra_controller::provider::memory::Operation;
use cluster_infra_controller::provider::ProviderError;
use common::{key, lb_name, spec, Harness};
use std::collections::BTreeMap;
use std::time::Duration;

#[tokio::test]
async fn test_first_pass_creates_infrastructure_and_waits_for_dns() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Waiting(Duration::from_secs(15)));

    let cluster = h.cluster(&key);
    assert!(cluster.finalizers.contains(&CLUSTER_FINALIZER.to_string()));
    assert!(!cluster.status.ready);
    assert!(cluster.status.network.vpc.is_some());
    assert_eq!(cluster.status.network.security_groups.len(), 5);
    assert_eq!(
        cluster.status.network.registered_instances,
        vec!["i-cp-1".to_string()]
    );
    assert!(cluster.status.control_plane_endpoint.is_none());

    let lb = h.condition(&key, ConditionType::LoadBalancerReady).unwrap();
    assert_eq!(lb.status, ConditionStatus::False);
    assert_eq!(lb.severity, Some(Severity::Info));
    assert_eq!(lb.reason.as_deref(), Some(reasons::WAIT_FOR_DNS_NAME));

    let ready = h.condition(&key, ConditionType::Ready).unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason.as_deref(), Some(reasons::WAIT_FOR_DNS_NAME));

    assert!(h
        .events
        .reasons()
        .contains(&events::reasons::CREATED.to_string()));
}

#[tokio::test]
async fn test_creation_follows_dependency_order() {
    let h = Harness::new();
    let key = key();
    let mut with_bastion = spec();
    with_bastion.bastion.enabled = true;
    h.apply(&key, with_bastion);
    h.reconcile(&key).await.unwrap();

    let creates: Vec<SubResourceKind> = h
        .cloud
        .calls()
        .into_iter()
        .filter(|c| c.op == Operation::Create)
        .map(|c| c.kind)
        .collect();
    let first = |kind: SubResourceKind| {
        creates
            .iter()
            .position(|k| *k == kind)
            .unwrap_or_else(|| panic!("{kind} was never created"))
    };
    let last = |kind: SubResourceKind| {
        creates.iter().rposition(|k| *k == kind).unwrap()
    };

    assert_eq!(first(SubResourceKind::Network), 0);
    assert!(last(SubResourceKind::Network) < first(SubResourceKind::SecurityGroup));
    assert!(last(SubResourceKind::SecurityGroup) < first(SubResourceKind::Bastion));
    assert!(last(SubResourceKind::Bastion) < first(SubResourceKind::LoadBalancer));
    assert!(last(SubResourceKind::LoadBalancer) < first(SubResourceKind::InstanceAttachment));
}

#[tokio::test]
async fn test_endpoint_and_failure_domains_once_dns_resolves() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());
    h.reconcile(&key).await.unwrap();

    // Published but not yet resolvable
    let host = h.cloud.publish_dns_name(&lb_name(&key)).unwrap();
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Waiting(Duration::from_secs(15)));
    assert_eq!(
        h.condition(&key, ConditionType::LoadBalancerReady)
            .unwrap()
            .reason
            .as_deref(),
        Some(reasons::WAIT_FOR_DNS_NAME_RESOLVE)
    );

    h.cloud.mark_resolvable(&host);
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Converged);

    let cluster = h.cluster(&key);
    assert!(cluster.status.ready);
    assert!(cluster.status.conditions.is_true(ConditionType::Ready));
    let endpoint = cluster.status.control_plane_endpoint.unwrap();
    assert_eq!(endpoint.host, host);
    assert_eq!(endpoint.port, 6443);
    assert_eq!(cluster.status.failure_domains.len(), 2);
    assert!(cluster.status.failure_domains["us-west-2a"].control_plane);
    assert!(!cluster.status.failure_domains["us-west-2b"].control_plane);
    assert_eq!(cluster.status.observed_generation, Some(cluster.generation));
}

#[tokio::test]
async fn test_converged_cluster_pass_makes_no_changes() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());
    h.converge(&key).await;

    let before = h.cluster(&key);
    h.cloud.clear_calls();
    let action = h.reconcile(&key).await.unwrap();

    assert_eq!(action, ReconcileAction::Converged);
    assert_eq!(h.mutations(), 0);
    let after = h.cluster(&key);
    assert_eq!(after.status, before.status);
    assert_eq!(after.resource_version, before.resource_version);
}

#[tokio::test]
async fn test_security_group_failure_stops_later_steps() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());
    h.cloud.fail_next(
        SubResourceKind::SecurityGroup,
        Operation::Create,
        ProviderError::Throttled("RequestLimitExceeded".into()),
    );

    let err = h.reconcile(&key).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcilerError::Step {
            step: SubResourceKind::SecurityGroup,
            ..
        }
    ));
    assert!(!err.is_terminal());

    assert_eq!(h.cloud.count(SubResourceKind::Network, Operation::Create), 1);
    for kind in [
        SubResourceKind::Bastion,
        SubResourceKind::LoadBalancer,
        SubResourceKind::InstanceAttachment,
    ] {
        assert!(
            h.cloud.calls().iter().all(|c| c.kind != kind),
            "{kind} must not be touched after a failed security group step"
        );
    }

    let sg = h.condition(&key, ConditionType::SecurityGroupsReady).unwrap();
    assert_eq!(sg.status, ConditionStatus::False);
    assert_eq!(sg.severity, Some(Severity::Warning));
    assert_eq!(sg.reason.as_deref(), Some(reasons::SECURITY_GROUPS_FAILED));
    assert!(h.condition(&key, ConditionType::NetworkReady).unwrap().is_true());
    assert!(h
        .events
        .reasons()
        .contains(&events::reasons::CREATE_FAILED.to_string()));

    // The fault is gone; the next pass picks up where this one stopped
    h.cloud.clear_calls();
    h.reconcile(&key).await.unwrap();
    assert_eq!(h.cloud.count(SubResourceKind::Network, Operation::Create), 0);
    assert_eq!(h.cloud.count(SubResourceKind::LoadBalancer, Operation::Create), 1);
}

#[tokio::test]
async fn test_interrupted_pass_never_duplicates_objects() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());
    h.cloud.fail_next(
        SubResourceKind::LoadBalancer,
        Operation::Create,
        ProviderError::Transient("503".into()),
    );
    h.reconcile(&key).await.unwrap_err();
    h.converge(&key).await;

    // One VPC, five groups, one load balancer
    assert_eq!(h.owned_objects(&key), 7);
    assert_eq!(h.cloud.count(SubResourceKind::Network, Operation::Create), 1);
}

#[tokio::test]
async fn test_invalid_spec_is_rejected_before_any_cloud_call() {
    let h = Harness::new();
    let key = key();
    let mut bad = spec();
    bad.additional_tags.insert("aws:reserved", "x");

    let errors = validation::validate_create(&validation::apply_defaults(bad.clone())).unwrap_err();
    assert!(errors.has_field("spec.additionalTags"));
    assert!(h.store.apply(&key, bad, BTreeMap::new()).is_err());
    assert!(!h.store.contains(&key));

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Removed);
    assert!(h.cloud.calls().is_empty());
}

#[tokio::test]
async fn test_paused_cluster_is_not_reconciled() {
    let h = Harness::new();
    let key = key();
    let annotations = [(PAUSED_ANNOTATION.to_string(), "true".to_string())]
        .into_iter()
        .collect();
    h.store.apply(&key, spec(), annotations).unwrap();

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Converged);
    assert!(h.cloud.calls().is_empty());
    assert!(h.cluster(&key).finalizers.is_empty());
}

#[tokio::test]
async fn test_missing_cluster_is_removed() {
    let h = Harness::new();
    let action = h.reconcile(&key()).await.unwrap();
    assert_eq!(action, ReconcileAction::Removed);
}

#[tokio::test]
async fn test_pending_bastion_waits_then_becomes_ready() {
    let h = Harness::new();
    let key = key();
    let mut with_bastion = spec();
    with_bastion.bastion.enabled = true;
    h.apply(&key, with_bastion);
    h.cloud.set_bastion_launch_state(Some("pending"));
    h.reconcile(&key).await.unwrap();
    h.make_dns_ready(&lb_name(&key));

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Waiting(Duration::from_secs(15)));
    let bastion = h.condition(&key, ConditionType::BastionReady).unwrap();
    assert_eq!(bastion.severity, Some(Severity::Info));
    assert_eq!(bastion.reason.as_deref(), Some(reasons::INSTANCE_NOT_READY));
    assert!(!h.cluster(&key).status.ready);

    let name = format!("{}-bastion", key.infra_name());
    h.cloud.set_bastion_state(&name, "running");
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Converged);
    assert!(h.condition(&key, ConditionType::BastionReady).unwrap().is_true());
    assert!(h.cluster(&key).status.ready);
}

#[tokio::test]
async fn test_disabling_bastion_deletes_it_and_drops_condition() {
    let h = Harness::new();
    let key = key();
    let mut with_bastion = spec();
    with_bastion.bastion.enabled = true;
    h.apply(&key, with_bastion.clone());
    h.converge(&key).await;
    let name = format!("{}-bastion", key.infra_name());
    assert!(h.cloud.bastion(&name).is_some());

    with_bastion.bastion.enabled = false;
    h.apply(&key, with_bastion);
    let action = h.reconcile(&key).await.unwrap();

    assert_eq!(action, ReconcileAction::Converged);
    assert!(h.cloud.bastion(&name).is_none());
    let cluster = h.cluster(&key);
    assert!(cluster.status.bastion.is_none());
    assert!(cluster.status.conditions.get(ConditionType::BastionReady).is_none());
    assert!(cluster.status.ready);
}

#[tokio::test]
async fn test_bastion_instance_type_drift_is_updated_in_place() {
    let h = Harness::new();
    let key = key();
    let mut with_bastion = spec();
    with_bastion.bastion.enabled = true;
    h.apply(&key, with_bastion.clone());
    h.converge(&key).await;

    with_bastion.bastion.instance_type = Some("t3.small".to_string());
    h.apply(&key, with_bastion);
    h.cloud.clear_calls();
    h.reconcile(&key).await.unwrap();

    assert_eq!(h.cloud.count(SubResourceKind::Bastion, Operation::Create), 0);
    assert_eq!(h.cloud.count(SubResourceKind::Bastion, Operation::Update), 1);
    let name = format!("{}-bastion", key.infra_name());
    assert_eq!(h.cloud.bastion(&name).unwrap().instance_type, "t3.small");
}

#[tokio::test]
async fn test_unmanaged_vpc_is_described_never_created() {
    let h = Harness::new();
    let key = key();
    h.cloud.seed_unmanaged_vpc(
        "vpc-byo",
        "10.20.0.0/16",
        vec![SubnetStatus {
            id: "subnet-byo-a".to_string(),
            cidr_block: "10.20.0.0/24".to_string(),
            availability_zone: "us-west-2a".to_string(),
            is_public: true,
        }],
    );
    let mut byo = spec();
    byo.network.vpc = VpcSpec {
        id: Some("vpc-byo".to_string()),
        cidr_block: String::new(),
    };
    byo.network.subnets.clear();
    h.apply(&key, byo);
    h.converge(&key).await;

    assert_eq!(h.cloud.count(SubResourceKind::Network, Operation::Create), 0);
    assert_eq!(h.cloud.count(SubResourceKind::Network, Operation::Update), 0);
    let cluster = h.cluster(&key);
    assert_eq!(cluster.status.network.vpc.unwrap().id, "vpc-byo");
    assert!(cluster.status.ready);
}

#[tokio::test]
async fn test_missing_unmanaged_vpc_fails_without_create() {
    let h = Harness::new();
    let key = key();
    let mut byo = spec();
    byo.network.vpc = VpcSpec {
        id: Some("vpc-missing".to_string()),
        cidr_block: String::new(),
    };
    byo.network.subnets.clear();
    h.apply(&key, byo);

    let err = h.reconcile(&key).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcilerError::Step {
            step: SubResourceKind::Network,
            ref resource,
            source: ProviderError::Invalid(_),
        } if resource == "vpc-missing"
    ));
    assert!(err.is_terminal());
    assert_eq!(h.cloud.count(SubResourceKind::Network, Operation::Create), 0);
    assert!(h
        .cloud
        .calls()
        .iter()
        .all(|c| c.kind == SubResourceKind::Network));

    let network = h.condition(&key, ConditionType::NetworkReady).unwrap();
    assert_eq!(network.status, ConditionStatus::False);
}

#[tokio::test]
async fn test_internal_scheme_uses_private_subnets() {
    let h = Harness::new();
    let key = key();
    let mut internal = spec();
    internal.control_plane_load_balancer = Some(cluster_infra_controller::crd::LoadBalancerSpec {
        scheme: cluster_infra_controller::crd::LoadBalancerScheme::Internal,
        ..Default::default()
    });
    h.apply(&key, internal);
    h.converge(&key).await;

    let lb = h.cloud.load_balancer(&lb_name(&key)).unwrap();
    assert_eq!(lb.scheme, "internal");
    assert_eq!(lb.availability_zones, vec!["us-west-2b".to_string()]);
    let cluster = h.cluster(&key);
    assert!(cluster.status.failure_domains["us-west-2b"].control_plane);
    assert!(!cluster.status.failure_domains["us-west-2a"].control_plane);
}

#[tokio::test]
async fn test_instance_list_change_reregisters() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());
    h.converge(&key).await;

    let mut changed: AwsClusterSpec = spec();
    changed.control_plane_instance_ids = vec!["i-cp-2".to_string(), "i-cp-3".to_string()];
    h.apply(&key, changed);
    h.reconcile(&key).await.unwrap();

    assert_eq!(
        h.cloud.registered_instances(&lb_name(&key)),
        vec!["i-cp-2".to_string(), "i-cp-3".to_string()]
    );
    assert_eq!(
        h.cluster(&key).status.network.registered_instances,
        vec!["i-cp-2".to_string(), "i-cp-3".to_string()]
    );
}
