//! # Deletion Integration Tests
//!
//! Reverse-order teardown, finalizer retention on failure and unmanaged networks.

mod common;

use cluster_infra_controller::constants::CLUSTER_FINALIZER;
use cluster_infra_controller::controller::conditions::{reasons, ConditionType, Severity};
use cluster_infra_controller::controller::events;
use cluster_infra_controller::controller::reconciler::delete::DeletionPhase;
use cluster_infra_controller::controller::reconciler::{ReconcileAction, ReconcilerError};
use cluster_infra_controller::crd::{SubnetStatus, VpcSpec};
use cluster_infra_controller::model::load_balancer::LoadBalancer;
use cluster_infra_controller::model::SubResourceKind;
use cluster_infra_controller::provider::memory::Operation;
use cluster_infra_controller::provider::{ProviderError, ResourceService};
use common::{key, lb_name, spec, Harness};

/// Index of the first delete call against `kind`
fn first_delete(h: &Harness, kind: SubResourceKind) -> usize {
    h.cloud
        .calls()
        .iter()
        .position(|c| c.kind == kind && c.op == Operation::Delete)
        .unwrap_or_else(|| panic!("no delete call for {kind}"))
}

#[tokio::test]
async fn test_teardown_runs_in_reverse_order_and_releases_finalizer() {
    let h = Harness::new();
    let key = key();
    let mut with_bastion = spec();
    with_bastion.bastion.enabled = true;
    h.apply(&key, with_bastion);
    h.converge(&key).await;
    assert_eq!(h.owned_objects(&key), 8);

    h.store.request_deletion(&key).unwrap();
    assert_eq!(
        DeletionPhase::of(h.store.snapshot(&key).as_ref()),
        DeletionPhase::DeletionRequested
    );
    h.cloud.clear_calls();

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Removed);

    let order = [
        first_delete(&h, SubResourceKind::InstanceAttachment),
        first_delete(&h, SubResourceKind::LoadBalancer),
        first_delete(&h, SubResourceKind::Bastion),
        first_delete(&h, SubResourceKind::SecurityGroup),
        first_delete(&h, SubResourceKind::Network),
    ];
    assert!(order.windows(2).all(|w| w[0] < w[1]), "order was {order:?}");

    assert_eq!(h.owned_objects(&key), 0);
    assert!(!h.store.contains(&key));
    assert_eq!(DeletionPhase::of(h.store.snapshot(&key).as_ref()), DeletionPhase::Removed);
    assert!(h
        .events
        .reasons()
        .contains(&events::reasons::DELETED.to_string()));
}

#[tokio::test]
async fn test_failed_teardown_keeps_finalizer_until_retry_succeeds() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());
    h.converge(&key).await;
    h.store.request_deletion(&key).unwrap();

    h.cloud.fail_next(
        SubResourceKind::LoadBalancer,
        Operation::Delete,
        ProviderError::Throttled("Throttling".into()),
    );
    let err = h.reconcile(&key).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcilerError::Teardown {
            step: SubResourceKind::LoadBalancer,
            ..
        }
    ));
    assert!(!err.is_terminal());

    let cluster = h.cluster(&key);
    assert!(cluster.finalizers.contains(&CLUSTER_FINALIZER.to_string()));
    let ready = cluster.status.conditions.get(ConditionType::Ready).unwrap();
    assert_eq!(ready.severity, Some(Severity::Warning));
    assert_eq!(ready.reason.as_deref(), Some(reasons::DELETION_FAILED));
    assert_eq!(DeletionPhase::of(Some(&cluster)), DeletionPhase::TearingDown);
    // Later steps never ran
    assert!(h.cloud.vpc(&format!("{}-vpc", key.infra_name())).is_some());
    assert!(h
        .events
        .reasons()
        .contains(&events::reasons::DELETE_FAILED.to_string()));

    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Removed);
    assert!(h.cloud.load_balancer(&lb_name(&key)).is_none());
    assert_eq!(h.owned_objects(&key), 0);
    assert!(!h.store.contains(&key));
}

#[tokio::test]
async fn test_already_deleted_objects_count_as_done() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());
    h.converge(&key).await;

    // Someone removed the load balancer out of band
    ResourceService::<LoadBalancer>::delete(&h.cloud, &lb_name(&key))
        .await
        .unwrap();

    h.store.request_deletion(&key).unwrap();
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Removed);
    assert!(!h.store.contains(&key));
}

#[tokio::test]
async fn test_cluster_deleted_before_first_pass_has_nothing_to_tear_down() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());
    h.store.request_deletion(&key).unwrap();

    assert!(!h.store.contains(&key));
    let action = h.reconcile(&key).await.unwrap();
    assert_eq!(action, ReconcileAction::Removed);
    assert!(h.cloud.calls().is_empty());
}

#[tokio::test]
async fn test_cluster_deleted_while_waiting_for_dns() {
    let h = Harness::new();
    let key = key();
    h.apply(&key, spec());
    let action = h.reconcile(&key).await.unwrap();
    assert!(matches!(action, ReconcileAction::Waiting(_)));

    h.store.request_deletion(&key).unwrap();
    let action = h.reconcile(&key).await.unwrap();

    assert_eq!(action, ReconcileAction::Removed);
    assert_eq!(h.owned_objects(&key), 0);
}

#[tokio::test]
async fn test_unmanaged_vpc_survives_teardown() {
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

    h.store.request_deletion(&key).unwrap();
    let action = h.reconcile(&key).await.unwrap();

    assert_eq!(action, ReconcileAction::Removed);
    assert_eq!(h.cloud.count(SubResourceKind::Network, Operation::Delete), 0);
    assert!(h.cloud.vpc("vpc-byo").is_some());
    assert_eq!(h.owned_objects(&key), 0);
}
