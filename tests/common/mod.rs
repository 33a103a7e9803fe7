//! Shared fixtures for the convergence engine integration tests.
//!
//! Every test drives a real [`Reconciler`] against the in-memory store, the in-memory
//! cloud and an in-memory identity source.

#![allow(dead_code)]

use cluster_infra_controller::config::ControllerConfig;
use cluster_infra_controller::controller::conditions::{Condition, ConditionType};
use cluster_infra_controller::controller::events::MemoryEventSink;
use cluster_infra_controller::controller::identity::{
    IdentityResolver, MemoryIdentitySource, StaticStsBackend,
};
use cluster_infra_controller::controller::reconciler::{
    ReconcileAction, ReconcileHandler, Reconciler, ReconcilerError,
};
use cluster_infra_controller::crd::{AwsClusterSpec, NetworkSpec, SubnetSpec};
use cluster_infra_controller::crd::tags::cluster_tag_key;
use cluster_infra_controller::model::{ManagedResource, ResourceKey};
use cluster_infra_controller::provider::memory::{MemoryCloud, Operation};
use cluster_infra_controller::store::MemoryStore;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Harness {
    pub store: MemoryStore,
    pub cloud: MemoryCloud,
    pub events: MemoryEventSink,
    pub sts: StaticStsBackend,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    /// Controller identity admitting every namespace
    pub fn new() -> Self {
        Self::with_identities(MemoryIdentitySource::allow_all_controller())
    }

    /// Load balancers get a resolvable DNS name as soon as they are created
    pub fn instant_dns() -> Self {
        Self::build(
            MemoryIdentitySource::allow_all_controller(),
            MemoryCloud::with_instant_dns(),
        )
    }

    pub fn with_identities(identities: MemoryIdentitySource) -> Self {
        Self::build(identities, MemoryCloud::new())
    }

    fn build(identities: MemoryIdentitySource, cloud: MemoryCloud) -> Self {
        let store = MemoryStore::new();
        let events = MemoryEventSink::new();
        let sts = StaticStsBackend::new();
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(IdentityResolver::new(
                Arc::new(identities),
                Arc::new(sts.clone()),
            )),
            Arc::new(cloud.clone()),
            Arc::new(cloud.clone()),
            Arc::new(events.clone()),
            ControllerConfig::default(),
        ));
        Self {
            store,
            cloud,
            events,
            sts,
            reconciler,
        }
    }

    pub fn apply(&self, key: &ResourceKey, spec: AwsClusterSpec) -> ManagedResource {
        self.store
            .apply(key, spec, BTreeMap::new())
            .expect("spec should pass admission")
    }

    pub async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileAction, ReconcilerError> {
        self.reconciler.reconcile(key).await
    }

    pub fn cluster(&self, key: &ResourceKey) -> ManagedResource {
        self.store.snapshot(key).expect("cluster should exist")
    }

    pub fn condition(&self, key: &ResourceKey, type_: ConditionType) -> Option<Condition> {
        self.cluster(key).status.conditions.get(type_).cloned()
    }

    /// Publish the load balancer DNS name and make it resolvable
    pub fn make_dns_ready(&self, lb_name: &str) -> String {
        let host = self
            .cloud
            .publish_dns_name(lb_name)
            .expect("load balancer should exist");
        self.cloud.mark_resolvable(&host);
        host
    }

    /// Create and update calls across every kind
    pub fn mutations(&self) -> usize {
        self.cloud
            .calls()
            .iter()
            .filter(|c| matches!(c.op, Operation::Create | Operation::Update))
            .count()
    }

    /// Reconcile until the cluster converges, making DNS ready along the way
    pub async fn converge(&self, key: &ResourceKey) {
        let first = self.reconcile(key).await.expect("first pass should succeed");
        if first != ReconcileAction::Converged {
            self.make_dns_ready(&lb_name(key));
            let second = self.reconcile(key).await.expect("second pass should succeed");
            assert_eq!(second, ReconcileAction::Converged);
        }
    }

    pub fn owned_objects(&self, key: &ResourceKey) -> usize {
        self.cloud.owned_count(&cluster_tag_key(&key.infra_name()))
    }
}

pub fn key() -> ResourceKey {
    ResourceKey::new("default", "prod")
}

pub fn lb_name(key: &ResourceKey) -> String {
    format!("{}-apiserver", key.infra_name())
}

/// Two zones: a public subnet in `a`, a private one in `b`
pub fn spec() -> AwsClusterSpec {
    AwsClusterSpec {
        region: "us-west-2".to_string(),
        network: NetworkSpec {
            subnets: vec![
                SubnetSpec {
                    cidr_block: "10.0.0.0/24".to_string(),
                    availability_zone: "us-west-2a".to_string(),
                    is_public: true,
                },
                SubnetSpec {
                    cidr_block: "10.0.1.0/24".to_string(),
                    availability_zone: "us-west-2b".to_string(),
                    is_public: false,
                },
            ],
            ..NetworkSpec::default()
        },
        control_plane_instance_ids: vec!["i-cp-1".to_string()],
        ..AwsClusterSpec::default()
    }
}
