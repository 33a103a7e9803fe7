//! # In-Memory Cloud
//!
//! A provider that keeps every sub-resource in process memory.
//!
//! It honors deterministic names, ownership tags and "not found" semantics, refuses to
//! delete objects that others still depend on, and lets callers inject faults and control
//! when a load balancer's DNS name is published and when it resolves. Every call is
//! recorded so ordering and idempotency can be asserted.

use crate::crd::tags::LIFECYCLE_OWNED;
use crate::crd::{
    BastionStatus, LoadBalancerStatus, SecurityGroupStatus, SubnetStatus, Tags, VpcStatus,
};
use crate::model::attachment::{AttachmentDiff, AttachmentState, InstanceAttachment};
use crate::model::bastion::{self, Bastion, BastionDesired, BastionDiff};
use crate::model::load_balancer::{LoadBalancer, LoadBalancerDesired, LoadBalancerDiff};
use crate::model::network::{Network, NetworkDesired, NetworkDiff};
use crate::model::security_group::{SecurityGroup, SecurityGroupDesired, SecurityGroupDiff};
use crate::model::SubResourceKind;
use crate::provider::{
    CloudServices, CredentialSource, Credentials, DnsResolver, ProviderError, ResourceService,
    ServiceFactory,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Service operation, used for call recording and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Describe,
    Create,
    Update,
    Delete,
    List,
}

/// One recorded service call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: SubResourceKind,
    pub op: Operation,
    pub name: String,
}

#[derive(Debug, Clone)]
struct StoredGroup {
    vpc_id: String,
    status: SecurityGroupStatus,
}

#[derive(Debug, Clone)]
struct StoredBastion {
    vpc_id: Option<String>,
    security_group_ids: Vec<String>,
    tags: Tags,
    status: BastionStatus,
}

#[derive(Debug, Default)]
struct CloudState {
    vpcs: BTreeMap<String, VpcStatus>,
    security_groups: BTreeMap<String, StoredGroup>,
    bastions: BTreeMap<String, StoredBastion>,
    load_balancers: BTreeMap<String, LoadBalancerStatus>,
    registrations: BTreeMap<String, Vec<String>>,
    resolvable: BTreeSet<String>,
    faults: HashMap<(SubResourceKind, Operation), VecDeque<ProviderError>>,
    calls: Vec<Call>,
    credential_sources: Vec<CredentialSource>,
    bastion_launch_state: Option<String>,
    /// Publish and resolve load balancer DNS names as soon as they are created
    instant_dns: bool,
    next_id: u64,
}

impl CloudState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }

    /// Record the call, then fail it if a fault is queued
    fn enter(
        &mut self,
        kind: SubResourceKind,
        op: Operation,
        name: &str,
    ) -> Result<(), ProviderError> {
        self.calls.push(Call {
            kind,
            op,
            name: name.to_string(),
        });
        match self.faults.get_mut(&(kind, op)).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn subnet_vpc(&self, subnet_id: &str) -> Option<String> {
        self.vpcs
            .values()
            .find(|v| v.subnets.iter().any(|s| s.id == subnet_id))
            .map(|v| v.id.clone())
    }
}

/// In-memory provider; clones share state
#[derive(Debug, Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<CloudState>>,
}

fn owned_names<'a, I>(entries: I, owner_tag_key: &str) -> Vec<String>
where
    I: Iterator<Item = (&'a String, &'a Tags)>,
{
    entries
        .filter(|(_, tags)| tags.get(owner_tag_key) == Some(LIFECYCLE_OWNED))
        .map(|(name, _)| name.clone())
        .collect()
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose load balancers get a resolvable DNS name at creation
    pub fn with_instant_dns() -> Self {
        let cloud = Self::default();
        cloud.state().instant_dns = true;
        cloud
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `op` on `kind` with `err`; repeated calls queue further faults
    pub fn fail_next(&self, kind: SubResourceKind, op: Operation, err: ProviderError) {
        self.state()
            .faults
            .entry((kind, op))
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn count(&self, kind: SubResourceKind, op: Operation) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.kind == kind && c.op == op)
            .count()
    }

    /// Credential sources the service layer was built with, in order
    pub fn credential_sources(&self) -> Vec<CredentialSource> {
        self.state().credential_sources.clone()
    }

    /// Launch new bastions in the given state instead of `running`
    pub fn set_bastion_launch_state(&self, state: Option<&str>) {
        self.state().bastion_launch_state = state.map(str::to_string);
    }

    pub fn set_bastion_state(&self, name: &str, new_state: &str) {
        if let Some(b) = self.state().bastions.get_mut(name) {
            b.status.state = new_state.to_string();
        }
    }

    /// Register a user-provided VPC under its id
    pub fn seed_unmanaged_vpc(&self, id: &str, cidr_block: &str, subnets: Vec<SubnetStatus>) {
        self.state().vpcs.insert(
            id.to_string(),
            VpcStatus {
                id: id.to_string(),
                cidr_block: cidr_block.to_string(),
                managed: false,
                subnets,
                tags: Tags::new(),
            },
        );
    }

    /// Publish a DNS name for a load balancer; returns the name
    pub fn publish_dns_name(&self, lb_name: &str) -> Option<String> {
        let mut state = self.state();
        let lb = state.load_balancers.get_mut(lb_name)?;
        if lb.dns_name.is_empty() {
            lb.dns_name = format!("{lb_name}.elb.amazonaws.com");
        }
        Some(lb.dns_name.clone())
    }

    /// Make a published DNS name resolvable
    pub fn mark_resolvable(&self, host: &str) {
        self.state().resolvable.insert(host.to_string());
    }

    pub fn vpc(&self, name: &str) -> Option<VpcStatus> {
        self.state().vpcs.get(name).cloned()
    }

    pub fn security_group(&self, name: &str) -> Option<SecurityGroupStatus> {
        self.state()
            .security_groups
            .get(name)
            .map(|g| g.status.clone())
    }

    pub fn bastion(&self, name: &str) -> Option<BastionStatus> {
        self.state().bastions.get(name).map(|b| b.status.clone())
    }

    pub fn load_balancer(&self, name: &str) -> Option<LoadBalancerStatus> {
        self.state().load_balancers.get(name).cloned()
    }

    pub fn registered_instances(&self, lb_name: &str) -> Vec<String> {
        self.state()
            .registrations
            .get(lb_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of objects carrying `owner_tag_key=owned`, across every kind
    pub fn owned_count(&self, owner_tag_key: &str) -> usize {
        let state = self.state();
        let owned = |tags: &Tags| tags.get(owner_tag_key) == Some(LIFECYCLE_OWNED);
        state.vpcs.values().filter(|v| owned(&v.tags)).count()
            + state
                .security_groups
                .values()
                .filter(|g| owned(&g.status.tags))
                .count()
            + state.bastions.values().filter(|b| owned(&b.tags)).count()
            + state
                .load_balancers
                .values()
                .filter(|l| owned(&l.tags))
                .count()
    }
}

#[async_trait]
impl ResourceService<Network> for MemoryCloud {
    async fn describe(&self, name: &str) -> Result<VpcStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Network, Operation::Describe, name)?;
        state
            .vpcs
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::not_found("vpc", name))
    }

    async fn create(&self, desired: &NetworkDesired) -> Result<VpcStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Network, Operation::Create, &desired.name)?;
        if !desired.managed {
            return Err(ProviderError::Invalid(format!(
                "unmanaged VPC {} does not exist",
                desired.name
            )));
        }
        if let Some(existing) = state.vpcs.get(&desired.name) {
            return Err(ProviderError::Conflict(format!(
                "VPC {} already exists as {}",
                desired.name, existing.id
            )));
        }
        let id = state.next_id("vpc");
        let subnets = desired
            .subnets
            .iter()
            .map(|s| SubnetStatus {
                id: state.next_id("subnet"),
                cidr_block: s.cidr_block.clone(),
                availability_zone: s.availability_zone.clone(),
                is_public: s.is_public,
            })
            .collect();
        let vpc = VpcStatus {
            id,
            cidr_block: desired.cidr_block.clone(),
            managed: true,
            subnets,
            tags: desired.tags.clone(),
        };
        state.vpcs.insert(desired.name.clone(), vpc.clone());
        Ok(vpc)
    }

    async fn update(&self, name: &str, diff: &NetworkDiff) -> Result<VpcStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Network, Operation::Update, name)?;
        let new_subnets: Vec<SubnetStatus> = diff
            .missing_subnets
            .iter()
            .map(|s| SubnetStatus {
                id: state.next_id("subnet"),
                cidr_block: s.cidr_block.clone(),
                availability_zone: s.availability_zone.clone(),
                is_public: s.is_public,
            })
            .collect();
        let vpc = state
            .vpcs
            .get_mut(name)
            .ok_or_else(|| ProviderError::not_found("vpc", name))?;
        vpc.tags.merge(&diff.tags);
        vpc.subnets.extend(new_subnets);
        Ok(vpc.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Network, Operation::Delete, name)?;
        let Some(vpc_id) = state.vpcs.get(name).map(|v| v.id.clone()) else {
            return Err(ProviderError::not_found("vpc", name));
        };
        let groups_left = state
            .security_groups
            .values()
            .any(|g| g.vpc_id == vpc_id);
        let bastions_left = state
            .bastions
            .values()
            .any(|b| b.vpc_id.as_deref() == Some(vpc_id.as_str()));
        if groups_left || bastions_left {
            return Err(ProviderError::Conflict(format!(
                "DependencyViolation: VPC {vpc_id} still has dependent objects"
            )));
        }
        state.vpcs.remove(name);
        Ok(())
    }

    async fn list_owned(&self, owner_tag_key: &str) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Network, Operation::List, owner_tag_key)?;
        Ok(owned_names(
            state.vpcs.iter().map(|(k, v)| (k, &v.tags)),
            owner_tag_key,
        ))
    }
}

#[async_trait]
impl ResourceService<SecurityGroup> for MemoryCloud {
    async fn describe(&self, name: &str) -> Result<SecurityGroupStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::SecurityGroup, Operation::Describe, name)?;
        state
            .security_groups
            .get(name)
            .map(|g| g.status.clone())
            .ok_or_else(|| ProviderError::not_found("security group", name))
    }

    async fn create(
        &self,
        desired: &SecurityGroupDesired,
    ) -> Result<SecurityGroupStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::SecurityGroup, Operation::Create, &desired.name)?;
        if state.security_groups.contains_key(&desired.name) {
            return Err(ProviderError::Conflict(format!(
                "InvalidGroup.Duplicate: {} already exists",
                desired.name
            )));
        }
        let mut ingress_rules = desired.ingress.clone().unwrap_or_default();
        ingress_rules.sort();
        let status = SecurityGroupStatus {
            id: state.next_id("sg"),
            name: desired.name.clone(),
            ingress_rules,
            tags: desired.tags.clone(),
        };
        state.security_groups.insert(
            desired.name.clone(),
            StoredGroup {
                vpc_id: desired.vpc_id.clone(),
                status: status.clone(),
            },
        );
        Ok(status)
    }

    async fn update(
        &self,
        name: &str,
        diff: &SecurityGroupDiff,
    ) -> Result<SecurityGroupStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::SecurityGroup, Operation::Update, name)?;
        let group = state
            .security_groups
            .get_mut(name)
            .ok_or_else(|| ProviderError::not_found("security group", name))?;
        let rules = &mut group.status.ingress_rules;
        rules.retain(|r| !diff.revoke.contains(r));
        for r in &diff.authorize {
            if !rules.contains(r) {
                rules.push(r.clone());
            }
        }
        rules.sort();
        group.status.tags.merge(&diff.tags);
        Ok(group.status.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::SecurityGroup, Operation::Delete, name)?;
        let Some(id) = state.security_groups.get(name).map(|g| g.status.id.clone()) else {
            return Err(ProviderError::not_found("security group", name));
        };
        let in_use = state
            .bastions
            .values()
            .any(|b| b.security_group_ids.contains(&id))
            || state
                .load_balancers
                .values()
                .any(|l| l.security_group_ids.contains(&id));
        if in_use {
            return Err(ProviderError::Conflict(format!(
                "DependencyViolation: security group {id} is in use"
            )));
        }
        state.security_groups.remove(name);
        Ok(())
    }

    async fn list_owned(&self, owner_tag_key: &str) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::SecurityGroup, Operation::List, owner_tag_key)?;
        Ok(owned_names(
            state.security_groups.iter().map(|(k, g)| (k, &g.status.tags)),
            owner_tag_key,
        ))
    }
}

#[async_trait]
impl ResourceService<Bastion> for MemoryCloud {
    async fn describe(&self, name: &str) -> Result<BastionStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Bastion, Operation::Describe, name)?;
        state
            .bastions
            .get(name)
            .map(|b| b.status.clone())
            .ok_or_else(|| ProviderError::not_found("bastion", name))
    }

    async fn create(&self, desired: &BastionDesired) -> Result<BastionStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Bastion, Operation::Create, &desired.name)?;
        if state.bastions.contains_key(&desired.name) {
            return Err(ProviderError::Conflict(format!(
                "bastion {} already exists",
                desired.name
            )));
        }
        let vpc_id = state.subnet_vpc(&desired.subnet_id);
        let launch_state = state
            .bastion_launch_state
            .clone()
            .unwrap_or_else(|| bastion::STATE_RUNNING.to_string());
        let instance_id = state.next_id("i");
        let public_ip = Some(format!("203.0.113.{}", state.next_id % 250 + 1));
        let status = BastionStatus {
            instance_id,
            instance_type: desired.instance_type.clone(),
            state: launch_state,
            public_ip,
        };
        state.bastions.insert(
            desired.name.clone(),
            StoredBastion {
                vpc_id,
                security_group_ids: desired.security_group_ids.clone(),
                tags: desired.tags.clone(),
                status: status.clone(),
            },
        );
        Ok(status)
    }

    async fn update(&self, name: &str, diff: &BastionDiff) -> Result<BastionStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Bastion, Operation::Update, name)?;
        let b = state
            .bastions
            .get_mut(name)
            .ok_or_else(|| ProviderError::not_found("bastion", name))?;
        b.status.instance_type = diff.instance_type.clone();
        Ok(b.status.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Bastion, Operation::Delete, name)?;
        state
            .bastions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found("bastion", name))
    }

    async fn list_owned(&self, owner_tag_key: &str) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::Bastion, Operation::List, owner_tag_key)?;
        Ok(owned_names(
            state.bastions.iter().map(|(k, b)| (k, &b.tags)),
            owner_tag_key,
        ))
    }
}

#[async_trait]
impl ResourceService<LoadBalancer> for MemoryCloud {
    async fn describe(&self, name: &str) -> Result<LoadBalancerStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::LoadBalancer, Operation::Describe, name)?;
        state
            .load_balancers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::not_found("load balancer", name))
    }

    async fn create(
        &self,
        desired: &LoadBalancerDesired,
    ) -> Result<LoadBalancerStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::LoadBalancer, Operation::Create, &desired.name)?;
        if desired.subnet_ids.is_empty() {
            return Err(ProviderError::Invalid(format!(
                "load balancer {} needs at least one {} subnet",
                desired.name,
                if desired.scheme.as_str() == "internal" {
                    "private"
                } else {
                    "public"
                }
            )));
        }
        if state.load_balancers.contains_key(&desired.name) {
            return Err(ProviderError::Conflict(format!(
                "DuplicateLoadBalancerName: {}",
                desired.name
            )));
        }
        let dns_name = if state.instant_dns {
            let host = format!("{}.elb.amazonaws.com", desired.name);
            state.resolvable.insert(host.clone());
            host
        } else {
            String::new()
        };
        let status = LoadBalancerStatus {
            name: desired.name.clone(),
            dns_name,
            scheme: desired.scheme.as_str().to_string(),
            subnet_ids: desired.subnet_ids.clone(),
            security_group_ids: desired.security_group_ids.clone(),
            availability_zones: desired.availability_zones.clone(),
            cross_zone_load_balancing: desired.cross_zone_load_balancing,
            idle_timeout_seconds: desired.idle_timeout_seconds,
            tags: desired.tags.clone(),
        };
        state
            .load_balancers
            .insert(desired.name.clone(), status.clone());
        Ok(status)
    }

    async fn update(
        &self,
        name: &str,
        diff: &LoadBalancerDiff,
    ) -> Result<LoadBalancerStatus, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::LoadBalancer, Operation::Update, name)?;
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| ProviderError::not_found("load balancer", name))?;
        if let Some(v) = diff.cross_zone_load_balancing {
            lb.cross_zone_load_balancing = v;
        }
        if let Some(v) = diff.idle_timeout_seconds {
            lb.idle_timeout_seconds = v;
        }
        if let Some(v) = &diff.subnet_ids {
            lb.subnet_ids.clone_from(v);
        }
        if let Some(v) = &diff.availability_zones {
            lb.availability_zones.clone_from(v);
        }
        if let Some(v) = &diff.security_group_ids {
            lb.security_group_ids.clone_from(v);
        }
        lb.tags.merge(&diff.tags);
        Ok(lb.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::LoadBalancer, Operation::Delete, name)?;
        if state.load_balancers.remove(name).is_none() {
            return Err(ProviderError::not_found("load balancer", name));
        }
        state.registrations.remove(name);
        Ok(())
    }

    async fn list_owned(&self, owner_tag_key: &str) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::LoadBalancer, Operation::List, owner_tag_key)?;
        Ok(owned_names(
            state.load_balancers.iter().map(|(k, l)| (k, &l.tags)),
            owner_tag_key,
        ))
    }
}

#[async_trait]
impl ResourceService<InstanceAttachment> for MemoryCloud {
    async fn describe(&self, name: &str) -> Result<AttachmentState, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::InstanceAttachment, Operation::Describe, name)?;
        if !state.load_balancers.contains_key(name) {
            return Err(ProviderError::not_found("load balancer", name));
        }
        Ok(AttachmentState {
            load_balancer: name.to_string(),
            instance_ids: state.registrations.get(name).cloned().unwrap_or_default(),
        })
    }

    async fn create(&self, desired: &AttachmentState) -> Result<AttachmentState, ProviderError> {
        let mut state = self.state();
        state.enter(
            SubResourceKind::InstanceAttachment,
            Operation::Create,
            &desired.load_balancer,
        )?;
        if !state.load_balancers.contains_key(&desired.load_balancer) {
            return Err(ProviderError::not_found(
                "load balancer",
                &desired.load_balancer,
            ));
        }
        state
            .registrations
            .insert(desired.load_balancer.clone(), desired.instance_ids.clone());
        Ok(desired.clone())
    }

    async fn update(
        &self,
        name: &str,
        diff: &AttachmentDiff,
    ) -> Result<AttachmentState, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::InstanceAttachment, Operation::Update, name)?;
        if !state.load_balancers.contains_key(name) {
            return Err(ProviderError::not_found("load balancer", name));
        }
        let registered = state.registrations.entry(name.to_string()).or_default();
        registered.retain(|i| !diff.deregister.contains(i));
        for i in &diff.register {
            if !registered.contains(i) {
                registered.push(i.clone());
            }
        }
        registered.sort();
        Ok(AttachmentState {
            load_balancer: name.to_string(),
            instance_ids: registered.clone(),
        })
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::InstanceAttachment, Operation::Delete, name)?;
        if !state.load_balancers.contains_key(name) {
            return Err(ProviderError::not_found("load balancer", name));
        }
        state.registrations.remove(name);
        Ok(())
    }

    async fn list_owned(&self, owner_tag_key: &str) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state();
        state.enter(SubResourceKind::InstanceAttachment, Operation::List, owner_tag_key)?;
        Ok(Vec::new())
    }
}

impl ServiceFactory for MemoryCloud {
    fn services(&self, credentials: &Credentials, _region: &str) -> CloudServices {
        self.state()
            .credential_sources
            .push(credentials.source.clone());
        CloudServices {
            networks: Arc::new(self.clone()),
            security_groups: Arc::new(self.clone()),
            bastions: Arc::new(self.clone()),
            load_balancers: Arc::new(self.clone()),
            attachments: Arc::new(self.clone()),
        }
    }
}

#[async_trait]
impl DnsResolver for MemoryCloud {
    async fn resolves(&self, host: &str) -> bool {
        self.state().resolvable.contains(host)
    }
}
