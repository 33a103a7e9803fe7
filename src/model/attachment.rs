//! # Instance Attachment
//!
//! Registration of control plane instances with the API server load balancer. The
//! attachment is addressed by the load balancer name; deleting it deregisters every
//! instance.

use super::{sorted, SubResource, SubResourceKind};

/// Instance attachment sub-resource marker
#[derive(Debug)]
pub struct InstanceAttachment;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentState {
    pub load_balancer: String,
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDiff {
    pub register: Vec<String>,
    pub deregister: Vec<String>,
}

impl SubResource for InstanceAttachment {
    const KIND: SubResourceKind = SubResourceKind::InstanceAttachment;

    type Desired = AttachmentState;
    type Observed = AttachmentState;
    type Diff = AttachmentDiff;

    fn name(desired: &AttachmentState) -> &str {
        &desired.load_balancer
    }

    fn diff(desired: &AttachmentState, observed: &AttachmentState) -> Option<AttachmentDiff> {
        let want = sorted(&desired.instance_ids);
        let have = sorted(&observed.instance_ids);
        let register: Vec<String> = want.iter().filter(|i| !have.contains(i)).cloned().collect();
        let deregister: Vec<String> = have.iter().filter(|i| !want.contains(i)).cloned().collect();
        (!register.is_empty() || !deregister.is_empty()).then_some(AttachmentDiff {
            register,
            deregister,
        })
    }
}

pub fn desired(load_balancer: &str, instance_ids: &[String]) -> AttachmentState {
    AttachmentState {
        load_balancer: load_balancer.to_string(),
        instance_ids: sorted(instance_ids),
    }
}
