//! # Events
//!
//! Fire-and-forget event records keyed by resource identity.
//!
//! A failed publish is logged and dropped; it never fails a reconciliation pass.

use crate::crd::AWSCluster;
use crate::model::ResourceKey;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Event reasons shown in the REASON column
pub mod reasons {
    pub const CREATED: &str = "SuccessfulCreate";
    pub const UPDATED: &str = "SuccessfulUpdate";
    pub const DELETED: &str = "SuccessfulDelete";
    pub const CREATE_FAILED: &str = "FailedCreate";
    pub const DELETE_FAILED: &str = "FailedDelete";
    pub const IDENTITY_FAILED: &str = "FailedIdentity";
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// One human-readable event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub key: ResourceKey,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

impl ClusterEvent {
    pub fn normal(key: &ResourceKey, reason: &str, message: impl Into<String>) -> Self {
        Self {
            key: key.clone(),
            kind: EventKind::Normal,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(key: &ResourceKey, reason: &str, message: impl Into<String>) -> Self {
        Self {
            key: key.clone(),
            kind: EventKind::Warning,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Destination for cluster events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: ClusterEvent);
}

/// Writes events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: ClusterEvent) {
        match event.kind {
            EventKind::Normal => info!(
                resource.namespace = %event.key.namespace,
                resource.name = %event.key.name,
                reason = %event.reason,
                "{}",
                event.message
            ),
            EventKind::Warning => warn!(
                resource.namespace = %event.key.namespace,
                resource.name = %event.key.name,
                reason = %event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Keeps events in memory for assertions
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<ClusterEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClusterEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: ClusterEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Publishes Kubernetes Events against the AWSCluster object
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    fn object_ref(key: &ResourceKey) -> ObjectReference {
        ObjectReference {
            api_version: Some(AWSCluster::api_version(&()).to_string()),
            kind: Some(AWSCluster::kind(&()).to_string()),
            namespace: Some(key.namespace.clone()),
            name: Some(key.name.clone()),
            ..ObjectReference::default()
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, event: ClusterEvent) {
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        let record = Event {
            type_,
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self
            .recorder
            .publish(&record, &Self::object_ref(&event.key))
            .await
        {
            warn!(
                resource.namespace = %event.key.namespace,
                resource.name = %event.key.name,
                reason = %event.reason,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}
