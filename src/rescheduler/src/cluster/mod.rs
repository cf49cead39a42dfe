//! The cluster state provider: everything the rescheduler reads from or writes to the cluster.

mod kubernetes;

pub use self::kubernetes::KubeClusterState;

use crate::clock::Clock;
use crate::model::{NodeInfo, PodId, PodInfo, PodPhase};
use controller_core::Result;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

pub const CRITICAL_ADDONS_ONLY_TAINT: &str = "CriticalAddonsOnly";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodFilter {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    /// Skip pods that finished (Succeeded or Failed).
    pub active_only: bool,
}

impl PodFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// An operator-facing event attached to a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterEvent {
    pub kind: EventKind,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl ClusterEvent {
    pub fn normal(reason: &str, action: &str, note: String) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
        }
    }

    pub fn warning(reason: &str, action: &str, note: String) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
        }
    }
}

/// `NoSchedule` taint keeping ordinary pods off a node while its capacity is being freed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeTaint {
    pub key: String,
    pub value: String,
}

impl NodeTaint {
    pub fn critical_addons_only(value: &str) -> Self {
        Self {
            key: CRITICAL_ADDONS_ONLY_TAINT.to_string(),
            value: value.to_string(),
        }
    }
}

#[async_trait]
pub trait ClusterState: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    async fn list_pods(&self, filter: &PodFilter) -> Result<Vec<PodInfo>>;

    /// Delete one pod incarnation. A pod that is already gone is `NotFound`, not an error.
    async fn delete_pod(&self, pod: &PodId) -> Result<DeleteOutcome>;

    /// Current phase, or `None` once the pod (this incarnation of it) no longer exists.
    async fn pod_phase(&self, pod: &PodId) -> Result<Option<PodPhase>>;

    async fn taint_node(&self, node: &str, taint: &NodeTaint) -> Result<()>;

    async fn untaint_node(&self, node: &str, key: &str) -> Result<()>;

    async fn record_event(&self, pod: &PodId, event: &ClusterEvent) -> Result<()>;
}

/// Poll `pod_phase` every `interval`, yielding each observation. The first observation is
/// immediate. The stream never ends by itself; callers bound it.
pub fn watch_pod_phase(
    cluster: Arc<dyn ClusterState>,
    clock: Arc<dyn Clock>,
    pod: PodId,
    interval: Duration,
) -> BoxStream<'static, Result<Option<PodPhase>>> {
    stream::unfold(false, move |started| {
        let cluster = cluster.clone();
        let clock = clock.clone();
        let pod = pod.clone();
        async move {
            if started {
                clock.sleep(interval).await;
            }
            Some((cluster.pod_phase(&pod).await, true))
        }
    })
    .boxed()
}
