use super::{ClusterEvent, ClusterState, DeleteOutcome, EventKind, NodeTaint, PodFilter};
use crate::model::{NodeInfo, OwnerRef, PodId, PodInfo, PodPhase, Resources};
use crate::quantity;
use controller_core::{Error, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod, PodSpec, Taint};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, Preconditions, ResourceExt},
    client::Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const ACTIVE_PODS_FIELD_SELECTOR: &str = "status.phase!=Succeeded,status.phase!=Failed";

/// `ClusterState` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeClusterState {
    client: Client,
    reporter: Reporter,
}

impl KubeClusterState {
    pub fn new(client: Client, reporter: &str) -> Self {
        Self {
            client,
            reporter: reporter.into(),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn patch_taints(&self, node: &Node, taints: Vec<Taint>) -> Result<()> {
        let patch: Patch<serde_json::Value> = Patch::Merge(json!({
            "metadata": {
                "resourceVersion": node.resource_version(),
            },
            "spec": {
                "taints": taints,
            }
        }));
        self.nodes()
            .patch(&node.name_any(), &PatchParams::default(), &patch)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes = self
            .nodes()
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        Ok(nodes
            .items
            .iter()
            .filter_map(|node| match node_info(node) {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!("Skipping node {}: {}", node.name_any(), err);
                    None
                }
            })
            .collect())
    }

    async fn list_pods(&self, filter: &PodFilter) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = match &filter.namespace {
            Some(namespace) => self.pods(namespace),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if let Some(selector) = &filter.label_selector {
            params = params.labels(selector);
        }
        if filter.active_only {
            params = params.fields(ACTIVE_PODS_FIELD_SELECTOR);
        }

        let pods = api.list(&params).await.map_err(Error::KubeError)?;
        Ok(pods
            .items
            .iter()
            .filter_map(|pod| match pod_info(pod) {
                Ok(info) => Some(info),
                Err(err) => {
                    warn!(
                        "Skipping pod {}/{}: {}",
                        pod.namespace().unwrap_or_default(),
                        pod.name_any(),
                        err,
                    );
                    None
                }
            })
            .collect())
    }

    async fn delete_pod(&self, pod: &PodId) -> Result<DeleteOutcome> {
        let params = DeleteParams {
            preconditions: pod.uid.as_ref().map(|uid| Preconditions {
                uid: Some(uid.clone()),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        match self.pods(&pod.namespace).delete(&pod.name, &params).await {
            Ok(_) => {
                info!("Deleted pod {}", pod);
                Ok(DeleteOutcome::Deleted)
            }
            // 409: the uid precondition failed, so the incarnation we meant is already gone
            Err(err) if is_status(&err, 404) || is_status(&err, 409) => {
                debug!("Pod {} already gone: {}", pod, err);
                Ok(DeleteOutcome::NotFound)
            }
            Err(err) => Err(Error::KubeError(err)),
        }
    }

    async fn pod_phase(&self, pod: &PodId) -> Result<Option<PodPhase>> {
        let Some(current) = self
            .pods(&pod.namespace)
            .get_opt(&pod.name)
            .await
            .map_err(Error::KubeError)?
        else {
            return Ok(None);
        };
        if pod.uid.is_some() && current.uid() != pod.uid {
            return Ok(None);
        }
        Ok(Some(phase_of(&current)))
    }

    async fn taint_node(&self, node: &str, taint: &NodeTaint) -> Result<()> {
        let current = self.nodes().get(node).await.map_err(Error::KubeError)?;
        let mut taints = current
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.clone())
            .unwrap_or_default();
        if taints.iter().any(|t| t.key == taint.key) {
            debug!("Node {} already carries taint {}", node, taint.key);
            return Ok(());
        }
        taints.push(Taint {
            key: taint.key.clone(),
            value: Some(taint.value.clone()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        });
        self.patch_taints(&current, taints).await?;
        info!("Tainted node {} with {}={}:NoSchedule", node, taint.key, taint.value);
        Ok(())
    }

    async fn untaint_node(&self, node: &str, key: &str) -> Result<()> {
        let current = match self.nodes().get(node).await {
            Ok(current) => current,
            Err(err) if is_status(&err, 404) => return Ok(()),
            Err(err) => return Err(Error::KubeError(err)),
        };
        let taints = current
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.clone())
            .unwrap_or_default();
        let remaining: Vec<Taint> = taints.iter().filter(|t| t.key != key).cloned().collect();
        if remaining.len() == taints.len() {
            return Ok(());
        }
        self.patch_taints(&current, remaining).await?;
        info!("Removed taint {} from node {}", key, node);
        Ok(())
    }

    async fn record_event(&self, pod: &PodId, event: &ClusterEvent) -> Result<()> {
        let reference = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Pod".to_string()),
            name: Some(pod.name.clone()),
            namespace: Some(pod.namespace.clone()),
            uid: pod.uid.clone(),
            ..ObjectReference::default()
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        recorder
            .publish(Event {
                type_: match event.kind {
                    EventKind::Normal => EventType::Normal,
                    EventKind::Warning => EventType::Warning,
                },
                reason: event.reason.clone(),
                note: Some(event.note.clone()),
                action: event.action.clone(),
                secondary: None,
            })
            .await
            .map_err(Error::KubeError)
    }
}

fn resources_of(list: Option<&BTreeMap<String, Quantity>>) -> Result<Resources> {
    let Some(list) = list else {
        return Ok(Resources::default());
    };
    let cpu_millis = list
        .get("cpu")
        .map(|q| quantity::cpu_millis(&q.0))
        .transpose()?
        .unwrap_or_default();
    let memory_bytes = list
        .get("memory")
        .map(|q| quantity::memory_bytes(&q.0))
        .transpose()?
        .unwrap_or_default();
    Ok(Resources::new(cpu_millis, memory_bytes))
}

/// What the scheduler reserves for a pod: the larger of the summed app containers and
/// any single init container, plus pod overhead.
fn effective_requests(spec: &PodSpec) -> Result<Resources> {
    let requests_of = |resources: Option<&k8s_openapi::api::core::v1::ResourceRequirements>| {
        resources_of(resources.and_then(|r| r.requests.as_ref()))
    };

    let mut containers = Resources::default();
    for container in &spec.containers {
        containers += requests_of(container.resources.as_ref())?;
    }

    let mut init = Resources::default();
    for container in spec.init_containers.iter().flatten() {
        let requests = requests_of(container.resources.as_ref())?;
        init.cpu_millis = init.cpu_millis.max(requests.cpu_millis);
        init.memory_bytes = init.memory_bytes.max(requests.memory_bytes);
    }

    let overhead = resources_of(spec.overhead.as_ref())?;
    Ok(Resources::new(
        containers.cpu_millis.max(init.cpu_millis),
        containers.memory_bytes.max(init.memory_bytes),
    ) + overhead)
}

/// Map the API phase, folding in the scheduler's verdict the way `kubectl` shows it.
pub(crate) fn phase_of(pod: &Pod) -> PodPhase {
    let status = pod.status.as_ref();
    let unschedulable = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "PodScheduled"))
        .is_some_and(|c| c.status == "False" && c.reason.as_deref() == Some("Unschedulable"));

    match status.and_then(|s| s.phase.as_deref()) {
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        Some("Pending") | None if unschedulable => PodPhase::Unschedulable,
        Some("Pending") | None => PodPhase::Pending,
        _ => PodPhase::Unknown,
    }
}

fn pending_since(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "PodScheduled"))
        .and_then(|c| c.last_transition_time.as_ref())
        .or(pod.metadata.creation_timestamp.as_ref())
        .map(|t| t.0)
}

pub(crate) fn pod_info(pod: &Pod) -> Result<PodInfo> {
    let name = pod
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::MalformedObject("pod without a name".into()))?;
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let spec = pod
        .spec
        .as_ref()
        .ok_or_else(|| Error::MalformedObject(format!("pod {namespace}/{name} has no spec")))?;

    let mut id = PodId::new(&namespace, name);
    id.uid = pod.uid();

    let phase = phase_of(pod);
    let mut info = PodInfo::new(id, effective_requests(spec)?, phase);
    info.labels = pod.labels().clone();
    info.annotations = pod.annotations().clone();
    info.priority = spec.priority.unwrap_or_default();
    info.priority_class = spec.priority_class_name.clone();
    info.node_name = spec.node_name.clone();
    info.node_selector = spec.node_selector.clone().unwrap_or_default();
    info.owner = pod
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true))
        .map(|owner| OwnerRef {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
        });
    info.terminating = pod.metadata.deletion_timestamp.is_some();
    if !info.is_bound() {
        info.pending_since = pending_since(pod);
    }
    Ok(info)
}

pub(crate) fn node_info(node: &Node) -> Result<NodeInfo> {
    let name = node
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::MalformedObject("node without a name".into()))?;
    let status = node.status.as_ref();
    let allocatable = resources_of(
        status
            .and_then(|s| s.allocatable.as_ref())
            .or_else(|| status.and_then(|s| s.capacity.as_ref())),
    )?;

    let mut info = NodeInfo::new(name, allocatable);
    info.labels = node.labels().clone();
    info.unschedulable = node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
    info.ready = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True");
    Ok(info)
}
