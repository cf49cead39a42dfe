//! Helper methods only available for tests
use crate::cluster::{ClusterEvent, ClusterState, DeleteOutcome, NodeTaint, PodFilter, CRITICAL_ADDONS_ONLY_TAINT};
use crate::config::CRITICAL_POD_ANNOTATION;
use crate::model::{NodeInfo, OwnerRef, PodId, PodInfo, PodPhase, Resources};
use controller_core::{Error, Result};

use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{Request, Response};
use hyper::{body::to_bytes, Body};
use kube::{error::ErrorResponse, Client};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

pub const GIB: u64 = 1024 * 1024 * 1024;

pub fn node(name: &str, cpu_millis: u64) -> NodeInfo {
    NodeInfo::new(name, Resources::new(cpu_millis, 4 * GIB))
}

/// A replica-managed pod running on `node`.
pub fn running(name: &str, node: &str, cpu_millis: u64, priority: i32) -> PodInfo {
    let mut pod = PodInfo::new(
        PodId::new("default", name).with_uid(&format!("uid-{name}")),
        Resources::new(cpu_millis, 64 * 1024 * 1024),
        PodPhase::Running,
    );
    pod.node_name = Some(node.to_string());
    pod.priority = priority;
    pod.owner = Some(OwnerRef {
        kind: "ReplicationController".into(),
        name: "reserve-all-cpu".into(),
    });
    pod
}

/// An unschedulable kube-system pod carrying the critical-pod annotation.
pub fn critical_pending(name: &str, cpu_millis: u64, since: DateTime<Utc>) -> PodInfo {
    let mut pod = PodInfo::new(
        PodId::new("kube-system", name).with_uid(&format!("uid-{name}")),
        Resources::new(cpu_millis, 64 * 1024 * 1024),
        PodPhase::Unschedulable,
    );
    pod.annotations.insert(CRITICAL_POD_ANNOTATION.into(), String::new());
    pod.labels.insert("k8s-app".into(), "kube-dns".into());
    pod.owner = Some(OwnerRef {
        kind: "ReplicationController".into(),
        name: "kube-dns".into(),
    });
    pod.pending_since = Some(since);
    pod
}

#[derive(Default)]
struct FakeState {
    nodes: Vec<NodeInfo>,
    pods: Vec<PodInfo>,
    deletes: Vec<PodId>,
    /// Pods whose deletion is acknowledged but never takes effect.
    sticky: HashSet<String>,
    forbidden: HashSet<String>,
    failing_lists: usize,
    scheduler_paused: bool,
    taints: BTreeMap<String, Vec<NodeTaint>>,
    events: Vec<(PodId, ClusterEvent)>,
}

impl FakeState {
    fn find(&self, id: &PodId) -> Option<usize> {
        self.pods.iter().position(|p| {
            p.id.namespace == id.namespace
                && p.id.name == id.name
                && (id.uid.is_none() || p.id.uid == id.uid)
        })
    }

    fn free_on(&self, node: &NodeInfo) -> Resources {
        let used: Resources = self
            .pods
            .iter()
            .filter(|p| p.consumes_capacity() && p.node_name.as_deref() == Some(node.name.as_str()))
            .map(|p| p.requests)
            .sum();
        node.allocatable.saturating_sub(&used)
    }

    /// Stand-in for the primary scheduler: binds pending pods, oldest first, to the first
    /// node with room whose taints they tolerate.
    fn schedule_pending(&mut self) {
        if self.scheduler_paused {
            return;
        }
        let mut pending: Vec<usize> = (0..self.pods.len())
            .filter(|i| {
                let pod = &self.pods[*i];
                !pod.is_bound() && pod.phase.is_active()
            })
            .collect();
        pending.sort_by_key(|i| self.pods[*i].pending_since);

        for i in pending {
            let tolerates_reservation = self.pods[i].annotations.contains_key(CRITICAL_POD_ANNOTATION);
            let target = self
                .nodes
                .iter()
                .filter(|node| node.can_host(&self.pods[i]))
                .filter(|node| {
                    tolerates_reservation
                        || !self
                            .taints
                            .get(&node.name)
                            .is_some_and(|t| t.iter().any(|t| t.key == CRITICAL_ADDONS_ONLY_TAINT))
                })
                .find(|node| self.pods[i].requests.fits_within(&self.free_on(node)))
                .map(|node| node.name.clone());
            if let Some(target) = target {
                let pod = &mut self.pods[i];
                pod.node_name = Some(target);
                pod.phase = PodPhase::Running;
                pod.pending_since = None;
            }
        }
    }
}

/// In-memory cluster with a naive scheduler that runs after every successful delete.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new(nodes: Vec<NodeInfo>, pods: Vec<PodInfo>) -> Self {
        Self {
            state: Mutex::new(FakeState {
                nodes,
                pods,
                ..FakeState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn make_sticky(&self, name: &str) {
        self.lock().sticky.insert(name.to_string());
    }

    pub fn pause_scheduler(&self) {
        self.lock().scheduler_paused = true;
    }

    pub fn fail_next_lists(&self, count: usize) {
        self.lock().failing_lists = count;
    }

    /// Deletes of this pod are refused with 403 Forbidden.
    pub fn forbid_delete(&self, name: &str) {
        self.lock().forbidden.insert(name.to_string());
    }

    pub fn deletes(&self) -> Vec<PodId> {
        self.lock().deletes.clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.lock().events.iter().map(|(_, e)| e.reason.clone()).collect()
    }

    pub fn taints(&self, node: &str) -> Vec<NodeTaint> {
        self.lock().taints.get(node).cloned().unwrap_or_default()
    }

    pub fn pod(&self, name: &str) -> Option<PodInfo> {
        self.lock().pods.iter().find(|p| p.id.name == name).cloned()
    }
}

#[async_trait]
impl ClusterState for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut state = self.lock();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(Error::FetchError("connection refused".into()));
        }
        Ok(state.nodes.clone())
    }

    async fn list_pods(&self, filter: &PodFilter) -> Result<Vec<PodInfo>> {
        let state = self.lock();
        Ok(state
            .pods
            .iter()
            .filter(|p| filter.namespace.as_ref().map_or(true, |ns| &p.id.namespace == ns))
            .filter(|p| !filter.active_only || p.phase.is_active())
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, pod: &PodId) -> Result<DeleteOutcome> {
        let mut state = self.lock();
        if state.forbidden.contains(&pod.name) {
            return Err(Error::KubeError(kube::Error::Api(ErrorResponse {
                status: "Failure".into(),
                message: format!("pods \"{}\" is forbidden", pod.name),
                reason: "Forbidden".into(),
                code: 403,
            })));
        }
        state.deletes.push(pod.clone());
        let Some(index) = state.find(pod) else {
            return Ok(DeleteOutcome::NotFound);
        };
        if !state.sticky.contains(&pod.name) {
            state.pods.remove(index);
            state.schedule_pending();
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn pod_phase(&self, pod: &PodId) -> Result<Option<PodPhase>> {
        let state = self.lock();
        Ok(state.find(pod).map(|i| state.pods[i].phase))
    }

    async fn taint_node(&self, node: &str, taint: &NodeTaint) -> Result<()> {
        let mut state = self.lock();
        let taints = state.taints.entry(node.to_string()).or_default();
        if !taints.iter().any(|t| t.key == taint.key) {
            taints.push(taint.clone());
        }
        Ok(())
    }

    async fn untaint_node(&self, node: &str, key: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(taints) = state.taints.get_mut(node) {
            taints.retain(|t| t.key != key);
        }
        Ok(())
    }

    async fn record_event(&self, pod: &PodId, event: &ClusterEvent) -> Result<()> {
        self.lock().events.push((pod.clone(), event.clone()));
        Ok(())
    }
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    DeletePod(PodId),
    DeleteMissingPod(PodId),
    /// The pod exists under the same name but with the given (different) uid
    GetPodWithUid(PodId, String),
    ListNodes,
    /// Node listing is refused, as without RBAC for nodes
    ListNodesForbidden,
    /// Cluster-wide pod list that must exclude finished pods
    ListActivePods,
    /// The node already carries a `dedicated` taint; the reservation is appended
    TaintNode(String),
    /// The node carries `dedicated` and the reservation; only `dedicated` is kept
    UntaintNode(String),
    RecordEvent(PodId, String),
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

fn json_response(status: u16, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn dedicated_taint() -> serde_json::Value {
    json!({ "key": "dedicated", "value": "infra", "effect": "NoSchedule" })
}

fn reservation_taint() -> serde_json::Value {
    json!({ "key": CRITICAL_ADDONS_ONLY_TAINT, "value": "rescheduler", "effect": "NoSchedule" })
}

fn tainted_node_json(name: &str, taints: Vec<serde_json::Value>) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": { "name": name, "resourceVersion": "42" },
        "spec": { "taints": taints }
    })
}

fn pod_json(pod: &PodId, uid: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": pod.name, "namespace": pod.namespace, "uid": uid },
        "spec": { "containers": [{ "name": "app" }] },
        "status": { "phase": "Running" }
    })
}

impl ApiServerVerifier {
    /// Create a kube client whose requests land in the returned verifier
    pub fn new() -> (Client, Self) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(mock_service, "default"), Self(handle))
    }

    /// Tests only get to run specific scenarios that has matching handlers
    ///
    /// NB: If the controller is making more calls than we are handling in the scenario,
    /// you then typically see a `KubeError(Service(Closed(())))` from the code under test.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::DeletePod(pod) => self.handle_pod_delete(pod, false).await,
                Scenario::DeleteMissingPod(pod) => self.handle_pod_delete(pod, true).await,
                Scenario::GetPodWithUid(pod, uid) => self.handle_pod_get(pod, uid).await,
                Scenario::ListNodes => self.handle_node_list().await,
                Scenario::ListNodesForbidden => self.handle_node_list_forbidden().await,
                Scenario::ListActivePods => self.handle_active_pod_list().await,
                Scenario::TaintNode(node) => self.handle_taint(node).await,
                Scenario::UntaintNode(node) => self.handle_untaint(node).await,
                Scenario::RecordEvent(pod, reason) => self.handle_event(pod, reason).await,
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_pod_delete(mut self, pod: PodId, missing: bool) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::DELETE);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/{}/pods/{}", pod.namespace, pod.name)
        );
        let req_body = to_bytes(request.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&req_body).expect("delete options are json");
        assert_json_include!(
            actual: json,
            expected: json!({ "preconditions": { "uid": pod.uid } })
        );

        let response = if missing {
            json_response(
                404,
                json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "metadata": {},
                    "status": "Failure",
                    "message": format!("pods \"{}\" not found", pod.name),
                    "reason": "NotFound",
                    "code": 404
                }),
            )
        } else {
            json_response(200, pod_json(&pod, pod.uid.as_deref().unwrap_or_default()))
        };
        send.send_response(response);
        Ok(self)
    }

    async fn handle_pod_get(mut self, pod: PodId, uid: String) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/{}/pods/{}", pod.namespace, pod.name)
        );
        send.send_response(json_response(200, pod_json(&pod, &uid)));
        Ok(self)
    }

    async fn handle_node_list(mut self) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/api/v1/nodes");
        let node = |name: &str, cpu: &str| {
            json!({
                "metadata": { "name": name },
                "status": {
                    "allocatable": { "cpu": cpu, "memory": "4Gi" },
                    "conditions": [{ "type": "Ready", "status": "True" }]
                }
            })
        };
        send.send_response(json_response(
            200,
            json!({
                "apiVersion": "v1",
                "kind": "NodeList",
                "metadata": { "resourceVersion": "1" },
                "items": [node("node-1", "2"), node("node-2", "two cores")]
            }),
        ));
        Ok(self)
    }

    async fn handle_node_list_forbidden(mut self) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.uri().path(), "/api/v1/nodes");
        send.send_response(json_response(
            403,
            json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "nodes is forbidden: User \"system:serviceaccount:kube-system:rescheduler\" cannot list resource \"nodes\"",
                "reason": "Forbidden",
                "code": 403
            }),
        ));
        Ok(self)
    }

    async fn handle_active_pod_list(mut self) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/api/v1/pods");
        let query = request.uri().query().unwrap_or_default();
        assert!(
            query.contains("fieldSelector=status.phase%21%3DSucceeded%2Cstatus.phase%21%3DFailed"),
            "unexpected query {query}"
        );
        let web = PodId::new("default", "web-1");
        let mut pod = pod_json(&web, "uid-web-1");
        pod["spec"] = json!({
            "nodeName": "node-1",
            "containers": [{ "name": "app", "resources": { "requests": { "cpu": "250m", "memory": "64Mi" } } }]
        });
        send.send_response(json_response(
            200,
            json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": { "resourceVersion": "7" },
                "items": [pod]
            }),
        ));
        Ok(self)
    }

    async fn handle_node_get(&mut self, node: &str, taints: Vec<serde_json::Value>) {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), format!("/api/v1/nodes/{node}"));
        send.send_response(json_response(200, tainted_node_json(node, taints)));
    }

    /// Answers a merge patch of the node and returns the taints it sets
    async fn handle_node_patch(&mut self, node: &str) -> serde_json::Value {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        assert_eq!(request.uri().path(), format!("/api/v1/nodes/{node}"));
        assert_eq!(
            request.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/merge-patch+json"
        );
        let req_body = to_bytes(request.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&req_body).expect("patch object is json");
        assert_json_include!(
            actual: json.clone(),
            expected: json!({ "metadata": { "resourceVersion": "42" } })
        );
        let taints = json["spec"]["taints"].clone();
        send.send_response(json_response(
            200,
            tainted_node_json(node, taints.as_array().cloned().unwrap_or_default()),
        ));
        taints
    }

    async fn handle_taint(mut self, node: String) -> Result<Self> {
        self.handle_node_get(&node, vec![dedicated_taint()]).await;
        let taints = self.handle_node_patch(&node).await;
        assert_eq!(taints, json!([dedicated_taint(), reservation_taint()]));
        Ok(self)
    }

    async fn handle_untaint(mut self, node: String) -> Result<Self> {
        self.handle_node_get(&node, vec![dedicated_taint(), reservation_taint()])
            .await;
        let taints = self.handle_node_patch(&node).await;
        assert_eq!(taints, json!([dedicated_taint()]));
        Ok(self)
    }

    async fn handle_event(mut self, pod: PodId, reason: String) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.uri().path(),
            format!("/apis/events.k8s.io/v1/namespaces/{}/events", pod.namespace)
        );
        let req_body = to_bytes(request.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&req_body).expect("event is json");
        assert_json_include!(
            actual: json.clone(),
            expected: json!({
                "reason": reason,
                "type": "Warning",
                "reportingController": "rescheduler",
                "regarding": { "kind": "Pod", "name": pod.name, "namespace": pod.namespace, "uid": pod.uid }
            })
        );
        send.send_response(json_response(201, json));
        Ok(self)
    }
}
