use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
pub const SKIP_ANNOTATION: &str = "rescheduler.kubernetes.io/skip";

/// CPU and memory, the two resources the rescheduler frees.
#[derive(Deserialize, Serialize, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl Resources {
    pub const fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu_millis <= available.cpu_millis && self.memory_bytes <= available.memory_bytes
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }

    /// Largest share of `capacity` taken by either resource, in parts per million.
    pub fn dominant_share(&self, capacity: &Resources) -> u64 {
        fn share(used: u64, total: u64) -> u64 {
            if total == 0 {
                return if used == 0 { 0 } else { 1_000_000 };
            }
            #[allow(clippy::cast_possible_truncation)]
            let ppm = (u128::from(used) * 1_000_000 / u128::from(total)) as u64;
            ppm
        }
        share(self.cpu_millis, capacity.cpu_millis).max(share(self.memory_bytes, capacity.memory_bytes))
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, other: Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, other: Resources) {
        *self = *self + other;
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Resources {
        iter.fold(Resources::default(), Add::add)
    }
}

impl<'a> Sum<&'a Resources> for Resources {
    fn sum<I: Iterator<Item = &'a Resources>>(iter: I) -> Resources {
        iter.copied().sum()
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={}m memory={}", self.cpu_millis, self.memory_bytes)
    }
}

/// Identity of one pod incarnation. A recreated pod keeps its name but gets a new uid.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl PodId {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Pending,
    /// Pending and rejected by the scheduler for lack of a fitting node.
    Unschedulable,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Still holding (or about to hold) node resources.
    pub fn is_active(&self) -> bool {
        matches!(self, PodPhase::Pending | PodPhase::Unschedulable | PodPhase::Running | PodPhase::Unknown)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub id: PodId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub requests: Resources,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
    pub phase: PodPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Controller owner, if the pod is replica-managed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terminating: bool,
    /// Set by the snapshot from the criticality predicate, never by the provider.
    #[serde(default)]
    pub critical: bool,
}

/// Why a pod may not be chosen as a victim.
#[derive(Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exemption {
    Critical,
    Unbound,
    Terminating,
    DaemonSet,
    Mirror,
    Skipped,
    Unmanaged,
}

impl PodInfo {
    pub fn new(id: PodId, requests: Resources, phase: PodPhase) -> Self {
        Self {
            id,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            requests,
            priority: 0,
            priority_class: None,
            phase,
            node_name: None,
            node_selector: BTreeMap::new(),
            owner: None,
            pending_since: None,
            terminating: false,
            critical: false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.node_name.is_some()
    }

    /// Bound and still holding its requests on the node.
    pub fn consumes_capacity(&self) -> bool {
        self.is_bound() && self.phase.is_active()
    }

    pub fn exemption(&self, evict_unmanaged: bool) -> Option<Exemption> {
        if self.critical {
            Some(Exemption::Critical)
        } else if !self.consumes_capacity() {
            Some(Exemption::Unbound)
        } else if self.terminating {
            Some(Exemption::Terminating)
        } else if self.annotations.contains_key(MIRROR_POD_ANNOTATION) {
            Some(Exemption::Mirror)
        } else if self.annotations.contains_key(SKIP_ANNOTATION) {
            Some(Exemption::Skipped)
        } else {
            match &self.owner {
                Some(owner) if owner.kind == "DaemonSet" => Some(Exemption::DaemonSet),
                None if !evict_unmanaged => Some(Exemption::Unmanaged),
                _ => None,
            }
        }
    }

    pub fn pending_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.pending_since
            .map(|since| now - since)
            .filter(|d| *d > chrono::Duration::zero())
            .unwrap_or_else(chrono::Duration::zero)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub allocatable: Resources,
    /// Derived from the pods bound to the node when the snapshot is built.
    #[serde(default)]
    pub used: Resources,
    #[serde(default)]
    pub unschedulable: bool,
    pub ready: bool,
}

impl NodeInfo {
    pub fn new(name: &str, allocatable: Resources) -> Self {
        Self {
            name: name.to_string(),
            labels: BTreeMap::new(),
            allocatable,
            used: Resources::default(),
            unschedulable: false,
            ready: true,
        }
    }

    /// Stale snapshots may report used > allocatable; free capacity bottoms out at zero.
    pub fn free(&self) -> Resources {
        self.allocatable.saturating_sub(&self.used)
    }

    /// Whether the primary scheduler could place `pod` here, capacity aside.
    pub fn can_host(&self, pod: &PodInfo) -> bool {
        self.ready
            && !self.unschedulable
            && pod
                .node_selector
                .iter()
                .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

/// Immutable point-in-time view of the cluster used for one tick.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    taken_at: DateTime<Utc>,
    nodes: Vec<NodeInfo>,
    pods: Vec<PodInfo>,
    #[serde(skip)]
    node_index: HashMap<String, usize>,
}

impl Snapshot {
    pub fn new(taken_at: DateTime<Utc>, mut nodes: Vec<NodeInfo>, pods: Vec<PodInfo>) -> Self {
        let node_index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.name.clone(), i))
            .collect();
        for node in &mut nodes {
            node.used = Resources::default();
        }
        for pod in pods.iter().filter(|p| p.consumes_capacity()) {
            if let Some(i) = pod.node_name.as_ref().and_then(|n| node_index.get(n)) {
                nodes[*i].used += pod.requests;
            }
        }
        Self {
            taken_at,
            nodes,
            pods,
            node_index,
        }
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn pods(&self) -> &[PodInfo] {
        &self.pods
    }

    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.node_index.get(name).map(|i| &self.nodes[*i])
    }

    pub fn pod(&self, id: &PodId) -> Option<&PodInfo> {
        self.pods.iter().find(|p| &p.id == id)
    }

    pub fn pods_on<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a PodInfo> + 'a {
        self.pods
            .iter()
            .filter(move |p| p.consumes_capacity() && p.node_name.as_deref() == Some(node))
    }

    pub fn total_free(&self) -> Resources {
        self.nodes.iter().map(NodeInfo::free).sum()
    }
}

/// A critical pod that cannot be placed with the capacity currently free.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StarvedPod {
    pub pod: PodInfo,
    #[serde(serialize_with = "serialize_seconds")]
    pub pending_for: chrono::Duration,
}

fn serialize_seconds<S: serde::Serializer>(d: &chrono::Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(d.num_seconds())
}

/// One victim chosen for one starved pod; lives for a single tick.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EvictionDecision {
    pub victim: PodInfo,
    pub node: String,
    pub starved: PodId,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(name: &str, node: &str, cpu: u64, phase: PodPhase) -> PodInfo {
        let mut pod = PodInfo::new(PodId::new("default", name), Resources::new(cpu, 0), phase);
        pod.node_name = Some(node.to_string());
        pod
    }

    #[test]
    fn snapshot_derives_used_from_active_bound_pods() {
        let nodes = vec![
            NodeInfo::new("node-1", Resources::new(1000, 1 << 30)),
            NodeInfo::new("node-2", Resources::new(1000, 1 << 30)),
        ];
        let pods = vec![
            bound("a", "node-1", 300, PodPhase::Running),
            bound("b", "node-1", 200, PodPhase::Pending),
            bound("c", "node-1", 500, PodPhase::Succeeded),
            PodInfo::new(PodId::new("default", "d"), Resources::new(900, 0), PodPhase::Unschedulable),
        ];
        let snapshot = Snapshot::new(Utc::now(), nodes, pods);
        assert_eq!(snapshot.node("node-1").unwrap().used.cpu_millis, 500);
        assert_eq!(snapshot.node("node-2").unwrap().used.cpu_millis, 0);
        assert_eq!(snapshot.total_free().cpu_millis, 1500);
        assert_eq!(snapshot.pods_on("node-1").count(), 2);
    }

    #[test]
    fn overcommitted_node_has_no_free_capacity() {
        let nodes = vec![NodeInfo::new("node-1", Resources::new(1000, 0))];
        let pods = vec![
            bound("a", "node-1", 800, PodPhase::Running),
            bound("b", "node-1", 800, PodPhase::Running),
        ];
        let snapshot = Snapshot::new(Utc::now(), nodes, pods);
        assert_eq!(snapshot.node("node-1").unwrap().free(), Resources::default());
    }

    #[test]
    fn exemptions() {
        let mut pod = bound("a", "node-1", 100, PodPhase::Running);
        assert_eq!(pod.exemption(false), Some(Exemption::Unmanaged));
        assert_eq!(pod.exemption(true), None);

        pod.owner = Some(OwnerRef {
            kind: "ReplicaSet".into(),
            name: "web-5d8f".into(),
        });
        assert_eq!(pod.exemption(false), None);

        pod.owner = Some(OwnerRef {
            kind: "DaemonSet".into(),
            name: "fluentd".into(),
        });
        assert_eq!(pod.exemption(true), Some(Exemption::DaemonSet));

        pod.critical = true;
        assert_eq!(pod.exemption(true), Some(Exemption::Critical));
    }

    #[test]
    fn dominant_share_picks_the_larger_resource() {
        let capacity = Resources::new(1000, 1000);
        assert_eq!(Resources::new(100, 500).dominant_share(&capacity), 500_000);
        assert_eq!(Resources::new(0, 0).dominant_share(&Resources::default()), 0);
    }
}
