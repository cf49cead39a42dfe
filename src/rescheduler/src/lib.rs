pub mod clock;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod criticality;
pub mod detector;
pub mod executor;
pub mod model;
pub mod quantity;
pub mod snapshot;
pub mod victims;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{ClusterState, KubeClusterState, PodFilter};
pub use config::{CriticalPodSelector, ReschedulerConfig};
pub use controller::*;
pub use criticality::{CriticalPodMatcher, CriticalityPredicate};
pub use detector::StarvationDetector;
pub use executor::{EvictionReport, Evictor, InFlight};
pub use model::{EvictionDecision, NodeInfo, PodId, PodInfo, Resources, Snapshot, StarvedPod};
pub use snapshot::capture;
pub use victims::{Exclusions, Selection, VictimPlan, VictimSelector};

#[cfg(test)]
pub mod fixtures;
