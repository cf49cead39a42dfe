use crate::model::{PodInfo, PodPhase, Snapshot, StarvedPod};

use std::time::Duration;
use tracing::debug;

/// Finds critical pods that the primary scheduler cannot place.
///
/// Stateless: every call looks at the given snapshot only.
#[derive(Clone, Debug)]
pub struct StarvationDetector {
    pending_grace: chrono::Duration,
}

impl StarvationDetector {
    pub fn new(pending_grace: Duration) -> Self {
        Self {
            pending_grace: chrono::Duration::from_std(pending_grace).unwrap_or_else(|_| chrono::Duration::max_value()),
        }
    }

    /// Starved critical pods, longest waiting first. Ties are broken by pod id.
    pub fn detect(&self, snapshot: &Snapshot) -> Vec<StarvedPod> {
        let now = snapshot.taken_at();
        let mut starved: Vec<StarvedPod> = snapshot
            .pods()
            .iter()
            .filter(|pod| self.is_starved(pod, snapshot))
            .map(|pod| StarvedPod {
                pod: pod.clone(),
                pending_for: pod.pending_for(now),
            })
            .collect();
        starved.sort_by(|a, b| {
            b.pending_for
                .cmp(&a.pending_for)
                .then_with(|| a.pod.id.cmp(&b.pod.id))
        });
        starved
    }

    fn is_starved(&self, pod: &PodInfo, snapshot: &Snapshot) -> bool {
        if !pod.critical || pod.is_bound() || pod.terminating {
            return false;
        }
        let waiting = match pod.phase {
            PodPhase::Unschedulable => true,
            PodPhase::Pending => pod.pending_for(snapshot.taken_at()) >= self.pending_grace,
            _ => false,
        };
        if !waiting {
            return false;
        }

        // Not enough room in aggregate implies no single node fits either.
        if !pod.requests.fits_within(&snapshot.total_free()) {
            return true;
        }
        let fits_somewhere = snapshot
            .nodes()
            .iter()
            .filter(|node| node.can_host(pod))
            .any(|node| pod.requests.fits_within(&node.free()));
        if fits_somewhere {
            debug!("Skipping {}: a node already has room, scheduler has not caught up", pod.id);
        }
        !fits_somewhere
    }
}
