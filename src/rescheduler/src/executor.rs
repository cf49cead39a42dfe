use crate::clock::{deadline, Clock};
use crate::cluster::{watch_pod_phase, ClusterEvent, ClusterState, DeleteOutcome};
use crate::model::{EvictionDecision, PodId, Snapshot};
use controller_core::{Error, Metrics, Result};

use chrono::{DateTime, Utc};
use futures::{future::join_all, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct InFlightEviction {
    pub node: String,
    pub issued_at: DateTime<Utc>,
}

/// Evictions issued but not yet confirmed, keyed by pod incarnation.
///
/// The only state kept across ticks. Used to avoid deleting the same pod twice.
#[derive(Debug, Default)]
pub struct InFlight {
    entries: Mutex<HashMap<PodId, InFlightEviction>>,
}

impl InFlight {
    pub async fn ids(&self) -> HashSet<PodId> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn contains(&self, pod: &PodId) -> bool {
        self.entries.lock().await.contains_key(pod)
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn insert(&self, pod: PodId, eviction: InFlightEviction) {
        self.entries.lock().await.insert(pod, eviction);
    }

    async fn remove(&self, pod: &PodId) {
        self.entries.lock().await.remove(pod);
    }

    /// Drop entries the snapshot shows resolved (pod gone or finished) and entries older
    /// than `reissue_after`, which makes those pods eligible for a new delete.
    pub async fn refresh(&self, snapshot: &Snapshot, reissue_after: Duration) {
        let reissue_after = chrono::Duration::from_std(reissue_after).unwrap_or_else(|_| chrono::Duration::max_value());
        let now = snapshot.taken_at();
        self.entries.lock().await.retain(|pod, eviction| {
            let present = snapshot.pod(pod).is_some_and(|p| p.consumes_capacity());
            if !present {
                info!("Eviction of {} confirmed", pod);
                return false;
            }
            if now - eviction.issued_at >= reissue_after {
                warn!(
                    "Eviction of {} on {} unconfirmed since {}, may be reissued",
                    pod, eviction.node, eviction.issued_at
                );
                return false;
            }
            true
        });
    }
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    /// Deleted and confirmed gone.
    pub evicted: Vec<PodId>,
    /// Already gone or finished; no request was sent.
    pub already_gone: Vec<PodId>,
    /// An earlier eviction of this pod is still in flight.
    pub skipped: Vec<PodId>,
    /// Would have been deleted, dry run.
    pub planned: Vec<PodId>,
    /// Deleted but still present at the confirmation deadline. Kept in flight.
    pub timed_out: Vec<PodId>,
    /// Delete requests the API server rejected, with the reason.
    pub failed: Vec<(PodId, String)>,
}

impl EvictionReport {
    /// One `EvictionTimeout` covering every unconfirmed pod, then one `EvictionFailed` per
    /// rejected request.
    pub fn errors(&self, confirm_timeout: Duration) -> Vec<Error> {
        let mut errors = Vec::new();
        if !self.timed_out.is_empty() {
            errors.push(Error::EvictionTimeout {
                pods: self.timed_out.iter().map(PodId::to_string).collect(),
                timeout: confirm_timeout,
            });
        }
        errors.extend(self.failed.iter().map(|(pod, reason)| Error::EvictionFailed {
            pod: pod.to_string(),
            reason: reason.clone(),
        }));
        errors
    }
}

enum Outcome {
    Evicted(PodId),
    AlreadyGone(PodId),
    TimedOut(PodId),
    Failed(PodId, String),
}

/// Deletes victims and waits for them to go away.
pub struct Evictor {
    cluster: Arc<dyn ClusterState>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<InFlight>,
    metrics: Option<Metrics>,
    confirm_timeout: Duration,
    poll_interval: Duration,
    dry_run: bool,
}

impl Evictor {
    pub fn new(cluster: Arc<dyn ClusterState>, clock: Arc<dyn Clock>, in_flight: Arc<InFlight>) -> Self {
        Self {
            cluster,
            clock,
            in_flight,
            metrics: None,
            confirm_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(10),
            dry_run: false,
        }
    }

    pub fn with_timeouts(mut self, confirm_timeout: Duration, poll_interval: Duration) -> Self {
        self.confirm_timeout = confirm_timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Evict every decided victim concurrently and wait for each to be confirmed.
    ///
    /// Nothing is deleted if any victim is critical. A pod that is already gone is not an
    /// error and gets no request. Unconfirmed deletions stay in flight and surface as
    /// `EvictionTimeout`; failed requests as `EvictionFailed`.
    pub async fn evict(&self, decisions: &[EvictionDecision]) -> Result<EvictionReport> {
        let report = self.execute(decisions).await?;
        match report.errors(self.confirm_timeout).into_iter().next() {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Like `evict`, but a partially failed batch still yields its report, with timeouts and
    /// failures recorded in it. Only a critical victim is an error here.
    pub async fn execute(&self, decisions: &[EvictionDecision]) -> Result<EvictionReport> {
        if let Some(decision) = decisions.iter().find(|d| d.victim.critical) {
            error!(
                victim = %decision.victim.id,
                starved = %decision.starved,
                "Refusing to evict critical pod"
            );
            self.count("refused");
            return Err(Error::InvariantViolation(format!(
                "critical pod {} selected as victim for {}",
                decision.victim.id, decision.starved
            )));
        }

        let mut report = EvictionReport::default();
        let mut pending = Vec::new();
        for decision in decisions {
            let pod = &decision.victim.id;
            if self.in_flight.contains(pod).await {
                info!("Skipping {}: eviction already in flight", pod);
                report.skipped.push(pod.clone());
            } else if self.dry_run {
                info!(
                    "Dry run: would evict {} from {} for {}: {}",
                    pod, decision.node, decision.starved, decision.reason
                );
                self.count("dry_run");
                report.planned.push(pod.clone());
            } else {
                pending.push(self.evict_one(decision));
            }
        }

        for outcome in join_all(pending).await {
            match outcome {
                Outcome::Evicted(pod) => report.evicted.push(pod),
                Outcome::AlreadyGone(pod) => report.already_gone.push(pod),
                Outcome::TimedOut(pod) => report.timed_out.push(pod),
                Outcome::Failed(pod, reason) => report.failed.push((pod, reason)),
            }
        }
        Ok(report)
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    async fn evict_one(&self, decision: &EvictionDecision) -> Outcome {
        let pod = decision.victim.id.clone();

        match self.cluster.pod_phase(&pod).await {
            Ok(Some(phase)) if phase.is_active() => {}
            Ok(_) => {
                info!("Skipping {}: already gone", pod);
                self.count("already_gone");
                return Outcome::AlreadyGone(pod);
            }
            Err(err) => {
                warn!("Could not read phase of {} before eviction: {}", pod, err);
            }
        }

        match self.cluster.delete_pod(&pod).await {
            Ok(DeleteOutcome::NotFound) => {
                self.count("already_gone");
                return Outcome::AlreadyGone(pod);
            }
            Ok(DeleteOutcome::Deleted) => {}
            Err(err) => {
                warn!("Failed to evict {}: {}", pod, err);
                self.count("failed");
                return Outcome::Failed(pod, err.to_string());
            }
        }

        let issued_at = self.clock.now();
        self.in_flight
            .insert(
                pod.clone(),
                InFlightEviction {
                    node: decision.node.clone(),
                    issued_at,
                },
            )
            .await;
        info!(
            victim = %pod,
            node = %decision.node,
            starved = %decision.starved,
            "Evicted {}: {}",
            pod,
            decision.reason
        );
        self.publish(
            &pod,
            ClusterEvent::normal(
                "Evicted",
                "Evicting",
                format!("Evicted to make room for critical pod {}: {}", decision.starved, decision.reason),
            ),
        )
        .await;

        if self.confirm_removal(&pod).await {
            self.in_flight.remove(&pod).await;
            self.count("evicted");
            Outcome::Evicted(pod)
        } else {
            warn!("Eviction of {} not confirmed within {:?}", pod, self.confirm_timeout);
            self.count("timeout");
            self.publish(
                &pod,
                ClusterEvent::warning(
                    "EvictionTimeout",
                    "Evicting",
                    format!("Pod still running {:?} after deletion", self.confirm_timeout),
                ),
            )
            .await;
            Outcome::TimedOut(pod)
        }
    }

    /// Poll until the pod leaves its active phases or the timeout passes.
    async fn confirm_removal(&self, pod: &PodId) -> bool {
        let until = deadline(self.clock.as_ref(), self.confirm_timeout);
        let mut phases = watch_pod_phase(self.cluster.clone(), self.clock.clone(), pod.clone(), self.poll_interval);
        while let Some(observation) = phases.next().await {
            match observation {
                Ok(None) => return true,
                Ok(Some(phase)) if !phase.is_active() => return true,
                Ok(Some(_)) => {}
                Err(err) => warn!("Polling phase of {}: {}", pod, err),
            }
            if self.clock.now() >= until {
                return false;
            }
        }
        false
    }

    async fn publish(&self, pod: &PodId, event: ClusterEvent) {
        if let Err(err) = self.cluster.record_event(pod, &event).await {
            warn!("Failed to record {} event on {}: {}", event.reason, pod, err);
        }
    }

    fn count(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.eviction(outcome);
        }
    }
}
