use crate::clock::{deadline, Clock, SystemClock};
use crate::cluster::{watch_pod_phase, ClusterEvent, ClusterState, KubeClusterState, NodeTaint, CRITICAL_ADDONS_ONLY_TAINT};
use crate::config::ReschedulerConfig;
use crate::criticality::{CriticalPodMatcher, CriticalityPredicate};
use crate::detector::StarvationDetector;
use crate::executor::{Evictor, InFlight};
use crate::model::{EvictionDecision, PodId, PodPhase, Snapshot, StarvedPod};
use crate::snapshot;
use crate::victims::{Exclusions, Selection, VictimPlan, VictimSelector};

use controller_core::{telemetry, Error, Metrics, Result};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use itertools::Itertools;
use kube::client::Client;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::*;

/// Where the control loop currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LoopPhase {
    Idle,
    Sampling,
    Detecting,
    Resolving,
    Evicting,
    Stopped,
}

/// What one tick saw and did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub starved: Vec<PodId>,
    pub evicted: Vec<PodId>,
    /// Dry run victims.
    pub planned: Vec<PodId>,
    pub infeasible: Vec<PodId>,
    /// Starved pods that in-flight evictions already make room for.
    pub awaiting: Vec<PodId>,
    /// Starved pods that reached Running within their episode.
    pub placed: Vec<PodId>,
    pub timed_out: Vec<String>,
    pub errors: Vec<String>,
}

enum Placement {
    Running,
    Gone,
    TimedOut,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Debug, Serialize)]
pub struct Diagnostics {
    pub last_tick: DateTime<Utc>,
    pub phase: LoopPhase,
    pub last_report: Option<TickReport>,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_tick: Utc::now(),
            phase: LoopPhase::Idle,
            last_report: None,
        }
    }
}

/// State shared between the control loop and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the control loop
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the control loop outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Create a control loop that reports into this State
    pub fn to_rescheduler(
        &self,
        cluster: Arc<dyn ClusterState>,
        predicate: Arc<dyn CriticalityPredicate>,
        clock: Arc<dyn Clock>,
        config: ReschedulerConfig,
    ) -> Result<Rescheduler> {
        let metrics = Metrics::default()
            .register(&self.registry)
            .map_err(|e| Error::TelemetryError(e.to_string()))?;
        let evictor = Evictor::new(cluster.clone(), clock.clone(), Arc::new(InFlight::default()))
            .with_timeouts(config.eviction_timeout(), config.poll_interval())
            .with_dry_run(config.dry_run)
            .with_metrics(metrics.clone());
        Ok(Rescheduler {
            detector: StarvationDetector::new(config.pending_grace()),
            selector: VictimSelector::new(config.evict_unmanaged_pods),
            evictor,
            cluster,
            predicate,
            clock,
            config,
            metrics,
            diagnostics: self.diagnostics.clone(),
        })
    }
}

/// The control loop: snapshot, detect, select, evict, once per poll interval.
pub struct Rescheduler {
    cluster: Arc<dyn ClusterState>,
    predicate: Arc<dyn CriticalityPredicate>,
    clock: Arc<dyn Clock>,
    config: ReschedulerConfig,
    detector: StarvationDetector,
    selector: VictimSelector,
    evictor: Evictor,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl Rescheduler {
    /// Tick every poll interval until `shutdown` flips to true (or its sender goes away).
    ///
    /// The signal is only checked between ticks, so evictions already issued are always
    /// seen through.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting rescheduler, polling every {:?}{}",
            self.config.poll_interval(),
            if self.config.dry_run { " (dry run)" } else { "" }
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;
            tokio::select! {
                _ = self.clock.sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.set_phase(LoopPhase::Stopped).await;
        info!("Rescheduler stopped");
    }

    /// One independent pass. Failures are logged, counted and reported, never returned.
    #[instrument(skip(self), fields(trace_id))]
    pub async fn tick(&self) -> TickReport {
        let trace_id = telemetry::get_trace_id();
        Span::current().record("trace_id", &field::display(&trace_id));
        let _timer = self.metrics.count_and_measure();

        let mut report = TickReport::default();
        if let Err(err) = self.pass(&mut report).await {
            warn!("Tick failed: {}", err);
            self.metrics.tick_failure(&err);
            report.errors.push(err.to_string());
        }

        let mut diagnostics = self.diagnostics.write().await;
        diagnostics.last_tick = self.clock.now();
        diagnostics.phase = LoopPhase::Idle;
        diagnostics.last_report = Some(report.clone());
        report
    }

    async fn sample(&self) -> Result<Snapshot> {
        self.set_phase(LoopPhase::Sampling).await;
        let snapshot = snapshot::capture(self.cluster.as_ref(), self.predicate.as_ref(), self.clock.as_ref()).await?;
        self.evictor
            .in_flight()
            .refresh(&snapshot, self.config.reissue_after())
            .await;
        Ok(snapshot)
    }

    /// Remediate the starved pods of this tick, longest waiting first.
    ///
    /// Evictions change the cluster, so after every episode that deleted something the
    /// remaining pods are re-detected against a fresh snapshot. Pods that got placed in the
    /// meantime are dropped.
    async fn pass(&self, report: &mut TickReport) -> Result<()> {
        let mut snapshot = self.sample().await?;

        self.set_phase(LoopPhase::Detecting).await;
        let mut starved = self.detector.detect(&snapshot);
        self.metrics.starved_pods.set(starved.len() as i64);
        report.starved = starved.iter().map(|s| s.pod.id.clone()).collect();
        if starved.is_empty() {
            return Ok(());
        }
        info!("Found {} starved critical pod(s)", starved.len());

        let mut handled: HashSet<PodId> = HashSet::new();
        // Nodes whose in-flight evictions are already spoken for.
        let mut awaited_nodes: HashSet<String> = HashSet::new();
        loop {
            let mut exclusions = Exclusions {
                in_flight: self.evictor.in_flight().ids().await,
                reserved_nodes: awaited_nodes.clone(),
            };
            let mut cluster_changed = false;
            for pod in &starved {
                if !handled.insert(pod.pod.id.clone()) {
                    continue;
                }
                cluster_changed = self.resolve(pod, &snapshot, &mut exclusions, &mut awaited_nodes, report).await;
                if cluster_changed {
                    break;
                }
            }
            if !cluster_changed {
                return Ok(());
            }

            snapshot = self.sample().await?;
            self.set_phase(LoopPhase::Detecting).await;
            starved = self
                .detector
                .detect(&snapshot)
                .into_iter()
                .filter(|s| report.starved.contains(&s.pod.id) && !handled.contains(&s.pod.id))
                .collect();
            if starved.is_empty() {
                return Ok(());
            }
        }
    }

    /// Select and act for one starved pod. True when evictions were issued.
    async fn resolve(
        &self,
        pod: &StarvedPod,
        snapshot: &Snapshot,
        exclusions: &mut Exclusions,
        awaited_nodes: &mut HashSet<String>,
        report: &mut TickReport,
    ) -> bool {
        self.set_phase(LoopPhase::Resolving).await;
        match self.selector.select_excluding(pod, snapshot, exclusions) {
            Selection::Infeasible => {
                warn!("No victims can make room for {} requesting {}", pod.pod.id, pod.pod.requests);
                self.metrics.infeasible.inc();
                self.publish(
                    &pod.pod.id,
                    ClusterEvent::warning(
                        "RemediationInfeasible",
                        "Rescheduling",
                        format!("No node can be freed enough for {}", pod.pod.requests),
                    ),
                )
                .await;
                report.infeasible.push(pod.pod.id.clone());
                false
            }
            Selection::Satisfied { node } => {
                info!("Waiting for in-flight evictions on {} to make room for {}", node, pod.pod.id);
                awaited_nodes.insert(node.clone());
                exclusions.reserved_nodes.insert(node);
                report.awaiting.push(pod.pod.id.clone());
                false
            }
            Selection::Victims(plan) => {
                exclusions.reserved_nodes.insert(plan.node.clone());
                exclusions
                    .in_flight
                    .extend(plan.victims.iter().map(|v| v.id.clone()));
                self.remediate(pod, plan, report).await;
                !self.config.dry_run
            }
        }
    }

    /// One remediation episode: reserve the node, evict the plan, wait for the pod to run.
    async fn remediate(&self, starved: &StarvedPod, plan: VictimPlan, report: &mut TickReport) {
        let pod = &starved.pod.id;
        let episode_end = deadline(self.clock.as_ref(), self.config.episode_timeout());
        let victims = plan.victims.iter().map(|v| v.id.to_string()).join(", ");
        info!(pod = %pod, node = %plan.node, victims = %victims, "Remediating starved pod");
        self.publish(
            pod,
            ClusterEvent::normal(
                "RemediationStarted",
                "Rescheduling",
                format!("Evicting {} from {}", victims, plan.node),
            ),
        )
        .await;

        let tainted = self.config.taint_target_node && !self.config.dry_run && self.reserve(&plan.node).await;

        self.set_phase(LoopPhase::Evicting).await;
        let now = self.clock.now();
        let decisions: Vec<EvictionDecision> = plan
            .victims
            .iter()
            .map(|victim| EvictionDecision {
                victim: victim.clone(),
                node: plan.node.clone(),
                starved: pod.clone(),
                reason: format!("{} needs {} on {}", pod, starved.pod.requests, plan.node),
                decided_at: now,
            })
            .collect();

        match self.evictor.execute(&decisions).await {
            Ok(eviction) => {
                let errors = eviction.errors(self.evictor.confirm_timeout());
                report.evicted.extend(eviction.evicted);
                report.planned.extend(eviction.planned);
                report.timed_out.extend(eviction.timed_out.iter().map(PodId::to_string));
                for err in &errors {
                    warn!("Remediation of {} failed: {}", pod, err);
                    self.metrics.tick_failure(err);
                    report.errors.push(err.to_string());
                }
                if errors.is_empty() && !self.config.dry_run {
                    self.finish_episode(pod, episode_end, report).await;
                }
            }
            Err(err) => {
                if let Error::InvariantViolation(reason) = &err {
                    error!("Aborting remediation of {}: {}", pod, reason);
                    self.publish(
                        pod,
                        ClusterEvent::warning("InvariantViolation", "Rescheduling", reason.clone()),
                    )
                    .await;
                }
                warn!("Remediation of {} failed: {}", pod, err);
                self.metrics.tick_failure(&err);
                report.errors.push(err.to_string());
            }
        }

        if tainted {
            if let Err(err) = self.cluster.untaint_node(&plan.node, CRITICAL_ADDONS_ONLY_TAINT).await {
                warn!("Failed to remove reservation taint from {}: {}", plan.node, err);
            }
        }
    }

    async fn reserve(&self, node: &str) -> bool {
        match self
            .cluster
            .taint_node(node, &NodeTaint::critical_addons_only(&self.config.reporter))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to reserve {} for critical pods: {}", node, err);
                false
            }
        }
    }

    async fn finish_episode(&self, pod: &PodId, episode_end: DateTime<Utc>, report: &mut TickReport) {
        match self.await_placement(pod, episode_end).await {
            Placement::Running => {
                info!("Critical pod {} is running", pod);
                self.publish(
                    pod,
                    ClusterEvent::normal("RemediationSucceeded", "Rescheduling", "Critical pod is running".into()),
                )
                .await;
                report.placed.push(pod.clone());
            }
            Placement::Gone => info!("Skipping {}: no longer exists", pod),
            Placement::TimedOut => {
                warn!("Critical pod {} still not running after {:?}", pod, self.config.episode_timeout());
                self.publish(
                    pod,
                    ClusterEvent::warning(
                        "RemediationTimedOut",
                        "Rescheduling",
                        format!("Not running {:?} after evictions", self.config.episode_timeout()),
                    ),
                )
                .await;
            }
        }
    }

    async fn await_placement(&self, pod: &PodId, until: DateTime<Utc>) -> Placement {
        let mut phases = watch_pod_phase(
            self.cluster.clone(),
            self.clock.clone(),
            pod.clone(),
            self.config.poll_interval(),
        );
        while let Some(observation) = phases.next().await {
            match observation {
                Ok(Some(PodPhase::Running)) => return Placement::Running,
                Ok(None) | Ok(Some(PodPhase::Succeeded | PodPhase::Failed)) => return Placement::Gone,
                Ok(Some(_)) => {}
                Err(err) => warn!("Polling phase of {}: {}", pod, err),
            }
            if self.clock.now() >= until {
                break;
            }
        }
        Placement::TimedOut
    }

    async fn publish(&self, pod: &PodId, event: ClusterEvent) {
        if let Err(err) = self.cluster.record_event(pod, &event).await {
            warn!("Failed to record {} event on {}: {}", event.reason, pod, err);
        }
    }

    async fn set_phase(&self, phase: LoopPhase) {
        self.diagnostics.write().await.phase = phase;
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM, only SIGINT stops the loop: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Flip `shutdown` once `signal` resolves. The loop then stops before its next tick.
pub fn stop_on<F>(signal: F, shutdown: watch::Sender<bool>) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        signal.await;
        info!("Shutdown requested, finishing the current tick");
        let _ = shutdown.send(true);
    })
}

/// Build the control loop against the current kube context and run it until shutdown
pub async fn run(state: State, config: ReschedulerConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let client = Client::try_default().await.map_err(Error::KubeError)?;
    run_with_client(client, state, config, shutdown).await
}

/// Like `run`, with an existing client. Fails before the first tick if nodes cannot be listed.
pub async fn run_with_client(
    client: Client,
    state: State,
    config: ReschedulerConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let cluster = Arc::new(KubeClusterState::new(client, &config.reporter));
    if let Err(e) = cluster.list_nodes().await {
        error!("Nodes are not listable; {e:?}. Does the service account have RBAC for nodes and pods?");
        return Err(Error::FetchError(e.to_string()));
    }

    let predicate = Arc::new(CriticalPodMatcher::new(config.critical_pods.clone()));
    let rescheduler = state.to_rescheduler(cluster, predicate, Arc::new(SystemClock), config)?;
    rescheduler.run(shutdown).await;
    Ok(())
}
