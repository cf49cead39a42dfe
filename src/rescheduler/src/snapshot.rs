use crate::clock::Clock;
use crate::cluster::{ClusterState, PodFilter};
use crate::criticality::CriticalityPredicate;
use crate::model::Snapshot;
use controller_core::{Error, Result};

use tracing::debug;

/// Read the whole cluster once and label every pod with `predicate`.
///
/// Objects the provider could not convert are already dropped, so a partial listing still
/// yields a (possibly stale) snapshot. Only a failed listing is an error.
pub async fn capture(
    cluster: &dyn ClusterState,
    predicate: &dyn CriticalityPredicate,
    clock: &dyn Clock,
) -> Result<Snapshot> {
    let nodes = cluster
        .list_nodes()
        .await
        .map_err(|err| Error::FetchError(format!("listing nodes: {err}")))?;
    let mut pods = cluster
        .list_pods(&PodFilter::active())
        .await
        .map_err(|err| Error::FetchError(format!("listing pods: {err}")))?;

    for pod in &mut pods {
        pod.critical = predicate.is_critical(pod);
    }

    let snapshot = Snapshot::new(clock.now(), nodes, pods);
    debug!(
        nodes = snapshot.nodes().len(),
        pods = snapshot.pods().len(),
        "Captured cluster snapshot"
    );
    Ok(snapshot)
}
