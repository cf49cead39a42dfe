use crate::model::{NodeInfo, PodId, PodInfo, Resources, Snapshot, StarvedPod};

use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

/// Victims on one node whose eviction frees enough room for the starved pod.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct VictimPlan {
    pub node: String,
    pub victims: Vec<PodInfo>,
}

impl VictimPlan {
    pub fn freed(&self) -> Resources {
        self.victims.iter().map(|v| v.requests).sum()
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Selection {
    Victims(VictimPlan),
    /// Evictions already in flight free enough on `node`; nothing new to evict.
    Satisfied { node: String },
    /// No combination of evictable pods frees enough on any single node.
    Infeasible,
}

/// What the selector must leave alone besides the snapshot's exemptions.
#[derive(Clone, Debug, Default)]
pub struct Exclusions {
    /// Pods whose eviction is issued but not confirmed. Their requests count as freed.
    pub in_flight: HashSet<PodId>,
    /// Nodes already promised to another starved pod in this tick.
    pub reserved_nodes: HashSet<String>,
}

#[derive(Clone, Debug, Default)]
pub struct VictimSelector {
    evict_unmanaged: bool,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct PlanCost<'a> {
    victims: usize,
    max_priority: i32,
    freed_share: u64,
    node: &'a str,
}

impl VictimSelector {
    pub fn new(evict_unmanaged: bool) -> Self {
        Self { evict_unmanaged }
    }

    pub fn select(&self, starved: &StarvedPod, snapshot: &Snapshot) -> Selection {
        self.select_excluding(starved, snapshot, &Exclusions::default())
    }

    /// Cheapest plan over all eligible nodes: fewest victims, then the lowest top victim
    /// priority, then the smallest freed share of the node, then node name.
    pub fn select_excluding(&self, starved: &StarvedPod, snapshot: &Snapshot, exclusions: &Exclusions) -> Selection {
        let need = starved.pod.requests;
        let mut best: Option<(PlanCost, Vec<&PodInfo>)> = None;

        for node in snapshot.nodes() {
            if !node.can_host(&starved.pod) || exclusions.reserved_nodes.contains(&node.name) {
                continue;
            }
            let releasing: Resources = snapshot
                .pods_on(&node.name)
                .filter(|p| exclusions.in_flight.contains(&p.id))
                .map(|p| p.requests)
                .sum();
            let base = node.free() + releasing;
            if need.fits_within(&base) {
                debug!(
                    "{} will fit on {} once in-flight evictions complete",
                    starved.pod.id, node.name
                );
                return Selection::Satisfied {
                    node: node.name.clone(),
                };
            }

            let Some(victims) = self.plan_for_node(node, snapshot, base, need, exclusions) else {
                continue;
            };
            let cost = PlanCost {
                victims: victims.len(),
                max_priority: victims.iter().map(|v| v.priority).max().unwrap_or(i32::MIN),
                freed_share: victims
                    .iter()
                    .map(|v| v.requests)
                    .sum::<Resources>()
                    .dominant_share(&node.allocatable),
                node: &node.name,
            };
            if best.as_ref().map_or(true, |(current, _)| cost < *current) {
                best = Some((cost, victims));
            }
        }

        match best {
            Some((cost, victims)) => Selection::Victims(VictimPlan {
                node: cost.node.to_string(),
                victims: victims.into_iter().cloned().collect(),
            }),
            None => Selection::Infeasible,
        }
    }

    /// Greedy pick in eviction order, then drop every victim the rest can do without.
    fn plan_for_node<'a>(
        &self,
        node: &'a NodeInfo,
        snapshot: &'a Snapshot,
        base: Resources,
        need: Resources,
        exclusions: &Exclusions,
    ) -> Option<Vec<&'a PodInfo>> {
        let mut candidates: Vec<&PodInfo> = snapshot
            .pods_on(&node.name)
            .filter(|p| p.exemption(self.evict_unmanaged).is_none())
            .filter(|p| !exclusions.in_flight.contains(&p.id))
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| {
                    b.requests
                        .dominant_share(&node.allocatable)
                        .cmp(&a.requests.dominant_share(&node.allocatable))
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut freed = base;
        let mut chosen = Vec::new();
        for candidate in candidates {
            if need.fits_within(&freed) {
                break;
            }
            freed += candidate.requests;
            chosen.push(candidate);
        }
        if !need.fits_within(&freed) {
            return None;
        }

        let mut index = chosen.len();
        while index > 0 {
            index -= 1;
            let without = freed.saturating_sub(&chosen[index].requests);
            if need.fits_within(&without) {
                freed = without;
                chosen.remove(index);
            }
        }
        Some(chosen)
    }
}
