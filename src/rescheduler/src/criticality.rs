use crate::config::{CriticalPodSelector, LabelSelectorRequirement};
use crate::model::PodInfo;

use regex::Regex;
use tracing::warn;

/// Decides whether a pod is critical. The snapshot labels every pod with it,
/// so nothing downstream knows how criticality is defined.
pub trait CriticalityPredicate: Send + Sync {
    fn is_critical(&self, pod: &PodInfo) -> bool;
}

impl<F> CriticalityPredicate for F
where
    F: Fn(&PodInfo) -> bool + Send + Sync,
{
    fn is_critical(&self, pod: &PodInfo) -> bool {
        self(pod)
    }
}

/// `CriticalPodSelector` with its namespace patterns compiled.
pub struct CriticalPodMatcher {
    selector: CriticalPodSelector,
    namespace_patterns: Vec<Regex>,
}

impl CriticalPodMatcher {
    pub fn new(selector: CriticalPodSelector) -> Self {
        let namespace_patterns = selector
            .namespaces
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!("Skipping invalid regex for critical namespace: {}", err);
                    None
                }
            })
            .collect();
        Self {
            selector,
            namespace_patterns,
        }
    }
}

impl CriticalityPredicate for CriticalPodMatcher {
    fn is_critical(&self, pod: &PodInfo) -> bool {
        let selector = &self.selector;
        if selector.is_empty() {
            return false;
        }

        if !selector.namespaces.is_empty()
            && !self
                .namespace_patterns
                .iter()
                .any(|re| re.is_match(&pod.id.namespace))
        {
            return false;
        }

        if !selector
            .match_labels
            .iter()
            .all(|(key, value)| pod.labels.get(key) == Some(value))
        {
            return false;
        }

        if !selector
            .match_expressions
            .iter()
            .all(|expr: &LabelSelectorRequirement| expr.matches(&pod.labels))
        {
            return false;
        }

        if let Some(annotation) = &selector.annotation {
            if !pod.annotations.contains_key(annotation) {
                return false;
            }
        }

        if !selector.priority_classes.is_empty() {
            let Some(class) = &pod.priority_class else {
                return false;
            };
            if !selector.priority_classes.contains(class) {
                return false;
            }
        }

        true
    }
}
