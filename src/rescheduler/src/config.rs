use controller_core::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_ENV_PREFIX: &str = "RESCHEDULER";
pub const CRITICAL_POD_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/critical-pod";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub enum RequirementOperator {
    #[serde(rename = "in", alias = "In")]
    In,
    #[serde(rename = "notin", alias = "NotIn", alias = "notIn")]
    NotIn,
    #[serde(rename = "exists", alias = "Exists")]
    Exists,
    #[serde(rename = "doesnotexist", alias = "DoesNotExist", alias = "doesNotExist")]
    DoesNotExist,
}

/// LabelSelectorRequirement relates a label key to a set of values through an operator.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: RequirementOperator,
    pub values: Option<Vec<String>>,
}

impl LabelSelectorRequirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        let listed = |v: &String| {
            self.values
                .as_ref()
                .is_some_and(|values| values.iter().any(|candidate| candidate == v))
        };
        match self.operator {
            RequirementOperator::Exists => value.is_some(),
            RequirementOperator::DoesNotExist => value.is_none(),
            RequirementOperator::In => value.is_some_and(listed),
            RequirementOperator::NotIn => !value.is_some_and(listed),
        }
    }
}

/// Which pods count as critical.
///
/// Every configured clause must hold. A selector without any clause matches nothing.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CriticalPodSelector {
    /// Namespace name regex patterns, ORed.
    pub namespaces: Vec<String>,
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<LabelSelectorRequirement>,
    /// Annotation key that must be present.
    pub annotation: Option<String>,
    /// Priority class names, ORed.
    pub priority_classes: Vec<String>,
}

impl Default for CriticalPodSelector {
    fn default() -> Self {
        Self {
            namespaces: vec!["^kube-system$".to_string()],
            match_labels: BTreeMap::new(),
            match_expressions: Vec::new(),
            annotation: Some(CRITICAL_POD_ANNOTATION.to_string()),
            priority_classes: Vec::new(),
        }
    }
}

impl CriticalPodSelector {
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
            && self.match_labels.is_empty()
            && self.match_expressions.is_empty()
            && self.annotation.is_none()
            && self.priority_classes.is_empty()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReschedulerConfig {
    pub poll_interval_secs: u64,
    pub episode_timeout_secs: u64,
    pub eviction_timeout_secs: u64,
    pub pending_grace_secs: u64,
    pub reissue_after_secs: u64,
    pub dry_run: bool,
    pub taint_target_node: bool,
    pub evict_unmanaged_pods: bool,
    pub critical_pods: CriticalPodSelector,
    pub reporter: String,
}

impl Default for ReschedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            episode_timeout_secs: 300,
            eviction_timeout_secs: 120,
            pending_grace_secs: 60,
            reissue_after_secs: 300,
            dry_run: false,
            taint_target_node: true,
            evict_unmanaged_pods: false,
            critical_pods: CriticalPodSelector::default(),
            reporter: "rescheduler".to_string(),
        }
    }
}

impl ReschedulerConfig {
    /// Load from an optional YAML file, then `RESCHEDULER_*` environment variables
    /// (`RESCHEDULER_DRY_RUN=true`, `RESCHEDULER_CRITICAL_PODS__ANNOTATION=...`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let config: ReschedulerConfig = config
            .try_deserialize()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::ConfigError("poll_interval_secs must be positive".into()));
        }
        if self.eviction_timeout_secs == 0 || self.episode_timeout_secs == 0 {
            return Err(Error::ConfigError("timeouts must be positive".into()));
        }
        if self.critical_pods.is_empty() {
            return Err(Error::ConfigError(
                "critical_pods selects nothing; configure at least one clause".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn episode_timeout(&self) -> Duration {
        Duration::from_secs(self.episode_timeout_secs)
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs(self.eviction_timeout_secs)
    }

    pub fn pending_grace(&self) -> Duration {
        Duration::from_secs(self.pending_grace_secs)
    }

    pub fn reissue_after(&self) -> Duration {
        Duration::from_secs(self.reissue_after_secs)
    }
}
