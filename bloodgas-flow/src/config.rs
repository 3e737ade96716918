use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{
    error::{FlowError, Result},
    extraction::QualityThresholds,
    progress::PhaseWeights,
    providers::RetryPolicy,
    workflow::CanonicalProgress,
};

/// Tunables for one pipeline instance.
///
/// Every field has a default, so a YAML file only needs the keys it overrides:
///
/// ```yaml
/// quality:
///   escalate_below: 0.55
/// persistence:
///   max_snapshots: 10
/// action_plans_enabled: false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub quality: QualityThresholds,
    pub canonical_progress: CanonicalProgress,
    pub phase_weights: PhaseWeights,
    pub retry: RetryPolicy,
    pub persistence: PersistenceConfig,
    #[serde(with = "secs")]
    pub interpretation_timeout: Duration,
    #[serde(with = "secs")]
    pub vision_timeout: Duration,
    #[serde(with = "secs")]
    pub action_plan_timeout: Duration,
    pub action_plans_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality: QualityThresholds::default(),
            canonical_progress: CanonicalProgress::default(),
            phase_weights: PhaseWeights::default(),
            retry: RetryPolicy::default(),
            persistence: PersistenceConfig::default(),
            interpretation_timeout: Duration::from_secs(120),
            vision_timeout: Duration::from_secs(90),
            action_plan_timeout: Duration::from_secs(120),
            action_plans_enabled: true,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FlowError::Config(e.to_string()))
    }

    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Snapshots with another version are discarded on load.
    pub schema_version: u32,
    #[serde(with = "secs")]
    pub retention: Duration,
    pub max_snapshots: usize,
    #[serde(with = "millis")]
    pub debounce: Duration,
    /// How long a finished or discarded session keeps refusing saves.
    #[serde(with = "secs")]
    pub tombstone_ttl: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            max_snapshots: 5,
            debounce: Duration::from_millis(1000),
            tombstone_ttl: Duration::from_secs(60 * 60),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = PipelineConfig::default();
        assert_eq!(config.persistence.max_snapshots, 5);
        assert_eq!(config.persistence.retention, Duration::from_secs(604_800));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.interpretation_timeout, Duration::from_secs(120));
        assert_eq!(config.canonical_progress.interpretation, 90);
    }

    #[test]
    fn yaml_overrides_only_given_keys() {
        let config = PipelineConfig::from_yaml_str(
            "persistence:\n  max_snapshots: 9\n  debounce: 250\naction_plans_enabled: false\n",
        )
        .unwrap();
        assert_eq!(config.persistence.max_snapshots, 9);
        assert_eq!(config.persistence.debounce, Duration::from_millis(250));
        assert_eq!(config.persistence.schema_version, 1);
        assert!(!config.action_plans_enabled);
        assert_eq!(config.quality, QualityThresholds::default());
    }

    #[test]
    fn bad_yaml_is_a_config_error() {
        let err = PipelineConfig::from_yaml_str("persistence: [1, 2").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }
}
