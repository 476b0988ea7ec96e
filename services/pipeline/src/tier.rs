//! Size tiers and the routing table.
//!
//! Every event is classified into exactly one [`Tier`] by its file size. The
//! [`RoutingTable`] is built once at process start from [`RoutingConfig`],
//! validated, and shared read-only by the router, the stream manager and the
//! workers.

use crate::config::{
    ConfigError, IngestionConfig, RoutingConfig, ScalingPolicy, TierConfig, WorkerTuning,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Size class of a storage event. Ordered `Small < Medium < Large`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Small, Tier::Medium, Tier::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "small" => Ok(Tier::Small),
            "medium" => Ok(Tier::Medium),
            "large" => Ok(Tier::Large),
            other => Err(ConfigError::invalid("tier", format!("unknown tier '{}'", other))),
        }
    }
}

/// The two ordered size boundaries. Boundary values belong to the lower tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    pub small_max: u64,
    pub medium_max: u64,
}

impl TierThresholds {
    pub fn new(small_max: u64, medium_max: u64) -> Result<Self, ConfigError> {
        if small_max >= medium_max {
            return Err(ConfigError::invalid(
                "routing.small_max_bytes",
                format!(
                    "must be lower than routing.medium_max_bytes ({} >= {})",
                    small_max, medium_max
                ),
            ));
        }
        Ok(Self {
            small_max,
            medium_max,
        })
    }

    pub fn classify(&self, file_size: u64) -> Tier {
        if file_size <= self.small_max {
            Tier::Small
        } else if file_size <= self.medium_max {
            Tier::Medium
        } else {
            Tier::Large
        }
    }
}

/// Immutable per-tier lookups
#[derive(Debug, Clone)]
pub struct RoutingTable {
    thresholds: TierThresholds,
    ingestion: IngestionConfig,
    small: TierConfig,
    medium: TierConfig,
    large: TierConfig,
}

impl RoutingTable {
    /// Validate the routing configuration and freeze it
    pub fn from_config(config: &RoutingConfig) -> Result<Self, ConfigError> {
        Self::validate(config)?;
        Ok(Self {
            thresholds: TierThresholds::new(config.small_max_bytes, config.medium_max_bytes)?,
            ingestion: config.ingestion.clone(),
            small: config.tiers.small.clone(),
            medium: config.tiers.medium.clone(),
            large: config.tiers.large.clone(),
        })
    }

    /// Check ordering, uniqueness and the monotonic tier policy
    pub fn validate(config: &RoutingConfig) -> Result<(), ConfigError> {
        TierThresholds::new(config.small_max_bytes, config.medium_max_bytes)?;
        validate_tuning("routing.ingestion.tuning", &config.ingestion.tuning)?;

        let mut subjects = HashSet::from([config.ingestion.subject.as_str()]);
        let mut streams = HashSet::from([config.ingestion.stream.as_str()]);
        let mut consumers = HashSet::from([config.ingestion.consumer.as_str()]);

        for tier in Tier::ALL {
            let entry = config.tiers.get(tier);
            let key = format!("routing.tiers.{}", tier);
            for (field, value) in [
                ("subject", &entry.subject),
                ("stream", &entry.stream),
                ("consumer", &entry.consumer),
            ] {
                if value.is_empty() {
                    return Err(ConfigError::MissingRequired(format!("{}.{}", key, field)));
                }
            }
            if !subjects.insert(entry.subject.as_str())
                || !streams.insert(entry.stream.as_str())
                || !consumers.insert(entry.consumer.as_str())
            {
                return Err(ConfigError::invalid(
                    key,
                    "subject, stream and consumer names must be unique",
                ));
            }
            validate_tuning(&format!("{}.worker", key), &entry.worker)?;
            if entry.scaling.min_replicas > entry.scaling.max_replicas {
                return Err(ConfigError::invalid(
                    format!("{}.scaling", key),
                    "min_replicas exceeds max_replicas",
                ));
            }
        }

        for pair in Tier::ALL.windows(2) {
            let (lower, upper) = (config.tiers.get(pair[0]), config.tiers.get(pair[1]));
            let key = format!("routing.tiers.{}", pair[1]);
            if upper.scaling.max_replicas > lower.scaling.max_replicas {
                return Err(ConfigError::invalid(
                    format!("{}.scaling.max_replicas", key),
                    format!("must not exceed the {} tier", pair[0]),
                ));
            }
            if upper.scaling.cooldown_period_secs < lower.scaling.cooldown_period_secs {
                return Err(ConfigError::invalid(
                    format!("{}.scaling.cooldown_period_secs", key),
                    format!("must not be lower than the {} tier", pair[0]),
                ));
            }
            if upper.worker.ack_wait_secs < lower.worker.ack_wait_secs {
                return Err(ConfigError::invalid(
                    format!("{}.worker.ack_wait_secs", key),
                    format!("must not be lower than the {} tier", pair[0]),
                ));
            }
            if upper.worker.batch_size > lower.worker.batch_size {
                return Err(ConfigError::invalid(
                    format!("{}.worker.batch_size", key),
                    format!("must not exceed the {} tier", pair[0]),
                ));
            }
        }

        Ok(())
    }

    pub fn thresholds(&self) -> TierThresholds {
        self.thresholds
    }

    pub fn classify(&self, file_size: u64) -> Tier {
        self.thresholds.classify(file_size)
    }

    pub fn ingestion(&self) -> &IngestionConfig {
        &self.ingestion
    }

    pub fn tier(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }

    pub fn subject(&self, tier: Tier) -> &str {
        &self.tier(tier).subject
    }

    pub fn stream(&self, tier: Tier) -> &str {
        &self.tier(tier).stream
    }

    pub fn consumer(&self, tier: Tier) -> &str {
        &self.tier(tier).consumer
    }

    pub fn worker_config(&self, tier: Tier) -> &WorkerTuning {
        &self.tier(tier).worker
    }

    pub fn scaling_config(&self, tier: Tier) -> &ScalingPolicy {
        &self.tier(tier).scaling
    }

    /// Reverse lookup used when a message arrives on a tier subject
    pub fn tier_for_subject(&self, subject: &str) -> Option<Tier> {
        Tier::ALL.into_iter().find(|t| self.subject(*t) == subject)
    }
}

fn validate_tuning(key: &str, tuning: &WorkerTuning) -> Result<(), ConfigError> {
    if tuning.batch_size == 0 {
        return Err(ConfigError::invalid(format!("{}.batch_size", key), "must be at least 1"));
    }
    if tuning.max_deliver < 1 {
        return Err(ConfigError::invalid(format!("{}.max_deliver", key), "must be at least 1"));
    }
    if tuning.max_ack_pending < 1 {
        return Err(ConfigError::invalid(
            format!("{}.max_ack_pending", key),
            "must be at least 1",
        ));
    }
    if tuning.ack_wait_secs == 0 {
        return Err(ConfigError::invalid(
            format!("{}.ack_wait_secs", key),
            "must be greater than zero",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        RoutingTable::from_config(&RoutingConfig::default()).unwrap()
    }

    #[test]
    fn test_classify_boundaries() {
        let thresholds = TierThresholds::new(100, 1000).unwrap();
        assert_eq!(thresholds.classify(0), Tier::Small);
        assert_eq!(thresholds.classify(100), Tier::Small);
        assert_eq!(thresholds.classify(101), Tier::Medium);
        assert_eq!(thresholds.classify(1000), Tier::Medium);
        assert_eq!(thresholds.classify(1001), Tier::Large);
        assert_eq!(thresholds.classify(u64::MAX), Tier::Large);
    }

    #[test]
    fn test_classify_is_monotonic() {
        let table = table();
        let t = table.thresholds();
        let sizes = [
            0,
            1,
            t.small_max - 1,
            t.small_max,
            t.small_max + 1,
            t.medium_max - 1,
            t.medium_max,
            t.medium_max + 1,
            2_147_483_648,
            u64::MAX,
        ];
        for window in sizes.windows(2) {
            assert!(window[0] <= window[1]);
            assert!(table.classify(window[0]) <= table.classify(window[1]));
        }
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        assert!(TierThresholds::new(10, 10).is_err());
        assert!(TierThresholds::new(11, 10).is_err());
    }

    #[test]
    fn test_lookups() {
        let table = table();
        assert_eq!(table.subject(Tier::Small), "storage.events.small");
        assert_eq!(table.stream(Tier::Medium), "STORAGE_EVENTS_MEDIUM");
        assert_eq!(table.consumer(Tier::Large), "large-workers");
        assert_eq!(table.worker_config(Tier::Large).max_deliver, 2);
        assert_eq!(table.scaling_config(Tier::Small).min_replicas, 2);
        assert_eq!(table.tier_for_subject("storage.events.medium"), Some(Tier::Medium));
        assert_eq!(table.tier_for_subject("storage.events"), None);
    }

    #[test]
    fn test_default_policy_is_monotonic() {
        let table = table();
        for pair in Tier::ALL.windows(2) {
            let (lower, upper) = (pair[0], pair[1]);
            assert!(
                table.scaling_config(upper).max_replicas < table.scaling_config(lower).max_replicas
            );
            assert!(
                table.scaling_config(upper).cooldown_period_secs
                    > table.scaling_config(lower).cooldown_period_secs
            );
            assert!(
                table.worker_config(upper).ack_wait_secs > table.worker_config(lower).ack_wait_secs
            );
            assert!(table.worker_config(upper).batch_size <= table.worker_config(lower).batch_size);
        }
    }

    #[test]
    fn test_rejects_non_monotonic_policy() {
        let mut config = RoutingConfig::default();
        config.tiers.large.scaling.max_replicas = 100;
        assert!(RoutingTable::from_config(&config).is_err());

        let mut config = RoutingConfig::default();
        config.tiers.medium.worker.batch_size = 50;
        assert!(RoutingTable::from_config(&config).is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut config = RoutingConfig::default();
        config.tiers.medium.subject = config.tiers.small.subject.clone();
        assert!(matches!(
            RoutingTable::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_tier_from_str() {
        assert_eq!("LARGE".parse::<Tier>().unwrap(), Tier::Large);
        assert!("huge".parse::<Tier>().is_err());
    }
}
