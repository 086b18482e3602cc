use std::env;

use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Engine limits and defaults.
///
/// Values come from `Default`, a JSON object (`from_json`), or environment
/// variables layered over the defaults (`from_env`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum nesting depth accepted by the expression parser.
    pub max_expression_depth: usize,
    /// Maximum number of distinct groups a single `$group` may hold.
    pub max_group_cardinality: usize,
    /// IANA timezone used by date operators when none is given.
    pub default_timezone: String,
    /// Reject unknown stage keys instead of skipping them.
    pub strict_stages: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_expression_depth: 64,
            max_group_cardinality: 100_000,
            default_timezone: "UTC".to_string(),
            strict_stages: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CORTEX_PIPELINE_MAX_DEPTH`,
    /// `CORTEX_PIPELINE_MAX_GROUPS` and `CORTEX_PIPELINE_TZ`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(depth) = env::var("CORTEX_PIPELINE_MAX_DEPTH") {
            config.max_expression_depth = depth.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("CORTEX_PIPELINE_MAX_DEPTH: {depth}"))
            })?;
        }
        if let Ok(groups) = env::var("CORTEX_PIPELINE_MAX_GROUPS") {
            config.max_group_cardinality = groups.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("CORTEX_PIPELINE_MAX_GROUPS: {groups}"))
            })?;
        }
        if let Ok(tz) = env::var("CORTEX_PIPELINE_TZ") {
            config.default_timezone = tz.trim().to_string();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_expression_depth == 0 {
            return Err(Error::InvalidConfig(
                "maxExpressionDepth must be positive".into(),
            ));
        }
        if self.max_group_cardinality == 0 {
            return Err(Error::InvalidConfig(
                "maxGroupCardinality must be positive".into(),
            ));
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.default_timezone.parse::<Tz>().map_err(|_| {
            Error::InvalidConfig(format!("unknown timezone '{}'", self.default_timezone))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timezone().unwrap(), chrono_tz::UTC);
    }

    #[test]
    fn from_json_partial() {
        let config = EngineConfig::from_json(&json!({"maxGroupCardinality": 10, "defaultTimezone": "Asia/Seoul"})).unwrap();
        assert_eq!(config.max_group_cardinality, 10);
        assert_eq!(config.max_expression_depth, 64);
        assert_eq!(config.timezone().unwrap(), chrono_tz::Asia::Seoul);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(EngineConfig::from_json(&json!({"maxExpressionDepth": 0})).is_err());
        assert!(EngineConfig::from_json(&json!({"defaultTimezone": "Mars/Olympus"})).is_err());
    }
}
