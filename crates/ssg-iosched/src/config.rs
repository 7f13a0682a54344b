//! Scheduler configuration.
//!
//! Defaults carry the SSG constants: half a second for reads, five seconds
//! for writes, two reads allowed to starve a waiting write, congestion at 90%
//! of the tag depth, half the depth per thread group and a quarter (at most
//! eight) for asynchronous writes.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{SchedError, SchedResult};
use crate::request::Direction;
use crate::zone::ZonedConfig;

/// Upper bound for the percentage-valued fields.
pub const MAX_RATIO: u32 = 100;

/// Configuration for one scheduler instance (one device queue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsgConfig {
    /// Soft deadline for reads, in milliseconds.
    pub read_expire_ms: u64,
    /// Soft deadline for writes, in milliseconds.
    pub write_expire_ms: u64,
    /// Times reads may be preferred over a waiting write. Negative values
    /// mean a waiting write always wins.
    pub max_write_starvation: i32,
    /// Whether bios may be merged at the front of queued requests.
    pub front_merges: bool,
    /// Allocated-request percentage of the depth above which thread-group
    /// fairness is evaluated.
    pub congestion_threshold_pct: u32,
    /// Percentage of the depth one thread group may hold under congestion.
    pub max_tgroup_io_ratio: u32,
    /// Percentage of the depth asynchronous writes may hold.
    pub max_async_write_ratio: u32,
    /// Absolute ceiling on in-flight asynchronous writes.
    pub max_async_write_rqs: u32,
    /// Largest request, in sectors, that merging may produce.
    pub max_merge_sectors: u32,
    /// Zone geometry for zoned devices; `None` for conventional devices.
    pub zoned: Option<ZonedConfig>,
}

impl Default for SsgConfig {
    fn default() -> Self {
        Self {
            read_expire_ms: 500,
            write_expire_ms: 5_000,
            max_write_starvation: 2,
            front_merges: true,
            congestion_threshold_pct: 90,
            max_tgroup_io_ratio: 50,
            max_async_write_ratio: 25,
            max_async_write_rqs: 8,
            max_merge_sectors: 2_560,
            zoned: None,
        }
    }
}

impl SsgConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> SchedResult<Self> {
        let config: SsgConfig = serde_json::from_str(json)?;
        config.validated()
    }

    /// Clamps percentages into range and rejects unusable geometry.
    pub fn validated(mut self) -> SchedResult<Self> {
        for (name, value) in [
            ("congestion_threshold_pct", &mut self.congestion_threshold_pct),
            ("max_tgroup_io_ratio", &mut self.max_tgroup_io_ratio),
            ("max_async_write_ratio", &mut self.max_async_write_ratio),
        ] {
            if *value > MAX_RATIO {
                warn!("Clamping {}={} to {}", name, value, MAX_RATIO);
                *value = MAX_RATIO;
            }
        }
        if self.max_merge_sectors == 0 {
            return Err(SchedError::InvalidConfig {
                reason: "max_merge_sectors must be non-zero".to_string(),
            });
        }
        if let Some(zoned) = &self.zoned {
            zoned.validate()?;
        }
        Ok(self)
    }

    /// Returns the soft deadline for `direction` in nanoseconds.
    #[inline]
    pub fn fifo_expire_ns(&self, direction: Direction) -> u64 {
        let ms = match direction {
            Direction::Read => self.read_expire_ms,
            Direction::Write => self.write_expire_ms,
        };
        ms.saturating_mul(1_000_000)
    }

    /// True when zone write locking applies.
    #[inline]
    pub fn is_zoned(&self) -> bool {
        self.zoned.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SsgConfig::default();
        assert_eq!(config.read_expire_ms, 500);
        assert_eq!(config.write_expire_ms, 5_000);
        assert_eq!(config.max_write_starvation, 2);
        assert!(config.front_merges);
        assert_eq!(config.congestion_threshold_pct, 90);
        assert_eq!(config.max_tgroup_io_ratio, 50);
        assert_eq!(config.max_async_write_ratio, 25);
        assert_eq!(config.max_async_write_rqs, 8);
        assert!(!config.is_zoned());
    }

    #[test]
    fn test_fifo_expire_ns() {
        let config = SsgConfig::default();
        assert_eq!(config.fifo_expire_ns(Direction::Read), 500_000_000);
        assert_eq!(config.fifo_expire_ns(Direction::Write), 5_000_000_000);
    }

    #[test]
    fn test_from_json_partial_document() {
        let config = SsgConfig::from_json_str(r#"{"read_expire_ms": 100, "front_merges": false}"#)
            .unwrap();
        assert_eq!(config.read_expire_ms, 100);
        assert!(!config.front_merges);
        assert_eq!(config.write_expire_ms, 5_000);
    }

    #[test]
    fn test_from_json_clamps_ratios() {
        let json = r#"{"max_tgroup_io_ratio": 250, "congestion_threshold_pct": 101}"#;
        let config = SsgConfig::from_json_str(json).unwrap();
        assert_eq!(config.max_tgroup_io_ratio, 100);
        assert_eq!(config.congestion_threshold_pct, 100);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let result = SsgConfig::from_json_str("{ read_expire_ms: ");
        assert!(matches!(result, Err(SchedError::ConfigParse(_))));
    }

    #[test]
    fn test_zero_merge_limit_rejected() {
        let config = SsgConfig {
            max_merge_sectors: 0,
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_zoned_config_roundtrip_through_json() {
        let config = SsgConfig {
            zoned: Some(ZonedConfig::new(524_288, 4)),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed = SsgConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, config);
        assert!(parsed.is_zoned());
    }
}
