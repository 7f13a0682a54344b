//! Error types for the scheduler's configuration surface.
//!
//! Scheduling itself never fails: admission denial is a reduced depth, an
//! empty dispatch is `None`, and out-of-range tunables are clamped. Only the
//! named-attribute and configuration-loading paths return errors.

use thiserror::Error;

use crate::cgroup::CgroupId;

/// Result type alias for scheduler configuration operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Error variants for scheduler configuration operations.
#[derive(Debug, Error)]
pub enum SchedError {
    /// No tunable attribute with this name exists.
    #[error("Unknown attribute: {name}")]
    UnknownAttribute {
        /// The attribute name that was requested.
        name: String,
    },

    /// The attribute exists but cannot be written.
    #[error("Attribute is read-only: {name}")]
    ReadOnlyAttribute {
        /// The attribute name that was written.
        name: String,
    },

    /// A configuration value is structurally unusable (not merely out of range).
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// Configuration document could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// The cgroup is not known to the registry.
    #[error("Unknown cgroup: {cgroup}")]
    UnknownCgroup {
        /// The cgroup that was looked up.
        cgroup: CgroupId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sched_result_alias() {
        let ok: SchedResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: SchedResult<i32> = Err(SchedError::InvalidConfig {
            reason: "zone_sectors must be non-zero".to_string(),
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_attribute() {
        let err = SchedError::UnknownAttribute {
            name: "fifo_batch".to_string(),
        };
        assert_eq!(format!("{}", err), "Unknown attribute: fifo_batch");
    }

    #[test]
    fn test_read_only_attribute() {
        let err = SchedError::ReadOnlyAttribute {
            name: "tgroup_shallow_depth".to_string(),
        };
        assert!(format!("{}", err).contains("tgroup_shallow_depth"));
    }

    #[test]
    fn test_config_parse_from_serde() {
        let parse_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: SchedError = parse_err.into();
        assert!(matches!(err, SchedError::ConfigParse(_)));
        assert!(format!("{}", err).starts_with("Config parse error"));
    }

    #[test]
    fn test_unknown_cgroup() {
        let err = SchedError::UnknownCgroup {
            cgroup: CgroupId(7),
        };
        assert_eq!(format!("{}", err), "Unknown cgroup: cgroup:7");
    }
}
