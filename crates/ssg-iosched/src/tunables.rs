//! Named runtime attributes: show as text, store from text.
//!
//! Stores never fail on a bad value. The text is parsed the way the block
//! layer's attribute files are (leading integer, garbage reads as zero) and
//! the result is clamped into the attribute's range.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::admission::AdmissionLimits;
use crate::cgroup::{CgroupId, CgroupThrottleRegistry};
use crate::config::SsgConfig;
use crate::error::{SchedError, SchedResult};
use crate::request::Direction;

/// Scheduler attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attribute {
    /// Read deadline in milliseconds.
    ReadExpire,
    /// Write deadline in milliseconds.
    WriteExpire,
    /// Reads dispatched past an expired write before the write is forced.
    MaxWriteStarvation,
    /// Front merge lookups enabled (0 or 1).
    FrontMerges,
    /// Read-only thread-group shallow depth.
    TgroupShallowDepth,
    /// Read-only asynchronous write shallow depth.
    AsyncWriteShallowDepth,
}

impl Attribute {
    /// Every attribute in listing order.
    pub const ALL: [Attribute; 6] = [
        Attribute::ReadExpire,
        Attribute::WriteExpire,
        Attribute::MaxWriteStarvation,
        Attribute::FrontMerges,
        Attribute::TgroupShallowDepth,
        Attribute::AsyncWriteShallowDepth,
    ];

    /// File name of the attribute.
    pub fn name(&self) -> &'static str {
        match self {
            Attribute::ReadExpire => "read_expire",
            Attribute::WriteExpire => "write_expire",
            Attribute::MaxWriteStarvation => "max_write_starvation",
            Attribute::FrontMerges => "front_merges",
            Attribute::TgroupShallowDepth => "tgroup_shallow_depth",
            Attribute::AsyncWriteShallowDepth => "async_write_shallow_depth",
        }
    }

    /// Whether `store` is allowed.
    pub fn is_writable(&self) -> bool {
        !matches!(
            self,
            Attribute::TgroupShallowDepth | Attribute::AsyncWriteShallowDepth
        )
    }

    fn range(&self) -> (i64, i64) {
        match self {
            Attribute::ReadExpire | Attribute::WriteExpire => (0, i32::MAX as i64),
            Attribute::MaxWriteStarvation => (i32::MIN as i64, i32::MAX as i64),
            Attribute::FrontMerges => (0, 1),
            Attribute::TgroupShallowDepth | Attribute::AsyncWriteShallowDepth => {
                (0, u32::MAX as i64)
            }
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Attribute {
    type Err = SchedError;

    fn from_str(name: &str) -> SchedResult<Self> {
        Attribute::ALL
            .into_iter()
            .find(|attr| attr.name() == name)
            .ok_or_else(|| SchedError::UnknownAttribute {
                name: name.to_string(),
            })
    }
}

/// Parses a leading base-10 integer, `-` allowed. Leading whitespace is
/// skipped, parsing stops at the first non-digit, no digits yields 0 and
/// overflow saturates.
pub fn parse_leading_int(text: &str) -> i64 {
    let text = text.trim_start();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let mut value: i64 = 0;
    for byte in digits.bytes().take_while(u8::is_ascii_digit) {
        let digit = (byte - b'0') as i64;
        value = value.saturating_mul(10).saturating_add(digit);
    }
    if negative {
        value.saturating_neg()
    } else {
        value
    }
}

/// Writable scheduler attributes; lives under the queue lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    /// Read deadline in milliseconds.
    pub read_expire_ms: i32,
    /// Write deadline in milliseconds.
    pub write_expire_ms: i32,
    /// Starvation bound.
    pub max_write_starvation: i32,
    /// Front merge lookups enabled.
    pub front_merges: bool,
}

impl Tunables {
    /// Initial values from configuration.
    pub fn from_config(config: &SsgConfig) -> Self {
        let ms = |v: u64| v.min(i32::MAX as u64) as i32;
        Self {
            read_expire_ms: ms(config.read_expire_ms),
            write_expire_ms: ms(config.write_expire_ms),
            max_write_starvation: config.max_write_starvation,
            front_merges: config.front_merges,
        }
    }

    /// Deadline offset for `direction` in nanoseconds.
    #[inline]
    pub fn fifo_expire_ns(&self, direction: Direction) -> u64 {
        let ms = match direction {
            Direction::Read => self.read_expire_ms,
            Direction::Write => self.write_expire_ms,
        };
        ms.max(0) as u64 * 1_000_000
    }

    /// Current value of `attr`. Read-only attributes come from `limits`.
    pub fn show(&self, attr: Attribute, limits: &AdmissionLimits) -> i64 {
        match attr {
            Attribute::ReadExpire => self.read_expire_ms as i64,
            Attribute::WriteExpire => self.write_expire_ms as i64,
            Attribute::MaxWriteStarvation => self.max_write_starvation as i64,
            Attribute::FrontMerges => self.front_merges as i64,
            Attribute::TgroupShallowDepth => limits.tgroup_shallow_depth as i64,
            Attribute::AsyncWriteShallowDepth => limits.async_write_shallow_depth as i64,
        }
    }

    /// Parses `text`, clamps it and stores it. Returns the stored value.
    pub fn store(&mut self, attr: Attribute, text: &str) -> SchedResult<i64> {
        if !attr.is_writable() {
            return Err(SchedError::ReadOnlyAttribute {
                name: attr.name().to_string(),
            });
        }
        let (min, max) = attr.range();
        let value = parse_leading_int(text).clamp(min, max);
        match attr {
            Attribute::ReadExpire => self.read_expire_ms = value as i32,
            Attribute::WriteExpire => self.write_expire_ms = value as i32,
            Attribute::MaxWriteStarvation => self.max_write_starvation = value as i32,
            Attribute::FrontMerges => self.front_merges = value == 1,
            Attribute::TgroupShallowDepth | Attribute::AsyncWriteShallowDepth => {
                unreachable!("read-only attributes rejected above")
            }
        }
        debug!("Stored {}={}", attr, value);
        Ok(value)
    }
}

/// The single per-cgroup attribute.
pub const CGROUP_MAX_AVAILABLE_RATIO: &str = "max_available_ratio";

/// Shows a cgroup attribute.
pub fn show_cgroup_attribute(
    registry: &CgroupThrottleRegistry,
    cgroup: CgroupId,
    name: &str,
) -> SchedResult<String> {
    if name != CGROUP_MAX_AVAILABLE_RATIO {
        return Err(SchedError::UnknownAttribute {
            name: name.to_string(),
        });
    }
    Ok(format!("{}\n", registry.max_available_ratio(cgroup)?))
}

/// Stores a cgroup attribute; the ratio is clamped to `0..=100`.
pub fn store_cgroup_attribute(
    registry: &CgroupThrottleRegistry,
    cgroup: CgroupId,
    name: &str,
    text: &str,
) -> SchedResult<u32> {
    if name != CGROUP_MAX_AVAILABLE_RATIO {
        return Err(SchedError::UnknownAttribute {
            name: name.to_string(),
        });
    }
    registry.on_policy_change(cgroup, parse_leading_int(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagGeometry;

    fn limits() -> AdmissionLimits {
        AdmissionLimits::compute(&SsgConfig::default(), &TagGeometry::for_depth(32))
    }

    #[test]
    fn test_parse_leading_int() {
        assert_eq!(parse_leading_int("500\n"), 500);
        assert_eq!(parse_leading_int("  42abc"), 42);
        assert_eq!(parse_leading_int("-17"), -17);
        assert_eq!(parse_leading_int("garbage"), 0);
        assert_eq!(parse_leading_int(""), 0);
        assert_eq!(parse_leading_int("-"), 0);
        assert_eq!(parse_leading_int("99999999999999999999999"), i64::MAX);
    }

    #[test]
    fn test_attribute_names_roundtrip() {
        for attr in Attribute::ALL {
            assert_eq!(attr.name().parse::<Attribute>().unwrap(), attr);
        }
        let err = "bogus".parse::<Attribute>().unwrap_err();
        assert!(matches!(err, SchedError::UnknownAttribute { .. }));
    }

    #[test]
    fn test_defaults_from_config() {
        let t = Tunables::from_config(&SsgConfig::default());
        assert_eq!(t.read_expire_ms, 500);
        assert_eq!(t.write_expire_ms, 5_000);
        assert_eq!(t.max_write_starvation, 2);
        assert!(t.front_merges);
        assert_eq!(t.fifo_expire_ns(Direction::Read), 500_000_000);
    }

    #[test]
    fn test_store_clamps() {
        let mut t = Tunables::from_config(&SsgConfig::default());
        assert_eq!(t.store(Attribute::ReadExpire, "-5").unwrap(), 0);
        assert_eq!(t.read_expire_ms, 0);
        assert_eq!(t.store(Attribute::FrontMerges, "7").unwrap(), 1);
        assert!(t.front_merges);
        assert_eq!(t.store(Attribute::FrontMerges, "0").unwrap(), 0);
        assert!(!t.front_merges);
        assert_eq!(
            t.store(Attribute::WriteExpire, "99999999999").unwrap(),
            i32::MAX as i64
        );
        assert_eq!(t.store(Attribute::MaxWriteStarvation, "-3").unwrap(), -3);
        assert_eq!(t.store(Attribute::MaxWriteStarvation, "junk").unwrap(), 0);
    }

    #[test]
    fn test_read_only_attributes() {
        let mut t = Tunables::from_config(&SsgConfig::default());
        let err = t.store(Attribute::TgroupShallowDepth, "3").unwrap_err();
        assert!(matches!(err, SchedError::ReadOnlyAttribute { .. }));
        assert_eq!(t.show(Attribute::TgroupShallowDepth, &limits()), 4);
        assert_eq!(t.show(Attribute::AsyncWriteShallowDepth, &limits()), 2);
    }

    #[test]
    fn test_cgroup_attribute() {
        let registry = CgroupThrottleRegistry::new();
        registry.create_cgroup(CgroupId(2), CgroupId::ROOT).unwrap();
        assert_eq!(
            show_cgroup_attribute(&registry, CgroupId(2), CGROUP_MAX_AVAILABLE_RATIO).unwrap(),
            "100\n"
        );
        assert_eq!(
            store_cgroup_attribute(&registry, CgroupId(2), CGROUP_MAX_AVAILABLE_RATIO, "150")
                .unwrap(),
            100
        );
        assert_eq!(
            store_cgroup_attribute(&registry, CgroupId(2), CGROUP_MAX_AVAILABLE_RATIO, "30\n")
                .unwrap(),
            30
        );
        assert!(show_cgroup_attribute(&registry, CgroupId(2), "weight").is_err());
        assert!(show_cgroup_attribute(&registry, CgroupId(9), CGROUP_MAX_AVAILABLE_RATIO).is_err());
    }
}
