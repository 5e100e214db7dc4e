//! Byte-rate presentation: four auto-scaled unit families plus the fixed
//! Mbps default. The internal unit is always bytes per second; −1 is the
//! not-available sentinel.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const KB: f64 = 1000.0;
const MB: f64 = 1000.0 * KB;
const GB: f64 = 1000.0 * MB;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * KIB;
const GIB: f64 = 1024.0 * MIB;

const DECIMAL_BITS_UNITS: [&str; 4] = ["bps", "Kbps", "Mbps", "Gbps"];
const DECIMAL_BYTES_UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
const BINARY_BITS_UNITS: [&str; 3] = ["Kibps", "Mibps", "Gibps"];
const BINARY_BYTES_UNITS: [&str; 3] = ["KiB/s", "MiB/s", "GiB/s"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitFamily {
    DecimalBits,
    DecimalBytes,
    BinaryBits,
    BinaryBytes,
    /// Fixed-scale Mbps, the default output form.
    #[default]
    DefaultMbps,
}

impl FromStr for UnitFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "decimal-bits" => Ok(UnitFamily::DecimalBits),
            "decimal-bytes" => Ok(UnitFamily::DecimalBytes),
            "binary-bits" => Ok(UnitFamily::BinaryBits),
            "binary-bytes" => Ok(UnitFamily::BinaryBytes),
            "default" | "mbps" => Ok(UnitFamily::DefaultMbps),
            other => Err(format!(
                "unknown unit '{other}' (decimal-bits|decimal-bytes|binary-bits|binary-bytes|default)"
            )),
        }
    }
}

/// A throughput figure in bytes per second. `ByteRate(-1.0)` means the
/// measurement is not available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteRate(pub f64);

impl ByteRate {
    pub const NOT_AVAILABLE: ByteRate = ByteRate(-1.0);

    pub fn is_available(&self) -> bool {
        self.0 >= 0.0
    }

    pub fn mbps(&self) -> f64 {
        self.0 / 125_000.0
    }

    pub fn gbps(&self) -> f64 {
        self.0 / 125_000_000.0
    }

    /// Render in the requested unit family.
    pub fn format(&self, family: UnitFamily) -> String {
        if self.0 == 0.0 {
            return "0.00 Mbps".to_string();
        }
        if !self.is_available() {
            return "N/A".to_string();
        }
        let rate = self.0;
        let val = match family {
            UnitFamily::DecimalBits | UnitFamily::BinaryBits => rate * 8.0,
            _ => rate,
        };
        match family {
            UnitFamily::DefaultMbps => format!("{:.2} Mbps", self.mbps()),
            UnitFamily::DecimalBits | UnitFamily::DecimalBytes => {
                let units = if family == UnitFamily::DecimalBits {
                    &DECIMAL_BITS_UNITS
                } else {
                    &DECIMAL_BYTES_UNITS
                };
                if rate >= GB {
                    format!("{:.2} {}", val / GB, units[3])
                } else if rate >= MB {
                    format!("{:.2} {}", val / MB, units[2])
                } else if rate >= KB {
                    format!("{:.2} {}", val / KB, units[1])
                } else {
                    format!("{:.2} {}", val, units[0])
                }
            }
            UnitFamily::BinaryBits | UnitFamily::BinaryBytes => {
                let units = if family == UnitFamily::BinaryBits {
                    &BINARY_BITS_UNITS
                } else {
                    &BINARY_BYTES_UNITS
                };
                if rate >= GIB {
                    format!("{:.2} {}", val / GIB, units[2])
                } else if rate >= MIB {
                    format!("{:.2} {}", val / MIB, units[1])
                } else {
                    format!("{:.2} {}", val / KIB, units[0])
                }
            }
        }
    }

    /// Parse a rendered rate back into bytes per second. The unit suffix
    /// identifies the family, so output of any [`ByteRate::format`] call is
    /// accepted.
    pub fn parse(s: &str) -> Option<ByteRate> {
        let s = s.trim();
        if s == "N/A" {
            return Some(ByteRate::NOT_AVAILABLE);
        }
        let (value, unit) = s.rsplit_once(' ')?;
        let value: f64 = value.parse().ok()?;
        let bytes = match unit {
            "bps" => value / 8.0,
            "Kbps" => value * KB / 8.0,
            "Mbps" => value * MB / 8.0,
            "Gbps" => value * GB / 8.0,
            "B/s" => value,
            "KB/s" => value * KB,
            "MB/s" => value * MB,
            "GB/s" => value * GB,
            "Kibps" => value * KIB / 8.0,
            "Mibps" => value * MIB / 8.0,
            "Gibps" => value * GIB / 8.0,
            "KiB/s" => value * KIB,
            "MiB/s" => value * MIB,
            "GiB/s" => value * GIB,
            _ => return None,
        };
        Some(ByteRate(bytes))
    }
}

impl fmt::Display for ByteRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0.0 {
            return write!(f, "0.00 Mbps");
        }
        if !self.is_available() {
            return write!(f, "N/A");
        }
        write!(f, "{:.2} Mbps", self.mbps())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAMILIES: [UnitFamily; 4] = [
        UnitFamily::DecimalBits,
        UnitFamily::DecimalBytes,
        UnitFamily::BinaryBits,
        UnitFamily::BinaryBytes,
    ];

    #[test]
    fn display_defaults_to_mbps() {
        assert_eq!(ByteRate(125_000.0).to_string(), "1.00 Mbps");
        assert_eq!(ByteRate(0.0).to_string(), "0.00 Mbps");
        assert_eq!(ByteRate::NOT_AVAILABLE.to_string(), "N/A");
    }

    #[test]
    fn family_scaling() {
        let rate = ByteRate(GB);
        assert_eq!(rate.format(UnitFamily::DecimalBytes), "1.00 GB/s");
        assert_eq!(rate.format(UnitFamily::DecimalBits), "8.00 Gbps");
        let rate = ByteRate(GIB);
        assert_eq!(rate.format(UnitFamily::BinaryBytes), "1.00 GiB/s");
        assert_eq!(rate.format(UnitFamily::BinaryBits), "8.00 Gibps");
    }

    #[test]
    fn format_parse_round_trip_on_boundaries() {
        let boundaries = [0.0, KB, MB, GB, KIB, MIB, GIB];
        for family in FAMILIES {
            for &b in &boundaries {
                let rendered = ByteRate(b).format(family);
                let parsed = ByteRate::parse(&rendered).unwrap();
                assert_eq!(
                    parsed.format(family),
                    rendered,
                    "family {family:?} boundary {b}"
                );
            }
            // the sentinel survives every family
            let rendered = ByteRate::NOT_AVAILABLE.format(family);
            assert_eq!(rendered, "N/A");
            assert_eq!(ByteRate::parse(&rendered).unwrap(), ByteRate::NOT_AVAILABLE);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ByteRate::parse("fast").is_none());
        assert!(ByteRate::parse("12.0 parsecs").is_none());
    }
}
