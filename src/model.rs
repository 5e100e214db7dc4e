use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Latency probe transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PingMode {
    #[default]
    Http,
    Tcp,
    Icmp,
}

impl FromStr for PingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(PingMode::Http),
            "tcp" => Ok(PingMode::Tcp),
            "icmp" => Ok(PingMode::Icmp),
            other => Err(format!("unknown ping mode '{other}' (http|tcp|icmp)")),
        }
    }
}

/// Geographic coordinates used to override the detected user location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Client configuration. Passed by value into the speedtest client at
/// construction; there is no global state to mutate afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Request header for all HTTP calls.
    pub user_agent: String,
    /// HTTP or SOCKS proxy URL, empty for a direct connection.
    pub proxy: Option<String>,
    /// Local address (or interface name) to bind outgoing sockets to.
    pub source: Option<String>,
    /// When true, DNS resolution also binds to `source`.
    pub dns_bind_source: bool,
    pub ping_mode: PingMode,
    /// Forces a single connection and small chunk sizes.
    pub saving_mode: bool,
    /// Worker-pool size per direction; 0 means the number of logical CPUs.
    pub max_connections: usize,
    /// Server-catalog filter substring.
    pub keyword: Option<String>,
    /// Named city whose coordinates replace the detected user location.
    pub city: Option<String>,
    /// Explicit coordinates, overriding both detection and `city`.
    pub location: Option<Coordinates>,
    pub no_download: bool,
    pub no_upload: bool,
    /// Verbose tracing to stderr.
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("speedtest-cli/{}", env!("CARGO_PKG_VERSION")),
            proxy: None,
            source: None,
            dns_bind_source: false,
            ping_mode: PingMode::Http,
            saving_mode: false,
            max_connections: 0,
            keyword: None,
            city: None,
            location: None,
            no_download: false,
            no_upload: false,
            debug: false,
        }
    }
}

/// Round-trip latency summary over the raw probe samples.
/// `jitter` is the sample standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean_ns: i64,
    pub jitter_ns: i64,
    pub min_ns: i64,
    pub max_ns: i64,
    pub p50_ns: i64,
    pub p90_ns: i64,
    pub p99_ns: i64,
}

impl LatencyStats {
    pub fn mean(&self) -> Duration {
        Duration::from_nanos(self.mean_ns.max(0) as u64)
    }
}

/// Realised wall-clock spend of each test phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDurations {
    #[serde(with = "humantime_serde")]
    pub ping: Duration,
    #[serde(with = "humantime_serde")]
    pub download: Duration,
    #[serde(with = "humantime_serde")]
    pub upload: Duration,
    #[serde(with = "humantime_serde")]
    pub total: Duration,
}
