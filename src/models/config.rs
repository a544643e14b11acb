use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Device to start capturing on at launch, if any
    pub interface: Option<String>,

    /// Port for the REST API server
    pub port: u16,

    /// Log level name (trace, debug, info, warn, error, off)
    pub log_level: String,

    /// Tuning for capture sessions
    pub capture: CaptureConfig,
}

/// Tunables for one capture session.
///
/// Every field has a default so partial overrides can be deserialized from a
/// start request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Period of the reporting tick
    #[serde(with = "millis")]
    pub report_frequency: Duration,

    /// Idle time after which a flow is reported as ended
    #[serde(with = "millis")]
    pub connection_timeout: Duration,

    /// Time constant of the throughput moving average
    #[serde(with = "millis")]
    pub rate_window: Duration,

    /// Ceiling on the number of concurrently tracked flows
    pub max_flows: usize,

    /// `min/max` of up and down rates above which a flow counts as mixed
    pub mixed_ratio: f64,

    /// Bytes captured per frame; only headers are needed
    pub snaplen: i32,

    /// Enable promiscuous mode
    pub promiscuous: bool,

    /// BPF expression; `None` disables kernel filtering
    pub filter: Option<String>,

    /// Ignore remotes that are not globally routable
    pub skip_non_global: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            report_frequency: Duration::from_millis(150),
            connection_timeout: Duration::from_secs(5),
            rate_window: Duration::from_secs(1),
            max_flows: 4096,
            mixed_ratio: 0.7,
            snaplen: 128,
            promiscuous: false,
            filter: Some(crate::capture::filter::default_bpf_filter()),
            skip_non_global: false,
        }
    }
}

impl CaptureConfig {
    /// Read timeout for the capture handle: never longer than one tick so a
    /// quiet network still observes stop requests promptly.
    pub fn read_timeout(&self) -> Duration {
        self.report_frequency
            .min(Duration::from_millis(100))
            .max(Duration::from_millis(1))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
