use fathom_common::{CTRL_PORT, IPV4_HEADER_LEN, PROBE_HEADER_LEN, PROBE_PORT, UDP_HEADER_LEN};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Static measurement configuration, fixed for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Receiver host: IPv4 address or resolvable name.
    #[serde(default)]
    pub target: String,

    /// UDP port the receiver listens on for probes.
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// TCP port the receiver listens on for the control connection.
    #[serde(default = "default_ctrl_port")]
    pub ctrl_port: u16,

    /// Initial probe packet size in bytes, inclusive of IP and UDP headers.
    #[serde(default = "default_pkt_size")]
    pub pkt_size: u32,

    /// Floor for packet-size halving when the rate is too high to pace.
    #[serde(default = "default_min_pkt_size")]
    pub min_pkt_size: u32,

    /// Probes per stream.
    #[serde(default = "default_stream_length")]
    pub stream_length: u32,

    /// Valid streams needed per measurement round.
    #[serde(default = "default_nstreams")]
    pub nstreams: u32,

    /// Mean of the exponential inter-sample sleep, microseconds.
    #[serde(default = "default_inter_stream_spacing")]
    pub inter_stream_spacing: u32,

    /// Bandwidth granularity in bits/s; estimates closer than this are
    /// considered equal for convergence.
    #[serde(default = "default_resolution")]
    pub resolution: f64,

    /// Fractional tolerance on achieved vs. requested spacing.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Measured cost of a clock read in microseconds; 0 means calibrate at
    /// startup.
    #[serde(default)]
    pub syscall_overhead: u32,

    /// Shortest sleep the platform can actually deliver, microseconds;
    /// 0 means calibrate at startup.
    #[serde(default)]
    pub min_sleep: u32,

    /// Hard deadline for a control round trip, milliseconds.
    #[serde(default = "default_ctrl_msg_timeout")]
    pub ctrl_msg_timeout: u64,

    /// How long to wait for the capture layer to catch up after a stream,
    /// milliseconds.
    #[serde(default = "default_pcap_wait_timeout")]
    pub pcap_wait_timeout: u64,

    /// Initial (smallest) target spacing in microseconds.
    #[serde(default = "default_min_space")]
    pub min_space: u32,

    /// Baseline ceiling on target spacing in microseconds; the effective
    /// ceiling also accounts for the smallest packet and the resolution.
    #[serde(default = "default_max_space")]
    pub max_space: u32,

    /// Rounds allowed per sample before falling back to the last-measured
    /// rate.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: i32,

    /// Capture device name; None lets the capture layer pick one.
    #[serde(default)]
    pub capture_device: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_probe_port() -> u16 {
    PROBE_PORT
}

fn default_ctrl_port() -> u16 {
    CTRL_PORT
}

fn default_pkt_size() -> u32 {
    1500
}

fn default_min_pkt_size() -> u32 {
    200
}

fn default_stream_length() -> u32 {
    50
}

fn default_nstreams() -> u32 {
    1
}

fn default_inter_stream_spacing() -> u32 {
    50_000
}

fn default_resolution() -> f64 {
    500_000.0
}

fn default_threshold() -> f64 {
    0.10
}

fn default_ctrl_msg_timeout() -> u64 {
    5_000
}

fn default_pcap_wait_timeout() -> u64 {
    500
}

fn default_min_space() -> u32 {
    100
}

fn default_max_space() -> u32 {
    10_000
}

fn default_retry_limit() -> i32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            probe_port: default_probe_port(),
            ctrl_port: default_ctrl_port(),
            pkt_size: default_pkt_size(),
            min_pkt_size: default_min_pkt_size(),
            stream_length: default_stream_length(),
            nstreams: default_nstreams(),
            inter_stream_spacing: default_inter_stream_spacing(),
            resolution: default_resolution(),
            threshold: default_threshold(),
            syscall_overhead: 0,
            min_sleep: 0,
            ctrl_msg_timeout: default_ctrl_msg_timeout(),
            pcap_wait_timeout: default_pcap_wait_timeout(),
            min_space: default_min_space(),
            max_space: default_max_space(),
            retry_limit: default_retry_limit(),
            capture_device: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SenderConfig {
    /// Smallest packet that still fits the probe header behind the IP and
    /// UDP headers.
    pub const fn floor_pkt_size() -> u32 {
        (IPV4_HEADER_LEN + UDP_HEADER_LEN + PROBE_HEADER_LEN) as u32
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.target.is_empty() {
            return Err("no target host given".into());
        }
        if self.min_pkt_size < Self::floor_pkt_size() {
            return Err(format!(
                "min_pkt_size {} below protocol floor {}",
                self.min_pkt_size,
                Self::floor_pkt_size()
            ));
        }
        if self.pkt_size < self.min_pkt_size {
            return Err(format!(
                "pkt_size {} below min_pkt_size {}",
                self.pkt_size, self.min_pkt_size
            ));
        }
        if self.stream_length < 2 {
            return Err("stream_length must be at least 2".into());
        }
        if self.nstreams < 1 {
            return Err("nstreams must be at least 1".into());
        }
        if self.resolution <= 0.0 {
            return Err("resolution must be positive".into());
        }
        if !(0.0..1.0).contains(&self.threshold) {
            return Err("threshold must be in [0, 1)".into());
        }
        if self.min_space == 0 || self.max_space <= self.min_space {
            return Err("need 0 < min_space < max_space".into());
        }
        if self.retry_limit < 1 {
            return Err("retry_limit must be at least 1".into());
        }
        Ok(())
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("fathom").required(false))
            .add_source(config::Environment::with_prefix("FATHOM").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config file: {}. Using defaults.", e);
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_the_tool() {
        let cfg = SenderConfig::default();
        assert_eq!(cfg.pkt_size, 1500);
        assert_eq!(cfg.min_pkt_size, 200);
        assert_eq!(cfg.stream_length, 50);
        assert_eq!(cfg.nstreams, 1);
        assert_eq!(cfg.min_space, 100);
        assert_eq!(cfg.max_space, 10_000);
        assert_eq!(cfg.retry_limit, 10);
        assert_eq!(cfg.ctrl_msg_timeout, 5_000);
    }

    #[test]
    fn validate_requires_target() {
        let cfg = SenderConfig::default();
        assert!(cfg.validate().is_err());

        let cfg = SenderConfig {
            target: "192.0.2.1".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let cfg = SenderConfig {
            target: "192.0.2.1".into(),
            min_space: 500,
            max_space: 400,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SenderConfig {
            target: "192.0.2.1".into(),
            pkt_size: 100,
            min_pkt_size: 200,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_serialization_round_trip() {
        let cfg = Config {
            sender: SenderConfig {
                target: "198.51.100.7".into(),
                stream_length: 40,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".into(),
            },
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sender.target, cfg.sender.target);
        assert_eq!(parsed.sender.stream_length, 40);
        assert_eq!(parsed.logging.level, "debug");
    }
}
