//! Connection manager CLI arguments.

use std::str::FromStr;
use std::time::Duration;

use clap::Args;
use libp2p::StreamProtocol;
use serde::{Deserialize, Serialize};

use crate::config::{
    ConfigError, ConnManagerConfig, DEFAULT_GRACE_PERIOD, DEFAULT_HIGH_WATERMARK,
    DEFAULT_LOW_WATERMARK, DEFAULT_SILENCE_PERIOD, DEFAULT_TRIM_INTERVAL,
};

/// A `PROTOCOL=COUNT` quota entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMinimum {
    pub protocol: String,
    pub minimum: usize,
}

impl FromStr for ProtocolMinimum {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidProtocolMinimum(s.to_string());

        let (protocol, minimum) = s.split_once('=').ok_or_else(invalid)?;
        let protocol = protocol.trim();
        if !protocol.starts_with('/') {
            return Err(invalid());
        }
        let minimum = minimum.trim().parse().map_err(|_| invalid())?;

        Ok(Self {
            protocol: protocol.to_string(),
            minimum,
        })
    }
}

/// Connection manager configuration.
#[derive(Debug, Args, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[command(next_help_heading = "Connection Manager")]
#[serde(default)]
pub struct ConnManagerArgs {
    /// Connection count a trim reduces to. Zero disables trimming.
    #[arg(long = "connmgr.low-watermark", default_value_t = DEFAULT_LOW_WATERMARK)]
    pub low_watermark: usize,

    /// Connection count above which connections get trimmed. Zero disables trimming.
    #[arg(long = "connmgr.high-watermark", default_value_t = DEFAULT_HIGH_WATERMARK)]
    pub high_watermark: usize,

    /// Seconds a new peer is immune from trimming.
    #[arg(long = "connmgr.grace-period", default_value_t = DEFAULT_GRACE_PERIOD.as_secs())]
    pub grace_period_secs: u64,

    /// Minimum seconds between two trims.
    #[arg(long = "connmgr.silence-period", default_value_t = DEFAULT_SILENCE_PERIOD.as_secs())]
    pub silence_period_secs: u64,

    /// Seconds between background watermark checks.
    #[arg(long = "connmgr.trim-interval", default_value_t = DEFAULT_TRIM_INTERVAL.as_secs())]
    pub trim_interval_secs: u64,

    /// Minimum connected peers per protocol, as `PROTOCOL=COUNT`.
    ///
    /// Example: `--connmgr.protocol-min /ipfs/kad/1.0.0=8`
    #[arg(long = "connmgr.protocol-min", value_name = "PROTOCOL=COUNT")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocol_minimums: Vec<ProtocolMinimum>,
}

impl Default for ConnManagerArgs {
    fn default() -> Self {
        Self {
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            grace_period_secs: DEFAULT_GRACE_PERIOD.as_secs(),
            silence_period_secs: DEFAULT_SILENCE_PERIOD.as_secs(),
            trim_interval_secs: DEFAULT_TRIM_INTERVAL.as_secs(),
            protocol_minimums: Vec::new(),
        }
    }
}

impl ConnManagerArgs {
    /// Build a validated [`ConnManagerConfig`].
    pub fn to_config(&self) -> Result<ConnManagerConfig, ConfigError> {
        let mut config = ConnManagerConfig::new(
            self.low_watermark,
            self.high_watermark,
            Duration::from_secs(self.grace_period_secs),
        )
        .with_silence_period(Duration::from_secs(self.silence_period_secs))
        .with_trim_interval(Duration::from_secs(self.trim_interval_secs));

        for entry in &self.protocol_minimums {
            let protocol = StreamProtocol::try_from_owned(entry.protocol.clone()).map_err(|_| {
                ConfigError::InvalidProtocolMinimum(format!("{}={}", entry.protocol, entry.minimum))
            })?;
            config = config.with_protocol_minimum(protocol, entry.minimum);
        }

        config.validate()?;
        Ok(config)
    }
}
