//! Connection manager configuration.
//!
//! # Water Mark Concepts
//!
//! - **High watermark** (`high_watermark`, default 192): the background trimmer
//!   only acts once the live connection count exceeds this level.
//!
//! - **Low watermark** (`low_watermark`, default 160): a trim closes connections
//!   until the count is back down to this level.
//!
//! Setting either watermark to zero disables trimming entirely.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::StreamProtocol;
use thiserror::Error;

/// Default connection count a trim brings the manager down to.
pub const DEFAULT_LOW_WATERMARK: usize = 160;

/// Default connection count above which the background trimmer acts.
pub const DEFAULT_HIGH_WATERMARK: usize = 192;

/// Default age a peer must reach before it can be pruned.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(20);

/// Default minimum spacing between two completed trims.
pub const DEFAULT_SILENCE_PERIOD: Duration = Duration::from_secs(10);

/// Default tick of the background trimmer.
pub const DEFAULT_TRIM_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("low watermark {low} exceeds high watermark {high}")]
    WatermarksInverted { low: usize, high: usize },
    #[error("trim interval must be non-zero")]
    ZeroTrimInterval,
    #[error("invalid protocol minimum {0:?}, expected PROTOCOL=COUNT")]
    InvalidProtocolMinimum(String),
}

/// Configuration for the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnManagerConfig {
    /// Connection count a trim reduces to.
    pub low_watermark: usize,

    /// Connection count above which the background trimmer runs a trim.
    pub high_watermark: usize,

    /// Age a peer must reach, measured from its first connection, before it
    /// becomes prunable.
    pub grace_period: Duration,

    /// Minimum time between the completion of one trim and the start of the next.
    pub silence_period: Duration,

    /// Interval at which the background trimmer checks the high watermark.
    pub trim_interval: Duration,

    /// Minimum number of connected peers to keep for each listed protocol.
    pub protocol_minimums: HashMap<StreamProtocol, usize>,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            low_watermark: DEFAULT_LOW_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            grace_period: DEFAULT_GRACE_PERIOD,
            silence_period: DEFAULT_SILENCE_PERIOD,
            trim_interval: DEFAULT_TRIM_INTERVAL,
            protocol_minimums: HashMap::new(),
        }
    }
}

impl ConnManagerConfig {
    /// Create a config with the given watermarks and grace period.
    pub fn new(low_watermark: usize, high_watermark: usize, grace_period: Duration) -> Self {
        Self {
            low_watermark,
            high_watermark,
            grace_period,
            ..Default::default()
        }
    }

    pub fn with_low_watermark(mut self, count: usize) -> Self {
        self.low_watermark = count;
        self
    }

    pub fn with_high_watermark(mut self, count: usize) -> Self {
        self.high_watermark = count;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_silence_period(mut self, silence: Duration) -> Self {
        self.silence_period = silence;
        self
    }

    pub fn with_trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval = interval;
        self
    }

    /// Keep at least `minimum` connected peers speaking `protocol`.
    pub fn with_protocol_minimum(mut self, protocol: StreamProtocol, minimum: usize) -> Self {
        self.protocol_minimums.insert(protocol, minimum);
        self
    }

    /// Either watermark at zero turns trimming off.
    pub fn is_trimming_enabled(&self) -> bool {
        self.low_watermark != 0 && self.high_watermark != 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.is_trimming_enabled() && self.low_watermark > self.high_watermark {
            return Err(ConfigError::WatermarksInverted {
                low: self.low_watermark,
                high: self.high_watermark,
            });
        }
        if self.trim_interval.is_zero() {
            return Err(ConfigError::ZeroTrimInterval);
        }
        Ok(())
    }
}
