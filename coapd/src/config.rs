//! Endpoint configuration.
//!
//! A composable configuration tree with serde-derived TOML support,
//! per-field defaults and a `validate()` pass that collects every problem
//! instead of stopping at the first.
//!
//! ```toml
//! max_message_size = 65535
//!
//! [transmission]
//! max_retransmit = 4
//!
//! [blockwise]
//! szx = 1024
//!
//! [keepalive]
//! interval = { secs = 30, nanos = 0 }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use coapd_msg::Szx;
use serde::{Deserialize, Serialize};

/// Top-level endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Inbound datagrams above this size are rejected at decode time.
    pub max_message_size: usize,

    /// Granularity for cancellation polling on socket operations and
    /// background sweeps.
    pub heart_beat: Duration,

    /// Confirmable-message retransmission parameters.
    pub transmission: TransmissionConfig,

    /// Block-wise transfer parameters.
    pub blockwise: BlockwiseConfig,

    /// Optional empty-CON keepalive probing.
    pub keepalive: KeepaliveConfig,

    /// Observe extension parameters.
    pub observer: ObserverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 65535,
            heart_beat: Duration::from_millis(100),
            transmission: TransmissionConfig::default(),
            blockwise: BlockwiseConfig::default(),
            keepalive: KeepaliveConfig::default(),
            observer: ObserverConfig::default(),
        }
    }
}

/// Retransmission timing (RFC 7252 Section 4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmissionConfig {
    /// Base acknowledgement timeout. The initial retransmission delay is
    /// drawn uniformly from `[ack_timeout, ack_timeout * ack_random_factor]`.
    pub ack_timeout: Duration,

    /// Randomisation factor applied to the initial delay.
    pub ack_random_factor: f64,

    /// Retransmissions attempted before the exchange fails with a
    /// transmit timeout.
    pub max_retransmit: u32,

    /// Maximum confirmable messages in flight to one peer.
    pub nstart: usize,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
        }
    }
}

impl TransmissionConfig {
    /// Time from first transmission to the last possible retransmission
    /// (MAX_TRANSMIT_SPAN, RFC 7252 Section 4.8.2).
    pub fn max_transmit_span(&self) -> Duration {
        let doublings = (1u32 << self.max_retransmit) - 1;
        self.ack_timeout
            .mul_f64(doublings as f64 * self.ack_random_factor)
    }

    /// How long a message ID must stay distinguishable
    /// (EXCHANGE_LIFETIME, RFC 7252 Section 4.8.2): the transmit span plus
    /// two maximum latencies plus processing delay. 247 s with defaults.
    pub fn exchange_lifetime(&self) -> Duration {
        const MAX_LATENCY: Duration = Duration::from_secs(100);
        self.max_transmit_span() + MAX_LATENCY * 2 + self.ack_timeout
    }
}

/// Block-wise transfer parameters (RFC 7959).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockwiseConfig {
    /// Whether oversize payloads are transferred block-wise at all.
    pub enable: bool,

    /// Preferred block size in bytes (a power of two in 16..=1024).
    pub szx: usize,

    /// A transfer with no progress for this long is dropped.
    pub transfer_timeout: Duration,
}

impl Default for BlockwiseConfig {
    fn default() -> Self {
        Self {
            enable: true,
            szx: 1024,
            transfer_timeout: Duration::from_secs(5),
        }
    }
}

impl BlockwiseConfig {
    /// The configured block size as an exponent.
    pub fn preferred_szx(&self) -> Szx {
        Szx::fitting(self.szx)
    }
}

/// Empty-CON keepalive probing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Probe interval; `None` disables keepalive.
    pub interval: Option<Duration>,

    /// Consecutive probe failures tolerated before the session is closed.
    pub max_retries: u32,
}

/// Observe extension parameters (RFC 7641).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// A notification newer by wall clock than this window supersedes any
    /// sequence-number comparison (RFC 7641 Section 3.4).
    pub freshness_window: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(128),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(config_path = %path.display(), "configuration file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(text).context("parsing TOML config")?;
        config
            .validate()
            .map_err(|errors| anyhow::anyhow!("invalid configuration:\n{}", errors.join("\n")))?;
        Ok(config)
    }

    /// Validate the whole tree, collecting every problem.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_message_size < 16 {
            errors.push("max_message_size must be at least 16".to_string());
        }
        if self.heart_beat.is_zero() {
            errors.push("heart_beat must be non-zero".to_string());
        }
        if self.transmission.ack_timeout.is_zero() {
            errors.push("transmission.ack_timeout must be non-zero".to_string());
        }
        if self.transmission.ack_random_factor < 1.0 {
            errors.push("transmission.ack_random_factor must be at least 1.0".to_string());
        }
        if self.transmission.max_retransmit == 0 || self.transmission.max_retransmit > 16 {
            errors.push("transmission.max_retransmit must be in 1..=16".to_string());
        }
        if self.transmission.nstart == 0 {
            errors.push("transmission.nstart must be at least 1".to_string());
        }
        if !(16..=1024).contains(&self.blockwise.szx) || !self.blockwise.szx.is_power_of_two() {
            errors.push("blockwise.szx must be a power of two in 16..=1024".to_string());
        }
        if self.blockwise.transfer_timeout.is_zero() {
            errors.push("blockwise.transfer_timeout must be non-zero".to_string());
        }
        if let Some(interval) = self.keepalive.interval {
            if interval.is_zero() {
                errors.push("keepalive.interval must be non-zero when set".to_string());
            }
        }
        if self.observer.freshness_window.is_zero() {
            errors.push("observer.freshness_window must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_message_size, 65535);
        assert_eq!(config.transmission.max_retransmit, 4);
        assert_eq!(config.blockwise.preferred_szx(), Szx::S1024);
        assert!(config.keepalive.interval.is_none());
    }

    #[test]
    fn test_exchange_lifetime_default_is_247s() {
        let transmission = TransmissionConfig::default();
        assert_eq!(transmission.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(transmission.exchange_lifetime(), Duration::from_secs(247));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.transmission.nstart = 0;
        config.blockwise.szx = 100;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("nstart")));
        assert!(errors.iter().any(|e| e.contains("szx")));
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = Config::from_toml(
            r#"
            max_message_size = 2048

            [transmission]
            max_retransmit = 2

            [blockwise]
            szx = 256
            "#,
        )
        .unwrap();
        assert_eq!(config.max_message_size, 2048);
        assert_eq!(config.transmission.max_retransmit, 2);
        assert_eq!(config.blockwise.preferred_szx(), Szx::S256);
        // Untouched sections keep defaults.
        assert_eq!(config.transmission.nstart, 1);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        assert!(Config::from_toml("[blockwise]\nszx = 100\n").is_err());
    }
}
