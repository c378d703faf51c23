//! Gateway configuration.
//!
//! Platform-independent and host-testable. The firmware builds the
//! configuration from its defaults; the host binary reads a JSON file. Every
//! field has a default, so a file only names what it changes:
//!
//! ```
//! use lora_1ch_gateway::config::GatewayConfig;
//!
//! let config = GatewayConfig::from_json(r#"{"spreading_factor": 9, "cad": true}"#).unwrap();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.pull_interval_secs, 55);
//! ```

use crate::gateway::{RadioSettings, MAX_DEBUG_LEVEL};
use crate::lora::{ChannelConfig, ChannelError, ChipVariant, FrequencyPlan, SpreadingFactor};
use crate::protocol::{ForwarderSettings, GatewayEui};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Default backend (host:port).
pub const DEFAULT_SERVER: &str = "thethings.meshed.com.au:1700";

/// Smallest accepted statistics ring.
pub const MIN_STAT_RECORDS: usize = 1;

/// Largest accepted statistics ring.
pub const MAX_STAT_RECORDS: usize = 256;

/// Who runs the gateway and where it stands, reported in `stat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayIdentity {
    pub description: String,
    pub email: String,
    pub platform: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres above sea level.
    pub altitude: i32,
}

impl Default for GatewayIdentity {
    fn default() -> Self {
        Self {
            description: "ESP LoRa Gateway".to_string(),
            email: String::new(),
            platform: "ESP32".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            altitude: 0,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Backend address, "host:port".
    pub server: String,
    /// Fixed gateway EUI. Derived from the Wi-Fi MAC when unset.
    pub gateway_eui: Option<GatewayEui>,
    pub identity: GatewayIdentity,

    pub pull_interval_secs: u64,
    pub stat_interval_secs: u64,
    pub ack_timeout_ms: u64,
    /// Honour MGT_RESET / MGT_SET_SF / MGT_SET_FREQ from the backend.
    pub udp_management: bool,

    /// Frequency plan; defaults to the region feature the firmware was built with.
    pub region: FrequencyPlan,
    pub chip: ChipVariant,
    /// Index into the plan's channel table.
    pub channel: u8,
    pub spreading_factor: u8,
    pub cad: bool,
    pub hop: bool,
    pub strict_single_channel: bool,
    /// Added to every downlink's target time.
    pub tx_delay_us: u64,

    pub stat_records: usize,
    /// 0 (errors only) to 4 (everything).
    pub debug_level: u8,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            gateway_eui: None,
            identity: GatewayIdentity::default(),
            pull_interval_secs: 55,
            stat_interval_secs: 120,
            ack_timeout_ms: 5_000,
            udp_management: false,
            region: FrequencyPlan::default(),
            chip: ChipVariant::default(),
            channel: 0,
            spreading_factor: 7,
            cad: false,
            hop: false,
            strict_single_channel: true,
            tx_delay_us: 0,
            stat_records: 20,
            debug_level: 1,
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::InvalidFormat(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::ServerEmpty);
        }
        if self.pull_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("pull_interval_secs"));
        }
        if self.stat_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("stat_interval_secs"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("ack_timeout_ms"));
        }
        if !(MIN_STAT_RECORDS..=MAX_STAT_RECORDS).contains(&self.stat_records) {
            return Err(ConfigError::StatRecords {
                len: self.stat_records,
                max: MAX_STAT_RECORDS,
            });
        }
        if self.debug_level > MAX_DEBUG_LEVEL {
            return Err(ConfigError::DebugLevel(self.debug_level));
        }
        self.channel_config()?;
        Ok(())
    }

    /// The receive channel described by this configuration.
    pub fn channel_config(&self) -> Result<ChannelConfig, ConfigError> {
        let sf = SpreadingFactor::try_from(self.spreading_factor)?;
        let mut config = ChannelConfig::from_plan(self.region, self.channel, sf)?;
        config.cad_enabled = self.cad;
        config.hop_enabled = self.hop;
        Ok(config)
    }

    pub fn radio_settings(&self) -> RadioSettings {
        RadioSettings {
            strict_single_channel: self.strict_single_channel,
            tx_delay: Duration::from_micros(self.tx_delay_us),
            ..RadioSettings::default()
        }
    }

    pub fn forwarder_settings(&self) -> ForwarderSettings {
        ForwarderSettings {
            pull_interval: Duration::from_secs(self.pull_interval_secs),
            stat_interval: Duration::from_secs(self.stat_interval_secs),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            management: self.udp_management,
            ..ForwarderSettings::default()
        }
    }
}

/// Errors that can occur while loading or validating the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Backend address is empty.
    ServerEmpty,
    /// A periodic interval is zero.
    ZeroInterval(&'static str),
    /// Statistics ring size out of range.
    StatRecords { len: usize, max: usize },
    /// Debug level above the maximum.
    DebugLevel(u8),
    /// Channel or spreading factor not usable with the plan.
    Channel(ChannelError),
    /// Not valid JSON for a configuration.
    InvalidFormat(String),
    /// Configuration file could not be read.
    Io(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerEmpty => write!(f, "server address cannot be empty"),
            Self::ZeroInterval(name) => write!(f, "{} must be greater than zero", name),
            Self::StatRecords { len, max } => {
                write!(f, "stat_records out of range: {} (1..={})", len, max)
            }
            Self::DebugLevel(level) => {
                write!(f, "debug level {} out of range (max {})", level, MAX_DEBUG_LEVEL)
            }
            Self::Channel(e) => write!(f, "invalid channel: {}", e),
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
            Self::Io(msg) => write!(f, "cannot read configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Channel(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChannelError> for ConfigError {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lora_1ch_gateway_macros::esp32_test;

    #[esp32_test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server, "thethings.meshed.com.au:1700");
        assert_eq!(config.stat_records, 20);
        assert!(config.strict_single_channel);
        assert!(!config.cad);
        assert!(!config.hop);
        assert!(!config.udp_management);

        let channel = config.channel_config().unwrap();
        assert_eq!(channel.spreading_factor, SpreadingFactor::Sf7);
        assert_eq!(Some(channel.frequency_hz), config.region.frequency(0));
    }

    #[esp32_test]
    fn test_partial_json_keeps_defaults() {
        let config = GatewayConfig::from_json(
            r#"{"region": "au915", "channel": 0, "spreading_factor": 10,
                "gateway_eui": "AA555A0000000101",
                "identity": {"description": "roof"}}"#,
        )
        .unwrap();
        assert_eq!(config.region, FrequencyPlan::Au915);
        assert_eq!(config.channel_config().unwrap().frequency_hz, 916_800_000);
        assert_eq!(
            config.gateway_eui,
            Some(GatewayEui([0xAA, 0x55, 0x5A, 0, 0, 0, 0x01, 0x01]))
        );
        assert_eq!(config.identity.description, "roof");
        assert_eq!(config.identity.platform, "ESP32");
        assert_eq!(config.pull_interval_secs, 55);
    }

    #[esp32_test]
    fn test_validation_errors() {
        let sf6 = GatewayConfig {
            spreading_factor: 6,
            ..GatewayConfig::default()
        };
        assert_eq!(
            sf6.validate(),
            Err(ConfigError::Channel(ChannelError::UnsupportedSpreadingFactor(6)))
        );

        let channel = GatewayConfig {
            channel: 200,
            ..GatewayConfig::default()
        };
        assert_eq!(
            channel.validate(),
            Err(ConfigError::Channel(ChannelError::UnknownChannel(200)))
        );

        let pull = GatewayConfig {
            pull_interval_secs: 0,
            ..GatewayConfig::default()
        };
        assert_eq!(
            pull.validate(),
            Err(ConfigError::ZeroInterval("pull_interval_secs"))
        );

        let debug = GatewayConfig {
            debug_level: 9,
            ..GatewayConfig::default()
        };
        assert_eq!(debug.validate(), Err(ConfigError::DebugLevel(9)));

        assert!(matches!(
            GatewayConfig::from_json("{\"server\": 5}"),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert!(matches!(
            GatewayConfig::from_json("{\"gateway_eui\": \"aééééééé1\"}"),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert_eq!(
            GatewayConfig::from_json("{\"server\": \" \"}"),
            Err(ConfigError::ServerEmpty)
        );
    }

    #[esp32_test]
    fn test_settings_follow_config() {
        let config = GatewayConfig {
            strict_single_channel: false,
            tx_delay_us: 1_500,
            pull_interval_secs: 30,
            udp_management: true,
            ..GatewayConfig::default()
        };
        let radio = config.radio_settings();
        assert!(!radio.strict_single_channel);
        assert_eq!(radio.tx_delay, Duration::from_micros(1_500));
        let fwd = config.forwarder_settings();
        assert_eq!(fwd.pull_interval, Duration::from_secs(30));
        assert!(fwd.management);
    }

    #[esp32_test]
    fn test_json_round_trip_of_defaults() {
        let json = GatewayConfig::default().to_json().unwrap();
        assert_eq!(GatewayConfig::from_json(&json).unwrap(), GatewayConfig::default());
    }
}
