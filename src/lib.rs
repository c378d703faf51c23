//! Single-channel LoRa gateway firmware library.
//!
//! Drives one SX1276/SX1272 transceiver and forwards its traffic to a
//! LoRaWAN network server over the Semtech UDP packet forwarder protocol.
//! Everything except the SPI/GPIO backend in [`lora::esp`] is
//! platform-independent and tested on the host against the simulated
//! transceiver in [`lora::sim`].

pub mod config;
pub mod gateway;
pub mod lora;
pub mod protocol;

// Re-export commonly used items
pub use config::{ConfigError, GatewayConfig, GatewayIdentity};
pub use gateway::{Gateway, GatewayError, GatewayHandle, RadioState, StatsSnapshot};
pub use lora::{ChannelConfig, ChipVariant, FrequencyPlan, SimulatedRadio, SpreadingFactor};
pub use protocol::{GatewayEui, UdpTransport};
