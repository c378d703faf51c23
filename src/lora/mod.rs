//! SX127x LoRa transceiver support.
//!
//! This module contains:
//! - [`registers`]: register map, IRQ flags and chip variants
//! - [`bus`]: register transport trait and the locked register interface
//! - [`plan`]: regional frequency plans
//! - [`channel`]: modem parameters, datarate strings and channel programming
//! - [`sim`]: register-level simulated transceiver (host and tests)
//! - [`esp`]: SPI transport and DIO interrupts (ESP32 only)

pub mod bus;
pub mod channel;
pub mod plan;
pub mod registers;
pub mod sim;

#[cfg(feature = "esp32")]
pub mod esp;

pub use bus::{
    BusGuard, Payload, RegisterBus, RegisterError, RegisterInterface, BUS_TIMEOUT,
    MAX_PAYLOAD_LENGTH,
};
pub use channel::{
    airtime_us, apply_config, format_datarate, frf_from_hz, hz_from_frf, low_data_rate_optimize,
    parse_datarate, read_frequency, symbol_duration_us, Bandwidth, ChannelConfig, ChannelError,
    CodingRate, ModemRegisters, SpreadingFactor,
};
pub use plan::{FrequencyPlan, NUM_HOPS};
pub use registers::{ChipVariant, IrqFlags};
pub use sim::{SimulatedRadio, TransmittedFrame};

pub(crate) use channel::{write_frequency, write_hypothesis, write_modem};
