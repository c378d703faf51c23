//! Gateway core.
//!
//! - [`state`]: radio states and the transition table
//! - [`machine`]: the radio state machine
//! - [`irq`]: interrupt hand-off from the DIO handlers
//! - [`buffers`]: uplink/downlink frames and their slots
//! - [`stats`]: message ring and counters
//! - [`handle`]: what the admin page, display and persistence layers see
//! - [`runner`]: the main loop tying radio and forwarder together

pub mod buffers;
pub mod clock;
pub mod handle;
pub mod irq;
pub mod machine;
pub mod runner;
pub mod state;
pub mod stats;

pub use buffers::{DownlinkFrame, FrameSlot, TxOutcome, TxReport, UplinkFrame};
pub use clock::{expand_tmst, unix_millis, Clock};
pub use handle::{level_filter, GatewayHandle, MAX_DEBUG_LEVEL};
pub use irq::{DioLine, IrqEvent, IrqSlot};
pub use machine::{RadioSettings, RadioStateMachine, MAX_TX_POWER_DBM, MIN_TX_POWER_DBM};
pub use runner::{Gateway, GatewayError, LOOP_PERIOD};
pub use state::{RadioState, StateCell};
pub use stats::{
    bump, StatCounters, StatRecord, StatRing, Statistics, StatsSnapshot, DEFAULT_STAT_RECORDS,
};
