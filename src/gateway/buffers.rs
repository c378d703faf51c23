//! Uplink and downlink frames and the single-slot holders that carry them
//! between the radio and the forwarder.
//!
//! The radio is half-duplex with one antenna, so there is never more than
//! one frame in flight in each direction. Frames move by value: the state
//! machine puts a received frame into the uplink slot and the forwarder
//! takes it out.

use crate::lora::{Bandwidth, CodingRate, Payload, SpreadingFactor};

/// A packet received from a node.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkFrame {
    pub payload: Payload,
    /// Radio clock (µs) at RX-done.
    pub received_at_us: u64,
    /// Wall clock (ms since the Unix epoch) at RX-done.
    pub received_unix_ms: i64,
    /// Packet RSSI in dBm, corrected for the chip variant.
    pub rssi_dbm: i16,
    pub snr_db: f32,
    pub spreading_factor: SpreadingFactor,
    pub bandwidth: Bandwidth,
    pub coding_rate: CodingRate,
    pub frequency_hz: u32,
    pub channel_index: u8,
}

impl UplinkFrame {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// LoRaWAN DevAddr bytes (FHDR after the MHDR byte), zeros for frames
    /// too short to carry one.
    pub fn node_address(&self) -> [u8; 4] {
        let mut addr = [0u8; 4];
        if self.payload.len() >= 5 {
            // DevAddr is little-endian on air
            for (i, b) in self.payload[1..5].iter().rev().enumerate() {
                addr[i] = *b;
            }
        }
        addr
    }
}

/// A packet the backend asked the gateway to transmit.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkFrame {
    pub payload: Payload,
    /// Radio clock (µs) at which transmission must start. Ignored when
    /// `immediate` is set.
    pub target_us: u64,
    pub immediate: bool,
    pub spreading_factor: SpreadingFactor,
    pub bandwidth: Bandwidth,
    pub coding_rate: CodingRate,
    pub frequency_hz: u32,
    pub tx_power_dbm: i8,
    pub invert_iq: bool,
    pub preamble: u16,
    pub crc: bool,
    /// Token of the PULL_RESP that carried the frame, echoed in TX_ACK.
    pub token: u16,
}

/// Result of a downlink request, reported to the backend in TX_ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Transmitted.
    Sent,
    /// Target time already passed.
    TooLate,
    /// Target time too far ahead to hold the frame.
    TooEarly,
    /// Another downlink is already pending.
    Collision,
    /// Frequency outside the plan.
    UnsupportedFrequency,
    /// The radio did not complete the transmission.
    Failed,
    /// The PULL_RESP could not be turned into a frame.
    Malformed,
}

/// Outcome of one downlink, matched to its PULL_RESP by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReport {
    pub token: u16,
    pub outcome: TxOutcome,
}

/// Holds at most one frame.
#[derive(Debug)]
pub struct FrameSlot<T> {
    frame: Option<T>,
}

impl<T> FrameSlot<T> {
    pub const fn new() -> Self {
        Self { frame: None }
    }

    /// Store `frame`, returning the unconsumed frame it displaced.
    pub fn put(&mut self, frame: T) -> Option<T> {
        self.frame.replace(frame)
    }

    pub fn take(&mut self) -> Option<T> {
        self.frame.take()
    }

    pub fn peek(&self) -> Option<&T> {
        self.frame.as_ref()
    }

    pub fn is_occupied(&self) -> bool {
        self.frame.is_some()
    }
}

impl<T> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lora_1ch_gateway_macros::esp32_test;

    fn uplink(payload: &[u8]) -> UplinkFrame {
        UplinkFrame {
            payload: Payload::from_slice(payload).unwrap(),
            received_at_us: 0,
            received_unix_ms: 0,
            rssi_dbm: -80,
            snr_db: 7.5,
            spreading_factor: SpreadingFactor::Sf7,
            bandwidth: Bandwidth::Khz125,
            coding_rate: CodingRate::Cr4_5,
            frequency_hz: 868_100_000,
            channel_index: 0,
        }
    }

    #[esp32_test]
    fn test_slot_put_returns_displaced() {
        let mut slot = FrameSlot::new();
        assert!(slot.put(uplink(&[1])).is_none());
        let displaced = slot.put(uplink(&[2])).unwrap();
        assert_eq!(displaced.payload.as_slice(), &[1]);
        assert_eq!(slot.take().unwrap().payload.as_slice(), &[2]);
        assert!(!slot.is_occupied());
        assert!(slot.take().is_none());
    }

    #[esp32_test]
    fn test_node_address_from_devaddr() {
        // MHDR 0x40 (unconfirmed up), DevAddr 0x26011BDA little-endian
        let frame = uplink(&[0x40, 0xDA, 0x1B, 0x01, 0x26, 0x00]);
        assert_eq!(frame.node_address(), [0x26, 0x01, 0x1B, 0xDA]);
        assert_eq!(uplink(&[0x40, 0x01]).node_address(), [0; 4]);
    }
}
