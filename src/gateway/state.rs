//! Radio states and the allowed transitions between them.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of the radio cycle.
///
/// `Scan` is the hub: every path between listening and transmitting goes
/// through it, so the radio is never asked to transmit while it is still
/// configured for reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RadioState {
    Init = 0,
    Scan = 1,
    ActivityDetect = 2,
    Receiving = 3,
    Transmitting = 4,
    TransmitDone = 5,
}

impl RadioState {
    pub fn can_transition_to(self, to: RadioState) -> bool {
        use RadioState::*;
        matches!(
            (self, to),
            (Init, Scan)
                | (Scan, ActivityDetect)
                | (Scan, Receiving)
                | (Scan, Transmitting)
                | (ActivityDetect, Scan)
                | (ActivityDetect, Receiving)
                | (ActivityDetect, Transmitting)
                | (Receiving, Scan)
                | (Transmitting, TransmitDone)
                | (Transmitting, Scan)
                | (TransmitDone, Scan)
        )
    }

    /// Whether the radio can be retuned or start a transmission without
    /// aborting an exchange in progress.
    pub fn is_idle(self) -> bool {
        matches!(self, RadioState::Scan | RadioState::ActivityDetect)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Scan,
            2 => Self::ActivityDetect,
            3 => Self::Receiving,
            4 => Self::Transmitting,
            5 => Self::TransmitDone,
            _ => Self::Init,
        }
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Scan => "SCAN",
            Self::ActivityDetect => "CAD",
            Self::Receiving => "RX",
            Self::Transmitting => "TX",
            Self::TransmitDone => "TXDONE",
        };
        f.write_str(name)
    }
}

/// Read-only mirror of the current state for other threads.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(RadioState::Init as u8))
    }

    pub fn get(&self) -> RadioState {
        RadioState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn publish(&self, state: RadioState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lora_1ch_gateway_macros::esp32_test;

    const ALL: [RadioState; 6] = [
        RadioState::Init,
        RadioState::Scan,
        RadioState::ActivityDetect,
        RadioState::Receiving,
        RadioState::Transmitting,
        RadioState::TransmitDone,
    ];

    #[esp32_test]
    fn test_receiving_never_goes_straight_to_transmitting() {
        assert!(!RadioState::Receiving.can_transition_to(RadioState::Transmitting));
        assert!(!RadioState::Receiving.can_transition_to(RadioState::TransmitDone));
        assert!(RadioState::Receiving.can_transition_to(RadioState::Scan));
    }

    #[esp32_test]
    fn test_every_state_can_fall_back_to_scan() {
        for state in ALL {
            if state != RadioState::Scan {
                assert!(state.can_transition_to(RadioState::Scan), "{}", state);
            }
        }
    }

    #[esp32_test]
    fn test_init_only_leads_to_scan() {
        for to in ALL {
            assert_eq!(
                RadioState::Init.can_transition_to(to),
                to == RadioState::Scan
            );
        }
        for from in ALL {
            assert!(!from.can_transition_to(RadioState::Init));
        }
    }

    #[esp32_test]
    fn test_state_cell_mirror() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), RadioState::Init);
        for state in ALL {
            cell.publish(state);
            assert_eq!(cell.get(), state);
        }
    }
}
