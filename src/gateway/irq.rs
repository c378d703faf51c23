//! Interrupt hand-off slot.
//!
//! The DIO interrupt handler must not touch the SPI bus. It records which
//! line fired and when, and the main loop picks the event up with
//! [`IrqSlot::take`] and does the register work under the bus lock.
//!
//! The slot is lock-free and `const`-constructible so it can live in a
//! `static` on targets where the handler has no captured state.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Set in `pending` once the batch timestamp is stored.
const STAMPED: u8 = 0x80;

/// Transceiver DIO output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DioLine {
    /// RxDone, TxDone or CadDone depending on the mapping.
    Dio0,
    /// RxTimeout or CadDetected.
    Dio1,
    /// FHSS change channel (unused, wired on some boards).
    Dio2,
}

impl DioLine {
    fn mask(self) -> u8 {
        match self {
            Self::Dio0 => 0x01,
            Self::Dio1 => 0x02,
            Self::Dio2 => 0x04,
        }
    }
}

/// A batch of interrupt lines taken from the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqEvent {
    lines: u8,
    /// Low 32 bits of the radio clock (µs) when the first line fired.
    pub timestamp_us: u32,
}

impl IrqEvent {
    pub fn has(&self, line: DioLine) -> bool {
        self.lines & line.mask() != 0
    }
}

/// Single-producer (ISR) / single-consumer (main loop) event slot.
///
/// The handler and the loop may run on different cores. A batch only
/// becomes visible to [`IrqSlot::take`] after its timestamp is stored.
#[derive(Debug)]
pub struct IrqSlot {
    pending: AtomicU8,
    timestamp_us: AtomicU32,
    overruns: AtomicU32,
}

impl IrqSlot {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU8::new(0),
            timestamp_us: AtomicU32::new(0),
            overruns: AtomicU32::new(0),
        }
    }

    /// Record an interrupt. Safe to call from interrupt context.
    pub fn signal(&self, line: DioLine, now_us: u32) {
        let mask = line.mask();
        let previous = self.pending.fetch_or(mask, Ordering::AcqRel);
        if previous == 0 {
            // First line of a batch
            self.timestamp_us.store(now_us, Ordering::Relaxed);
            self.pending.fetch_or(STAMPED, Ordering::Release);
        } else if previous & mask != 0 {
            self.overruns.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take all pending lines, leaving the slot empty.
    ///
    /// A batch whose first handler is still storing the timestamp is left
    /// for the next call.
    pub fn take(&self) -> Option<IrqEvent> {
        if self.pending.load(Ordering::Acquire) & STAMPED == 0 {
            return None;
        }
        // No new batch can start until the swap below empties the slot.
        let timestamp_us = self.timestamp_us.load(Ordering::Relaxed);
        let lines = self.pending.swap(0, Ordering::AcqRel) & !STAMPED;
        Some(IrqEvent {
            lines,
            timestamp_us,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) & !STAMPED != 0
    }

    /// Number of times a line fired again before the main loop took it.
    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Default for IrqSlot {
    fn default() -> Self {
        Self::new()
    }
}
