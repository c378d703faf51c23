//! Simulated SX127x transceiver.
//!
//! A register-level model good enough to drive the gateway without
//! hardware: a 128-byte register file, the 256-byte FIFO with its address
//! pointer, write-one-to-clear IRQ flags, and the operating modes that
//! matter to the gateway. Tests and the host binary push radio events in
//! through the `inject_*`/`complete_*` helpers; when an IRQ slot is
//! connected, each event also raises the matching DIO line.
//!
//! Clones share the same simulated chip.

use super::bus::{RegisterBus, RegisterError};
use super::channel::hz_from_frf;
use super::registers::*;
use crate::gateway::{Clock, DioLine, IrqSlot};
use std::sync::{Arc, Mutex, MutexGuard};

/// A frame the simulated radio was asked to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmittedFrame {
    pub payload: Vec<u8>,
    pub frequency_hz: u32,
    pub modem_config1: u8,
    pub modem_config2: u8,
    pub pa_config: u8,
    pub invert_iq: bool,
}

impl TransmittedFrame {
    /// Spreading factor from `REG_MODEM_CONFIG2`.
    pub fn spreading_factor(&self) -> u8 {
        self.modem_config2 >> 4
    }
}

struct SimState {
    regs: [u8; 0x80],
    fifo: [u8; 256],
    transmitted: Vec<TransmittedFrame>,
    fail_next: usize,
    auto_complete: bool,
    irq: Option<Arc<IrqSlot>>,
    clock: Clock,
    bus_transfers: u64,
}

impl SimState {
    fn mode(&self) -> u8 {
        self.regs[REG_OPMODE as usize] & opmode::MASK
    }

    fn raise(&mut self, flags: u8, line: DioLine) {
        self.regs[REG_IRQ_FLAGS as usize] |= flags;
        if let Some(irq) = &self.irq {
            irq.signal(line, self.clock.now_us() as u32);
        }
    }

    fn frequency_hz(&self) -> u32 {
        let frf = (self.regs[REG_FRF_MSB as usize] as u32) << 16
            | (self.regs[REG_FRF_MID as usize] as u32) << 8
            | self.regs[REG_FRF_LSB as usize] as u32;
        hz_from_frf(frf)
    }

    fn fifo_pointer(&mut self) -> &mut u8 {
        &mut self.regs[REG_FIFO_ADDR_PTR as usize]
    }

    fn set_mode(&mut self, value: u8) {
        self.regs[REG_OPMODE as usize] = value;
        match value & opmode::MASK {
            opmode::TX => {
                let base = self.regs[REG_FIFO_TX_BASE_ADDR as usize] as usize;
                let len = self.regs[REG_PAYLOAD_LENGTH as usize] as usize;
                let payload = (0..len).map(|i| self.fifo[(base + i) & 0xFF]).collect();
                let frame = TransmittedFrame {
                    payload,
                    frequency_hz: self.frequency_hz(),
                    modem_config1: self.regs[REG_MODEM_CONFIG1 as usize],
                    modem_config2: self.regs[REG_MODEM_CONFIG2 as usize],
                    pa_config: self.regs[REG_PA_CONFIG as usize],
                    invert_iq: self.regs[REG_INVERTIQ as usize] & INVERTIQ_TX != 0,
                };
                log::debug!(
                    "sim: TX {} bytes on {} Hz",
                    frame.payload.len(),
                    frame.frequency_hz
                );
                self.transmitted.push(frame);
                if self.auto_complete {
                    self.finish_tx();
                }
            }
            opmode::CAD if self.auto_complete => self.finish_cad(false),
            _ => {}
        }
    }

    fn finish_tx(&mut self) {
        self.regs[REG_OPMODE as usize] = opmode::LORA | opmode::STANDBY;
        self.raise(IrqFlags::TX_DONE, DioLine::Dio0);
    }

    fn finish_cad(&mut self, detected: bool) {
        self.regs[REG_OPMODE as usize] = opmode::LORA | opmode::STANDBY;
        if detected {
            self.regs[REG_IRQ_FLAGS as usize] |= IrqFlags::CAD_DETECTED;
            self.raise(IrqFlags::CAD_DONE, DioLine::Dio1);
        } else {
            self.raise(IrqFlags::CAD_DONE, DioLine::Dio0);
        }
    }

    fn load_rx(&mut self, payload: &[u8], pkt_rssi: u8, snr_quarter_db: i8, flags: u8) {
        let base = self.regs[REG_FIFO_RX_BASE_ADDR as usize];
        for (i, b) in payload.iter().enumerate() {
            self.fifo[(base as usize + i) & 0xFF] = *b;
        }
        self.regs[REG_FIFO_RX_CURRENT_ADDR as usize] = base;
        self.regs[REG_RX_NB_BYTES as usize] = payload.len() as u8;
        self.regs[REG_PKT_RSSI as usize] = pkt_rssi;
        self.regs[REG_PKT_SNR_VALUE as usize] = snr_quarter_db as u8;
        if self.mode() == opmode::RX_SINGLE {
            self.regs[REG_OPMODE as usize] = opmode::LORA | opmode::STANDBY;
        }
        self.raise(flags, DioLine::Dio0);
    }
}

/// Simulated transceiver, see the module documentation.
#[derive(Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRadio {
    pub fn new(variant: ChipVariant) -> Self {
        let mut regs = [0u8; 0x80];
        regs[REG_OPMODE as usize] = opmode::LORA | opmode::STANDBY;
        regs[REG_VERSION as usize] = variant.version();
        regs[REG_SYNC_WORD as usize] = 0x12;
        Self {
            state: Arc::new(Mutex::new(SimState {
                regs,
                fifo: [0; 256],
                transmitted: Vec::new(),
                fail_next: 0,
                auto_complete: false,
                irq: None,
                clock: Clock::new(),
                bus_transfers: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Raise DIO lines on `irq` for every simulated event from now on.
    pub fn connect_irq(&self, irq: Arc<IrqSlot>) {
        self.lock().irq = Some(irq);
    }

    /// Timestamp DIO events with `clock` instead of the simulator's own.
    pub fn set_clock(&self, clock: Clock) {
        self.lock().clock = clock;
    }

    /// Complete transmissions and CAD (without detection) as soon as they start.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.lock().auto_complete = enabled;
    }

    /// Deliver a packet as if it had just been demodulated.
    ///
    /// `pkt_rssi` is the raw `REG_PKT_RSSI` value and `snr_quarter_db` the
    /// raw SNR register (dB × 4).
    pub fn inject_packet(&self, payload: &[u8], pkt_rssi: u8, snr_quarter_db: i8) {
        self.lock().load_rx(
            payload,
            pkt_rssi,
            snr_quarter_db,
            IrqFlags::RX_DONE | IrqFlags::VALID_HEADER,
        );
    }

    /// Deliver a packet whose payload CRC did not match.
    pub fn inject_crc_error(&self, payload: &[u8]) {
        self.lock().load_rx(
            payload,
            60,
            0,
            IrqFlags::RX_DONE | IrqFlags::VALID_HEADER | IrqFlags::CRC_ERROR,
        );
    }

    /// Deliver an RX-done without a valid header.
    pub fn inject_bad_header(&self, payload: &[u8]) {
        self.lock().load_rx(payload, 60, 0, IrqFlags::RX_DONE);
    }

    pub fn inject_rx_timeout(&self) {
        let mut state = self.lock();
        state.regs[REG_OPMODE as usize] = opmode::LORA | opmode::STANDBY;
        state.raise(IrqFlags::RX_TIMEOUT, DioLine::Dio1);
    }

    pub fn complete_cad(&self, detected: bool) {
        self.lock().finish_cad(detected);
    }

    pub fn complete_tx(&self) {
        self.lock().finish_tx();
    }

    /// Set `REG_MODEM_STAT`, e.g. to [`MODEM_STAT_SIGNAL_DETECTED`] while a
    /// packet is being demodulated.
    pub fn set_modem_status(&self, status: u8) {
        self.lock().regs[REG_MODEM_STAT as usize] = status;
    }

    /// Make the next `n` bus transfers fail with a timeout.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    pub fn transmitted(&self) -> Vec<TransmittedFrame> {
        self.lock().transmitted.clone()
    }

    /// Operating mode bits of `REG_OPMODE`.
    pub fn mode(&self) -> u8 {
        self.lock().mode()
    }

    pub fn register(&self, addr: u8) -> u8 {
        self.lock().regs[(addr & 0x7F) as usize]
    }

    pub fn frequency_hz(&self) -> u32 {
        self.lock().frequency_hz()
    }

    pub fn bus_transfers(&self) -> u64 {
        self.lock().bus_transfers
    }
}

impl RegisterBus for SimulatedRadio {
    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), RegisterError> {
        let mut state = self.lock();
        state.bus_transfers += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RegisterError::BusTimeout);
        }
        let addr = addr & 0x7F;
        if addr == REG_FIFO {
            for b in buf.iter_mut() {
                let ptr = *state.fifo_pointer();
                *b = state.fifo[ptr as usize];
                *state.fifo_pointer() = ptr.wrapping_add(1);
            }
        } else {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = state.regs[(addr as usize + i) & 0x7F];
            }
        }
        Ok(())
    }

    fn write(&mut self, addr: u8, data: &[u8]) -> Result<(), RegisterError> {
        let mut state = self.lock();
        state.bus_transfers += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RegisterError::BusTimeout);
        }
        let addr = addr & 0x7F;
        match addr {
            REG_FIFO => {
                for b in data {
                    let ptr = *state.fifo_pointer();
                    state.fifo[ptr as usize] = *b;
                    *state.fifo_pointer() = ptr.wrapping_add(1);
                }
            }
            REG_IRQ_FLAGS => {
                if let Some(&mask) = data.first() {
                    state.regs[REG_IRQ_FLAGS as usize] &= !mask;
                }
            }
            REG_OPMODE => {
                if let Some(&value) = data.first() {
                    state.set_mode(value);
                }
            }
            REG_VERSION => {}
            _ => {
                for (i, b) in data.iter().enumerate() {
                    state.regs[(addr as usize + i) & 0x7F] = *b;
                }
            }
        }
        Ok(())
    }
}
