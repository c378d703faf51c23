//! Radio state machine.
//!
//! Drives the transceiver through listen, activity detection, receive and
//! transmit. Interrupt handlers only post DIO events to the [`IrqSlot`];
//! [`RadioStateMachine::poll`] consumes them from the main loop and performs
//! all register I/O under the bus lock.
//!
//! Within one `poll` an interrupt always wins: if an event was pending it is
//! handled and the timer-driven work (CAD tick, downlink start, watchdogs)
//! waits for the next call. Timer work uses `try_transaction`, so it also
//! yields to anyone already holding the bus.

use super::buffers::{DownlinkFrame, FrameSlot, TxOutcome, TxReport, UplinkFrame};
use super::clock::{expand_tmst, unix_millis};
use super::handle::GatewayHandle;
use super::irq::{IrqEvent, IrqSlot};
use super::runner::GatewayError;
use super::state::RadioState;
use super::stats::{bump, StatRecord};
use crate::lora::registers::*;
use crate::lora::{
    apply_config, symbol_duration_us, write_frequency, write_hypothesis, write_modem, BusGuard,
    ChannelConfig, ChannelError, FrequencyPlan, RegisterBus, RegisterError, RegisterInterface,
    SpreadingFactor, MAX_PAYLOAD_LENGTH,
};
use heapless::Deque;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Margin added to the two-symbol CAD window before it is considered lost.
const CAD_MARGIN_US: u64 = 2_000;

/// Pending TX reports kept for TX_ACK.
const MAX_TX_REPORTS: usize = 8;

/// Preamble restored after a transmission.
const RX_PREAMBLE: u16 = 8;

/// Lowest and highest transmit power supported on PA_BOOST.
pub const MIN_TX_POWER_DBM: i8 = 2;
pub const MAX_TX_POWER_DBM: i8 = 20;

/// Timing and policy knobs of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct RadioSettings {
    /// Force downlinks onto the receive channel and spreading factor.
    pub strict_single_channel: bool,
    /// Delay before the next CAD after a receive or transmit.
    pub cad_interval: Duration,
    /// Longest single receive after a CAD detection.
    pub rx_watchdog: Duration,
    /// Longest transmission before it is reported failed.
    pub tx_watchdog: Duration,
    /// Compensation added to each downlink's target time.
    pub tx_delay: Duration,
    /// How far past its target a downlink may still start.
    pub late_tolerance: Duration,
    /// How far ahead a downlink may be scheduled.
    pub max_lead: Duration,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            strict_single_channel: true,
            cad_interval: Duration::from_millis(10),
            rx_watchdog: Duration::from_secs(5),
            tx_watchdog: Duration::from_secs(5),
            tx_delay: Duration::ZERO,
            late_tolerance: Duration::from_millis(5),
            max_lead: Duration::from_secs(3),
        }
    }
}

/// PA_CONFIG and PA_DAC values for `power_dbm` on the PA_BOOST pin.
fn pa_settings(power_dbm: i8) -> (u8, u8) {
    let power = power_dbm.clamp(MIN_TX_POWER_DBM, MAX_TX_POWER_DBM);
    if power > 17 {
        (PA_BOOST | 0x70 | (power - 5) as u8, PADAC_HIGH_POWER)
    } else {
        (PA_BOOST | 0x70 | (power - 2) as u8, PADAC_DEFAULT)
    }
}

/// Receive-side settings that a transmission changes.
fn restore_rx<B: RegisterBus>(bus: &mut BusGuard<'_, B>) -> Result<(), RegisterError> {
    bus.write_register(REG_INVERTIQ, INVERTIQ_OFF)?;
    bus.write_register(REG_PREAMBLE_MSB, (RX_PREAMBLE >> 8) as u8)?;
    bus.write_register(REG_PREAMBLE_LSB, RX_PREAMBLE as u8)?;
    bus.write_register(REG_PAYLOAD_LENGTH, 0x40)
}

pub struct RadioStateMachine<B: RegisterBus> {
    regs: RegisterInterface<B>,
    variant: ChipVariant,
    plan: FrequencyPlan,
    config: ChannelConfig,
    settings: RadioSettings,
    handle: GatewayHandle,
    irq: Arc<IrqSlot>,

    state: RadioState,
    /// Radio clock when the current state was entered.
    entered_us: u64,
    next_cad_us: u64,
    cad_sf: SpreadingFactor,
    hop_index: usize,

    uplink: FrameSlot<UplinkFrame>,
    downlink: FrameSlot<DownlinkFrame>,
    in_flight: Option<DownlinkFrame>,
    reports: Deque<TxReport, MAX_TX_REPORTS>,

    #[cfg(test)]
    trace: Vec<(RadioState, RadioState)>,
}

impl<B: RegisterBus> RadioStateMachine<B> {
    pub fn new(
        regs: RegisterInterface<B>,
        variant: ChipVariant,
        settings: RadioSettings,
        handle: GatewayHandle,
    ) -> Self {
        Self {
            regs,
            variant,
            plan: handle.plan(),
            config: handle.config(),
            settings,
            irq: handle.irq(),
            handle,
            state: RadioState::Init,
            entered_us: 0,
            next_cad_us: 0,
            cad_sf: SpreadingFactor::Sf7,
            hop_index: 0,
            uplink: FrameSlot::new(),
            downlink: FrameSlot::new(),
            in_flight: None,
            reports: Deque::new(),
            #[cfg(test)]
            trace: Vec::new(),
        }
    }

    pub fn state(&self) -> RadioState {
        self.state
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn settings(&self) -> &RadioSettings {
        &self.settings
    }

    /// Verify the chip, apply the channel and start listening.
    pub fn start(&mut self, now_us: u64) -> Result<(), GatewayError> {
        let found = self.regs.read_register(REG_VERSION)?;
        if found != self.variant.version() {
            return Err(GatewayError::ChipVersion {
                expected: self.variant.version(),
                found,
            });
        }

        apply_config(&self.regs, &self.config, self.plan, self.variant, self.state)?;
        let pa_dac = self.variant.pa_dac_register();
        self.regs.transaction(|bus| {
            bus.write_register(REG_IRQ_FLAGS_MASK, 0x00)?;
            bus.write_register(REG_IRQ_FLAGS, IrqFlags::ALL)?;
            bus.write_register(pa_dac, PADAC_DEFAULT)
        })?;

        info!(
            "{} ready on {} {:.3} MHz {} (CAD {}, hop {})",
            self.variant.name(),
            self.plan.name(),
            self.config.frequency_hz as f64 / 1e6,
            self.config.spreading_factor,
            if self.config.cad_enabled { "on" } else { "off" },
            if self.config.hop_enabled { "on" } else { "off" },
        );

        self.transition(RadioState::Scan, now_us);
        self.listen(now_us)?;
        Ok(())
    }

    /// Handle a posted interrupt if there is one, otherwise run the timers.
    pub fn poll(&mut self, now_us: u64) {
        if let Some(event) = self.irq.take() {
            self.handle_interrupt(event, now_us);
            return;
        }
        self.poll_timers(now_us);
    }

    /// Take the last received frame.
    pub fn take_uplink(&mut self) -> Option<UplinkFrame> {
        self.uplink.take()
    }

    pub fn take_tx_report(&mut self) -> Option<TxReport> {
        self.reports.pop_front()
    }

    pub fn has_pending_downlink(&self) -> bool {
        self.downlink.is_occupied() || self.in_flight.is_some()
    }

    /// Accept a downlink for transmission at its target time.
    ///
    /// Rejections are returned as the TX_ACK outcome to report; accepted
    /// frames are reported once transmitted, missed or failed.
    pub fn schedule_downlink(
        &mut self,
        mut frame: DownlinkFrame,
        now_us: u64,
    ) -> Result<(), TxOutcome> {
        let stats = self.handle.statistics();
        stats.update(|c| bump(&mut c.downlinks_received));

        if let Err(outcome) = self.check_downlink(&mut frame, now_us) {
            warn!(
                "Rejected downlink of {} bytes on {} Hz: {:?}",
                frame.payload.len(),
                frame.frequency_hz,
                outcome
            );
            stats.update(|c| bump(&mut c.downlinks_rejected));
            return Err(outcome);
        }

        debug!(
            "Scheduled downlink of {} bytes at {} us ({})",
            frame.payload.len(),
            frame.target_us,
            if frame.immediate { "immediate" } else { "timed" }
        );
        self.downlink.put(frame);
        Ok(())
    }

    fn check_downlink(&self, frame: &mut DownlinkFrame, now_us: u64) -> Result<(), TxOutcome> {
        if self.has_pending_downlink() {
            return Err(TxOutcome::Collision);
        }

        if self.settings.strict_single_channel {
            if frame.frequency_hz != self.config.frequency_hz
                || frame.spreading_factor != self.config.spreading_factor
            {
                debug!(
                    "Strict single channel: downlink {} Hz {} moved to {} Hz {}",
                    frame.frequency_hz,
                    frame.spreading_factor,
                    self.config.frequency_hz,
                    self.config.spreading_factor
                );
            }
            frame.frequency_hz = self.config.frequency_hz;
            frame.spreading_factor = self.config.spreading_factor;
            frame.bandwidth = self.config.bandwidth;
        } else if !self.plan.contains(frame.frequency_hz) {
            return Err(TxOutcome::UnsupportedFrequency);
        }

        let clamped = frame
            .tx_power_dbm
            .clamp(MIN_TX_POWER_DBM, MAX_TX_POWER_DBM);
        if clamped != frame.tx_power_dbm {
            warn!(
                "Downlink power {} dBm clamped to {} dBm",
                frame.tx_power_dbm, clamped
            );
            frame.tx_power_dbm = clamped;
        }

        if !frame.immediate {
            let due = self.due_at(frame);
            if now_us > due + self.settings.late_tolerance.as_micros() as u64 {
                return Err(TxOutcome::TooLate);
            }
            if due > now_us + self.settings.max_lead.as_micros() as u64 {
                return Err(TxOutcome::TooEarly);
            }
        }
        Ok(())
    }

    /// Apply a new channel configuration, quiescing the radio first.
    ///
    /// A rejected configuration leaves the previous one in force.
    pub fn reconfigure(&mut self, config: ChannelConfig, now_us: u64) -> Result<(), ChannelError> {
        if matches!(
            self.state,
            RadioState::Transmitting | RadioState::TransmitDone
        ) {
            return Err(ChannelError::NotQuiesced(self.state));
        }
        config.validate(self.plan)?;

        if matches!(
            self.state,
            RadioState::ActivityDetect | RadioState::Receiving
        ) {
            if let Err(e) = self
                .regs
                .transaction(|bus| bus.write_register(REG_OPMODE, opmode::LORA | opmode::STANDBY))
            {
                self.recover(e.clone(), now_us);
                return Err(ChannelError::Register(e));
            }
            self.transition(RadioState::Scan, now_us);
        }

        let result = apply_config(&self.regs, &config, self.plan, self.variant, self.state);
        match &result {
            Ok(()) => {
                info!(
                    "Reconfigured to {:.3} MHz {} (CAD {}, hop {})",
                    config.frequency_hz as f64 / 1e6,
                    config.spreading_factor,
                    config.cad_enabled,
                    config.hop_enabled
                );
                self.config = config;
                self.cad_sf = SpreadingFactor::Sf7;
                self.hop_index = 0;
                self.handle.mirror_config(config);
            }
            Err(ChannelError::Register(e)) => {
                // Registers may hold part of the new configuration; re-arm with the old one.
                self.recover(e.clone(), now_us);
                return result;
            }
            Err(e) => warn!("Reconfiguration rejected: {}", e),
        }

        if self.state == RadioState::Scan {
            self.relisten(now_us);
        }
        result
    }

    fn transition(&mut self, to: RadioState, now_us: u64) {
        if !self.state.can_transition_to(to) {
            error!("Refusing radio transition {} -> {}", self.state, to);
            return;
        }
        debug!("Radio {} -> {}", self.state, to);
        #[cfg(test)]
        self.trace.push((self.state, to));
        self.state = to;
        self.entered_us = now_us;
        self.handle.publish_state(to);
    }

    /// Frequency and spreading factor currently listened on.
    fn hypothesis(&self) -> (u32, SpreadingFactor) {
        if !self.config.cad_enabled {
            return (self.config.frequency_hz, self.config.spreading_factor);
        }
        let frequency = if self.config.hop_enabled {
            let hops = self.plan.hop_channels();
            hops[self.hop_index % hops.len()]
        } else {
            self.config.frequency_hz
        };
        (frequency, self.cad_sf)
    }

    /// Next SF of the sweep; after SF12 the hop channel advances.
    fn advance_hypothesis(&mut self) {
        self.cad_sf = self.cad_sf.next_wrapping();
        if self.cad_sf == SpreadingFactor::Sf7 && self.config.hop_enabled {
            self.hop_index = (self.hop_index + 1) % self.plan.hop_channels().len();
            debug!("Hop to channel {}", self.hop_index);
        }
    }

    fn cad_window_us(&self) -> u64 {
        2 * symbol_duration_us(self.cad_sf, self.config.bandwidth) + CAD_MARGIN_US
    }

    fn due_at(&self, frame: &DownlinkFrame) -> u64 {
        frame.target_us + self.settings.tx_delay.as_micros() as u64
    }

    /// Put the radio back in its listening configuration. Only called in `Scan`.
    fn listen(&mut self, now_us: u64) -> Result<(), RegisterError> {
        let config = self.config;
        let variant = self.variant;
        if config.cad_enabled {
            self.regs.transaction(|bus| {
                bus.write_register(REG_OPMODE, opmode::LORA | opmode::STANDBY)?;
                restore_rx(bus)
            })?;
            self.next_cad_us = now_us + self.settings.cad_interval.as_micros() as u64;
            return Ok(());
        }

        self.regs.transaction(|bus| {
            write_hypothesis(
                bus,
                variant,
                &config,
                config.frequency_hz,
                config.spreading_factor,
            )?;
            restore_rx(bus)?;
            bus.write_register(
                REG_DIO_MAPPING_1,
                dio::DIO0_RX_DONE | dio::DIO1_RX_TIMEOUT | dio::DIO2_NOP,
            )?;
            bus.write_register(REG_FIFO_ADDR_PTR, FIFO_RX_BASE)?;
            bus.write_register(REG_IRQ_FLAGS, IrqFlags::ALL)?;
            bus.write_register(REG_OPMODE, opmode::LORA | opmode::RX_CONTINUOUS)
        })?;
        self.transition(RadioState::Receiving, now_us);
        Ok(())
    }

    fn relisten(&mut self, now_us: u64) {
        if let Err(e) = self.listen(now_us) {
            self.recover(e, now_us);
        }
    }

    /// Register failure: count it, fall back to `Scan` and try to listen again.
    fn recover(&mut self, err: RegisterError, now_us: u64) {
        warn!("Register error in state {}: {}", self.state, err);
        let stats = self.handle.statistics();
        stats.update(|c| bump(&mut c.bus_errors));

        if let Some(frame) = self.in_flight.take() {
            stats.update(|c| bump(&mut c.tx_failed));
            self.push_report(frame.token, TxOutcome::Failed);
        }
        if self.state != RadioState::Scan {
            self.transition(RadioState::Scan, now_us);
        }
        // A second failure leaves the machine in Scan; the next poll retries.
        if let Err(e) = self.listen(now_us) {
            warn!("Could not re-arm receiver: {}", e);
        }
    }

    fn push_report(&mut self, token: u16, outcome: TxOutcome) {
        if self.reports.is_full() {
            warn!("TX report queue full, dropping oldest report");
            self.reports.pop_front();
        }
        // Cannot fail: a slot was freed above.
        let _ = self.reports.push_back(TxReport { token, outcome });
    }

    fn handle_interrupt(&mut self, event: IrqEvent, now_us: u64) {
        let flags = match self.regs.transaction(|bus| {
            let flags = bus.read_register(REG_IRQ_FLAGS)?;
            bus.write_register(REG_IRQ_FLAGS, IrqFlags::ALL)?;
            Ok(IrqFlags(flags))
        }) {
            Ok(flags) => flags,
            Err(e) => {
                self.recover(e, now_us);
                return;
            }
        };

        match self.state {
            RadioState::ActivityDetect => self.on_cad_interrupt(flags, now_us),
            RadioState::Receiving => self.on_rx_interrupt(flags, event, now_us),
            RadioState::Transmitting => self.on_tx_interrupt(flags, now_us),
            other => debug!("Ignoring interrupt flags {:#04x} in {}", flags.0, other),
        }
    }

    fn on_cad_interrupt(&mut self, flags: IrqFlags, now_us: u64) {
        if flags.contains(IrqFlags::CAD_DETECTED) {
            self.handle
                .statistics()
                .update(|c| bump(&mut c.cad_detected));
            let result = self.regs.transaction(|bus| {
                bus.write_register(
                    REG_DIO_MAPPING_1,
                    dio::DIO0_RX_DONE | dio::DIO1_RX_TIMEOUT | dio::DIO2_NOP,
                )?;
                bus.write_register(REG_FIFO_ADDR_PTR, FIFO_RX_BASE)?;
                bus.write_register(REG_IRQ_FLAGS, IrqFlags::ALL)?;
                bus.write_register(REG_OPMODE, opmode::LORA | opmode::RX_SINGLE)
            });
            match result {
                Ok(()) => {
                    debug!("CAD detected on {:?}", self.hypothesis());
                    self.transition(RadioState::Receiving, now_us);
                }
                Err(e) => self.recover(e, now_us),
            }
        } else if flags.contains(IrqFlags::CAD_DONE) {
            self.cad_idle(now_us);
        } else {
            debug!("Unexpected flags {:#04x} during CAD", flags.0);
        }
    }

    /// CAD finished without activity: next hypothesis, CAD again at once.
    fn cad_idle(&mut self, now_us: u64) {
        self.handle
            .statistics()
            .update(|c| bump(&mut c.cad_no_activity));
        self.advance_hypothesis();
        self.transition(RadioState::Scan, now_us);
        self.next_cad_us = now_us;
    }

    fn on_rx_interrupt(&mut self, flags: IrqFlags, event: IrqEvent, now_us: u64) {
        if flags.contains(IrqFlags::RX_DONE) {
            if let Err(e) = self.read_packet(flags, event, now_us) {
                // Torn receive, the frame is lost
                self.recover(e, now_us);
                return;
            }
        } else if flags.contains(IrqFlags::RX_TIMEOUT) {
            debug!("RX timeout");
            self.handle
                .statistics()
                .update(|c| bump(&mut c.rx_timeouts));
        } else {
            debug!("Unexpected flags {:#04x} while receiving", flags.0);
            return;
        }
        self.transition(RadioState::Scan, now_us);
        self.relisten(now_us);
    }

    fn read_packet(
        &mut self,
        flags: IrqFlags,
        event: IrqEvent,
        now_us: u64,
    ) -> Result<(), RegisterError> {
        let stats = self.handle.statistics();
        if flags.contains(IrqFlags::CRC_ERROR) {
            warn!("Dropped frame with CRC error");
            stats.update(|c| bump(&mut c.rx_crc_errors));
            return Ok(());
        }
        if !flags.contains(IrqFlags::VALID_HEADER) {
            warn!("Dropped frame without valid header");
            stats.update(|c| bump(&mut c.rx_bad_header));
            return Ok(());
        }

        let packet = self.regs.transaction(|bus| {
            let len = bus.read_register(REG_RX_NB_BYTES)? as usize;
            if len == 0 || len > MAX_PAYLOAD_LENGTH {
                return Ok(Err(len));
            }
            let current = bus.read_register(REG_FIFO_RX_CURRENT_ADDR)?;
            bus.write_register(REG_FIFO_ADDR_PTR, current)?;
            let payload = bus.read_fifo(len)?;
            let snr = bus.read_register(REG_PKT_SNR_VALUE)? as i8;
            let rssi = bus.read_register(REG_PKT_RSSI)?;
            Ok(Ok((payload, snr, rssi)))
        })?;

        let (payload, snr_raw, rssi_raw) = match packet {
            Ok(packet) => packet,
            Err(len) => {
                warn!("Dropped malformed frame of length {}", len);
                stats.update(|c| bump(&mut c.rx_bad_header));
                return Ok(());
            }
        };

        let snr_db = snr_raw as f32 / 4.0;
        let mut rssi_dbm = rssi_raw as i16 - self.variant.rssi_correction();
        if snr_raw < 0 {
            rssi_dbm += snr_raw as i16 / 4;
        }
        let (frequency_hz, spreading_factor) = self.hypothesis();
        let channel_index = self.plan.channel_index(frequency_hz).unwrap_or(0);

        let frame = UplinkFrame {
            payload,
            received_at_us: expand_tmst(event.timestamp_us, now_us),
            received_unix_ms: unix_millis(),
            rssi_dbm,
            snr_db,
            spreading_factor,
            bandwidth: self.config.bandwidth,
            coding_rate: self.config.coding_rate,
            frequency_hz,
            channel_index,
        };
        debug!(
            "RX {} bytes on {} Hz {} rssi {} dBm snr {:.1} dB",
            frame.len(),
            frequency_hz,
            spreading_factor,
            rssi_dbm,
            snr_db
        );

        stats.record_uplink(StatRecord {
            timestamp_ms: frame.received_unix_ms,
            node_address: frame.node_address(),
            channel_index,
            spreading_factor,
            rssi_dbm,
        });
        if self.uplink.put(frame).is_some() {
            warn!("Uplink frame overwritten before it was forwarded");
            stats.update(|c| bump(&mut c.uplinks_dropped));
        }
        Ok(())
    }

    fn on_tx_interrupt(&mut self, flags: IrqFlags, now_us: u64) {
        if !flags.contains(IrqFlags::TX_DONE) {
            debug!("Unexpected flags {:#04x} while transmitting", flags.0);
            return;
        }
        self.transition(RadioState::TransmitDone, now_us);
        if let Some(frame) = self.in_flight.take() {
            info!(
                "TX done: {} bytes on {} Hz {}",
                frame.payload.len(),
                frame.frequency_hz,
                frame.spreading_factor
            );
            self.handle.statistics().update(|c| bump(&mut c.tx_ok));
            self.push_report(frame.token, TxOutcome::Sent);
        }
        self.transition(RadioState::Scan, now_us);
        self.relisten(now_us);
    }

    fn poll_timers(&mut self, now_us: u64) {
        if self.poll_downlink(now_us) {
            return;
        }

        let elapsed = now_us.saturating_sub(self.entered_us);
        match self.state {
            RadioState::Scan => {
                if !self.config.cad_enabled {
                    self.relisten(now_us);
                } else if now_us >= self.next_cad_us {
                    self.start_cad(now_us);
                }
            }
            RadioState::ActivityDetect => {
                if elapsed >= self.cad_window_us() {
                    debug!("CAD window elapsed on {:?}", self.hypothesis());
                    self.cad_idle(now_us);
                }
            }
            RadioState::Receiving => {
                if self.config.cad_enabled
                    && elapsed >= self.settings.rx_watchdog.as_micros() as u64
                {
                    warn!("Receive watchdog expired");
                    self.handle
                        .statistics()
                        .update(|c| bump(&mut c.rx_timeouts));
                    self.transition(RadioState::Scan, now_us);
                    self.relisten(now_us);
                }
            }
            RadioState::Transmitting => {
                if elapsed >= self.settings.tx_watchdog.as_micros() as u64 {
                    warn!("Transmit watchdog expired");
                    if let Some(frame) = self.in_flight.take() {
                        self.handle
                            .statistics()
                            .update(|c| bump(&mut c.tx_failed));
                        self.push_report(frame.token, TxOutcome::Failed);
                    }
                    self.transition(RadioState::Scan, now_us);
                    self.relisten(now_us);
                }
            }
            RadioState::Init | RadioState::TransmitDone => {}
        }
    }

    fn start_cad(&mut self, now_us: u64) {
        let (frequency, sf) = self.hypothesis();
        let config = self.config;
        let variant = self.variant;
        let result = self.regs.try_transaction(|bus| {
            write_hypothesis(bus, variant, &config, frequency, sf)?;
            bus.write_register(
                REG_DIO_MAPPING_1,
                dio::DIO0_CAD_DONE | dio::DIO1_CAD_DETECTED | dio::DIO2_NOP,
            )?;
            bus.write_register(REG_IRQ_FLAGS, IrqFlags::ALL)?;
            bus.write_register(REG_OPMODE, opmode::LORA | opmode::CAD)
        });
        match result {
            Ok(()) => self.transition(RadioState::ActivityDetect, now_us),
            Err(RegisterError::Busy) => {}
            Err(e) => self.recover(e, now_us),
        }
    }

    /// Drop a stale downlink or start a due one. Returns true when the
    /// radio was handed to the transmitter.
    fn poll_downlink(&mut self, now_us: u64) -> bool {
        if matches!(
            self.state,
            RadioState::Init | RadioState::Transmitting | RadioState::TransmitDone
        ) {
            return false;
        }
        let Some(frame) = self.downlink.peek() else {
            return false;
        };

        let due = self.due_at(frame);
        if !frame.immediate && now_us > due + self.settings.late_tolerance.as_micros() as u64 {
            if let Some(frame) = self.downlink.take() {
                warn!(
                    "Missed downlink window by {} us, dropping frame",
                    now_us - due
                );
                self.handle
                    .statistics()
                    .update(|c| bump(&mut c.missed_downlinks));
                self.push_report(frame.token, TxOutcome::TooLate);
            }
            return false;
        }
        if !frame.immediate && now_us < due {
            return false;
        }

        match self.state {
            RadioState::Scan | RadioState::ActivityDetect => {}
            RadioState::Receiving => {
                if self.config.cad_enabled {
                    // single receive after a detection, wait for its end
                    return false;
                }
                match self
                    .regs
                    .try_transaction(|bus| bus.read_register(REG_MODEM_STAT))
                {
                    Ok(status) if status & MODEM_STAT_SIGNAL_DETECTED != 0 => {
                        debug!("Downlink deferred, packet being demodulated");
                        return false;
                    }
                    Ok(_) => self.transition(RadioState::Scan, now_us),
                    Err(RegisterError::Busy) => return false,
                    Err(e) => {
                        self.recover(e, now_us);
                        return false;
                    }
                }
            }
            _ => return false,
        }

        self.start_tx(now_us)
    }

    fn start_tx(&mut self, now_us: u64) -> bool {
        let Some(frame) = self.downlink.take() else {
            return false;
        };
        let variant = self.variant;
        let (pa_config, pa_dac) = pa_settings(frame.tx_power_dbm);
        let result = self.regs.try_transaction(|bus| {
            bus.write_register(REG_OPMODE, opmode::LORA | opmode::STANDBY)?;
            write_frequency(bus, frame.frequency_hz)?;
            write_modem(
                bus,
                variant,
                frame.spreading_factor,
                frame.bandwidth,
                frame.coding_rate,
                frame.crc,
            )?;
            bus.write_register(REG_PA_CONFIG, pa_config)?;
            bus.write_register(variant.pa_dac_register(), pa_dac)?;
            bus.write_register(REG_PREAMBLE_MSB, (frame.preamble >> 8) as u8)?;
            bus.write_register(REG_PREAMBLE_LSB, frame.preamble as u8)?;
            let iq = if frame.invert_iq {
                INVERTIQ_OFF | INVERTIQ_TX
            } else {
                INVERTIQ_OFF
            };
            bus.write_register(REG_INVERTIQ, iq)?;
            bus.write_register(
                REG_DIO_MAPPING_1,
                dio::DIO0_TX_DONE | dio::DIO1_NOP | dio::DIO2_NOP,
            )?;
            bus.write_register(REG_FIFO_TX_BASE_ADDR, FIFO_TX_BASE)?;
            bus.write_register(REG_FIFO_ADDR_PTR, FIFO_TX_BASE)?;
            bus.write_register(REG_PAYLOAD_LENGTH, frame.payload.len() as u8)?;
            bus.write_fifo(&frame.payload)?;
            bus.write_register(REG_IRQ_FLAGS, IrqFlags::ALL)?;
            bus.write_register(REG_OPMODE, opmode::LORA | opmode::TX)
        });

        match result {
            Ok(()) => {
                debug!(
                    "TX start: {} bytes on {} Hz {} {} dBm",
                    frame.payload.len(),
                    frame.frequency_hz,
                    frame.spreading_factor,
                    frame.tx_power_dbm
                );
                self.in_flight = Some(frame);
                self.transition(RadioState::Transmitting, now_us);
                true
            }
            Err(RegisterError::Busy) => {
                self.downlink.put(frame);
                false
            }
            Err(e) => {
                self.in_flight = Some(frame);
                self.recover(e, now_us);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::sim::SimulatedRadio;
    use crate::lora::{Bandwidth, CodingRate, Payload};
    use lora_1ch_gateway_macros::esp32_test;

    struct Rig {
        radio: SimulatedRadio,
        machine: RadioStateMachine<SimulatedRadio>,
        handle: GatewayHandle,
    }

    fn rig(plan: FrequencyPlan, config: ChannelConfig, settings: RadioSettings) -> Rig {
        let radio = SimulatedRadio::new(ChipVariant::Sx1276);
        let handle = GatewayHandle::new(plan, config, 20);
        radio.connect_irq(handle.irq());
        let machine = RadioStateMachine::new(
            RegisterInterface::new(radio.clone()),
            ChipVariant::Sx1276,
            settings,
            handle.clone(),
        );
        Rig {
            radio,
            machine,
            handle,
        }
    }

    fn au915_sf7() -> ChannelConfig {
        ChannelConfig::from_plan(FrequencyPlan::Au915, 0, SpreadingFactor::Sf7).unwrap()
    }

    fn downlink(target_us: u64, token: u16) -> DownlinkFrame {
        DownlinkFrame {
            payload: Payload::from_slice(&[0x60, 1, 2, 3]).unwrap(),
            target_us,
            immediate: false,
            spreading_factor: SpreadingFactor::Sf7,
            bandwidth: Bandwidth::Khz125,
            coding_rate: CodingRate::Cr4_5,
            frequency_hz: 916_800_000,
            tx_power_dbm: 14,
            invert_iq: true,
            preamble: 8,
            crc: false,
            token,
        }
    }

    #[esp32_test]
    fn test_continuous_receive_scenario() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();
        assert_eq!(
            rig.machine.trace,
            vec![
                (RadioState::Init, RadioState::Scan),
                (RadioState::Scan, RadioState::Receiving)
            ]
        );
        assert_eq!(rig.handle.state(), RadioState::Receiving);
        assert_eq!(rig.radio.mode(), opmode::RX_CONTINUOUS);
        assert!(rig.radio.frequency_hz().abs_diff(916_800_000) <= 62);

        let payload: Vec<u8> = (0..20).collect();
        rig.radio.inject_packet(&payload, 100, 28);
        rig.machine.poll(1_000);

        let frame = rig.machine.take_uplink().unwrap();
        assert_eq!(frame.len(), 20);
        assert_eq!(frame.payload.as_slice(), payload.as_slice());
        assert_eq!(frame.spreading_factor, SpreadingFactor::Sf7);
        assert_eq!(frame.rssi_dbm, 100 - 157);
        assert_eq!(frame.snr_db, 7.0);
        assert_eq!(frame.channel_index, 0);

        let counters = rig.handle.stats().counters;
        assert_eq!(counters.sf_count(SpreadingFactor::Sf7), 1);
        assert_eq!(counters.rx_ok, 1);
        assert_eq!(rig.machine.state(), RadioState::Receiving);
        assert!(rig.machine.take_uplink().is_none());
    }

    #[esp32_test]
    fn test_crc_error_and_bad_header_dropped() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();

        rig.radio.inject_crc_error(&[1, 2, 3]);
        rig.machine.poll(10);
        rig.radio.inject_bad_header(&[1, 2, 3]);
        rig.machine.poll(20);

        assert!(rig.machine.take_uplink().is_none());
        let counters = rig.handle.stats().counters;
        assert_eq!(counters.rx_crc_errors, 1);
        assert_eq!(counters.rx_bad_header, 1);
        assert_eq!(counters.rx_ok, 0);
        assert_eq!(rig.machine.state(), RadioState::Receiving);
    }

    #[esp32_test]
    fn test_unconsumed_uplink_is_counted_as_dropped() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();
        rig.radio.inject_packet(&[1; 10], 90, 0);
        rig.machine.poll(10);
        rig.radio.inject_packet(&[2; 12], 90, 0);
        rig.machine.poll(20);

        assert_eq!(rig.handle.stats().counters.uplinks_dropped, 1);
        assert_eq!(rig.machine.take_uplink().unwrap().len(), 12);
    }

    #[esp32_test]
    fn test_cad_window_elapses_without_signal() {
        let mut config = au915_sf7();
        config.cad_enabled = true;
        let mut rig = rig(FrequencyPlan::Au915, config, RadioSettings::default());
        rig.machine.start(0).unwrap();
        assert_eq!(rig.machine.state(), RadioState::Scan);

        // CAD tick
        rig.machine.poll(10_000);
        assert_eq!(rig.machine.state(), RadioState::ActivityDetect);
        assert_eq!(rig.radio.mode(), opmode::CAD);

        // No DIO event: window (2 symbols + margin) runs out
        rig.machine.poll(10_000 + 2 * 1024 + CAD_MARGIN_US);
        assert_eq!(rig.machine.state(), RadioState::Scan);
        assert!(rig.machine.take_uplink().is_none());
        assert_eq!(rig.handle.stats().counters.cad_no_activity, 1);

        // Re-armed at once on the next SF of the sweep
        rig.machine.poll(20_000);
        assert_eq!(rig.machine.state(), RadioState::ActivityDetect);
        assert_eq!(rig.radio.register(REG_MODEM_CONFIG2) >> 4, 8);
    }

    #[esp32_test]
    fn test_cad_done_interrupt_without_detection() {
        let mut config = au915_sf7();
        config.cad_enabled = true;
        let mut rig = rig(FrequencyPlan::Au915, config, RadioSettings::default());
        rig.machine.start(0).unwrap();
        rig.machine.poll(10_000);
        rig.radio.complete_cad(false);
        rig.machine.poll(10_500);
        assert_eq!(rig.machine.state(), RadioState::Scan);
        assert_eq!(rig.handle.stats().counters.cad_no_activity, 1);
    }

    #[esp32_test]
    fn test_cad_detection_then_receive() {
        let mut config = au915_sf7();
        config.cad_enabled = true;
        let mut rig = rig(FrequencyPlan::Au915, config, RadioSettings::default());
        rig.machine.start(0).unwrap();
        rig.machine.poll(10_000);

        rig.radio.complete_cad(true);
        rig.machine.poll(10_500);
        assert_eq!(rig.machine.state(), RadioState::Receiving);
        assert_eq!(rig.radio.mode(), opmode::RX_SINGLE);

        rig.radio.inject_packet(&[0x40; 16], 80, -8);
        rig.machine.poll(60_000);
        let frame = rig.machine.take_uplink().unwrap();
        assert_eq!(frame.len(), 16);
        // SNR below zero lowers the reported RSSI
        assert_eq!(frame.rssi_dbm, 80 - 157 - 2);
        assert_eq!(rig.machine.state(), RadioState::Scan);
        assert_eq!(rig.handle.stats().counters.cad_detected, 1);
    }

    #[esp32_test]
    fn test_hop_advances_after_full_sweep() {
        let mut config = au915_sf7();
        config.cad_enabled = true;
        config.hop_enabled = true;
        let mut rig = rig(FrequencyPlan::Au915, config, RadioSettings::default());
        rig.machine.start(0).unwrap();

        let mut now = 10_000;
        for _ in 0..SpreadingFactor::ALL.len() {
            rig.machine.poll(now);
            assert_eq!(rig.machine.state(), RadioState::ActivityDetect);
            assert!(rig.radio.frequency_hz().abs_diff(916_800_000) <= 62);
            rig.radio.complete_cad(false);
            now += 1_000;
            rig.machine.poll(now);
        }
        rig.machine.poll(now);
        assert_eq!(rig.radio.register(REG_MODEM_CONFIG2) >> 4, 7);
        assert!(rig.radio.frequency_hz().abs_diff(917_000_000) <= 62);
    }

    #[esp32_test]
    fn test_downlink_passes_through_scan() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();
        rig.machine
            .schedule_downlink(downlink(1_000_000, 0xBEEF), 500_000)
            .unwrap();

        rig.machine.poll(999_000);
        assert_eq!(rig.machine.state(), RadioState::Receiving);

        rig.machine.poll(1_000_000);
        assert_eq!(rig.machine.state(), RadioState::Transmitting);
        assert!(!rig
            .machine
            .trace
            .contains(&(RadioState::Receiving, RadioState::Transmitting)));
        assert!(rig
            .machine
            .trace
            .ends_with(&[
                (RadioState::Receiving, RadioState::Scan),
                (RadioState::Scan, RadioState::Transmitting)
            ]));

        let sent = rig.radio.transmitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, vec![0x60, 1, 2, 3]);
        assert!(sent[0].invert_iq);

        rig.radio.complete_tx();
        rig.machine.poll(1_060_000);
        assert_eq!(rig.machine.state(), RadioState::Receiving);
        assert_eq!(
            rig.machine.take_tx_report(),
            Some(TxReport {
                token: 0xBEEF,
                outcome: TxOutcome::Sent
            })
        );
        assert_eq!(rig.handle.stats().counters.tx_ok, 1);
        assert_eq!(rig.radio.mode(), opmode::RX_CONTINUOUS);
        assert_eq!(rig.radio.register(REG_INVERTIQ), INVERTIQ_OFF);
    }

    #[esp32_test]
    fn test_stale_downlink_dropped_when_radio_frees() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();
        rig.machine
            .schedule_downlink(downlink(1_000_000, 7), 900_000)
            .unwrap();

        // A packet is being demodulated when the downlink comes due
        rig.radio.set_modem_status(MODEM_STAT_SIGNAL_DETECTED);
        rig.machine.poll(1_000_000);
        assert_eq!(rig.machine.state(), RadioState::Receiving);

        rig.radio.set_modem_status(0);
        rig.radio.inject_packet(&[1; 20], 90, 10);
        rig.machine.poll(1_080_000);
        rig.machine.poll(1_080_100);
        rig.machine.poll(1_090_000);

        assert!(rig.radio.transmitted().is_empty());
        assert_eq!(rig.handle.stats().counters.missed_downlinks, 1);
        assert_eq!(
            rig.machine.take_tx_report(),
            Some(TxReport {
                token: 7,
                outcome: TxOutcome::TooLate
            })
        );
        assert!(rig.machine.take_tx_report().is_none());
        assert!(!rig.machine.has_pending_downlink());
    }

    #[esp32_test]
    fn test_downlink_rejections() {
        let mut rig = rig(
            FrequencyPlan::Au915,
            au915_sf7(),
            RadioSettings {
                strict_single_channel: false,
                ..RadioSettings::default()
            },
        );
        rig.machine.start(0).unwrap();
        let now = 10_000_000;

        assert_eq!(
            rig.machine.schedule_downlink(downlink(now - 100_000, 1), now),
            Err(TxOutcome::TooLate)
        );
        assert_eq!(
            rig.machine.schedule_downlink(downlink(now + 4_000_000, 2), now),
            Err(TxOutcome::TooEarly)
        );
        let mut foreign = downlink(now + 1_000_000, 3);
        foreign.frequency_hz = 868_100_000;
        assert_eq!(
            rig.machine.schedule_downlink(foreign, now),
            Err(TxOutcome::UnsupportedFrequency)
        );

        rig.machine
            .schedule_downlink(downlink(now + 1_000_000, 4), now)
            .unwrap();
        assert_eq!(
            rig.machine.schedule_downlink(downlink(now + 1_500_000, 5), now),
            Err(TxOutcome::Collision)
        );

        let counters = rig.handle.stats().counters;
        assert_eq!(counters.downlinks_received, 5);
        assert_eq!(counters.downlinks_rejected, 4);
    }

    #[esp32_test]
    fn test_strict_single_channel_forces_rx_channel() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();

        let mut frame = downlink(0, 9);
        frame.immediate = true;
        frame.frequency_hz = 923_300_000;
        frame.spreading_factor = SpreadingFactor::Sf12;
        frame.bandwidth = Bandwidth::Khz500;
        frame.tx_power_dbm = 30;
        rig.machine.schedule_downlink(frame, 0).unwrap();
        rig.machine.poll(100);

        let sent = rig.radio.transmitted();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].frequency_hz.abs_diff(916_800_000) <= 62);
        assert_eq!(sent[0].spreading_factor(), 7);
        // clamped to 20 dBm: high power PA setting
        assert_eq!(sent[0].pa_config, PA_BOOST | 0x70 | 15);
        assert_eq!(rig.radio.register(REG_PADAC_SX1276), PADAC_HIGH_POWER);
    }

    #[esp32_test]
    fn test_tx_watchdog_reports_failure() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();
        let mut frame = downlink(0, 3);
        frame.immediate = true;
        rig.machine.schedule_downlink(frame, 0).unwrap();
        rig.machine.poll(10);
        assert_eq!(rig.machine.state(), RadioState::Transmitting);

        rig.machine.poll(10 + 5_000_000);
        assert_eq!(rig.machine.state(), RadioState::Receiving);
        assert_eq!(
            rig.machine.take_tx_report().map(|r| r.outcome),
            Some(TxOutcome::Failed)
        );
        assert_eq!(rig.handle.stats().counters.tx_failed, 1);
    }

    #[esp32_test]
    fn test_bus_error_reverts_to_scan_and_recovers() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();

        rig.radio.inject_packet(&[1; 20], 90, 10);
        // Flag read fails, then the first re-arm attempt fails too
        rig.radio.fail_next(2);
        rig.machine.poll(100);
        assert_eq!(rig.machine.state(), RadioState::Scan);
        assert_eq!(rig.handle.stats().counters.bus_errors, 1);

        rig.machine.poll(200);
        assert_eq!(rig.machine.state(), RadioState::Receiving);
        assert_eq!(rig.radio.mode(), opmode::RX_CONTINUOUS);
    }

    #[esp32_test]
    fn test_start_rejects_wrong_chip() {
        let radio = SimulatedRadio::new(ChipVariant::Sx1272);
        let handle = GatewayHandle::new(FrequencyPlan::Au915, au915_sf7(), 20);
        let mut machine = RadioStateMachine::new(
            RegisterInterface::new(radio),
            ChipVariant::Sx1276,
            RadioSettings::default(),
            handle,
        );
        match machine.start(0) {
            Err(GatewayError::ChipVersion { expected, found }) => {
                assert_eq!(expected, 0x12);
                assert_eq!(found, 0x22);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(machine.state(), RadioState::Init);
    }

    #[esp32_test]
    fn test_reconfigure_quiesces_and_keeps_previous_on_error() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();

        let mut bad = au915_sf7();
        bad.frequency_hz = 868_100_000;
        assert_eq!(
            rig.machine.reconfigure(bad, 10),
            Err(ChannelError::UnsupportedFrequency(868_100_000))
        );
        assert_eq!(rig.machine.config().frequency_hz, 916_800_000);
        assert_eq!(rig.machine.state(), RadioState::Receiving);

        let good =
            ChannelConfig::from_plan(FrequencyPlan::Au915, 2, SpreadingFactor::Sf9).unwrap();
        rig.machine.reconfigure(good, 20).unwrap();
        assert_eq!(rig.handle.config(), good);
        assert_eq!(rig.machine.state(), RadioState::Receiving);
        assert!(rig.radio.frequency_hz().abs_diff(917_200_000) <= 62);
        assert_eq!(rig.radio.register(REG_MODEM_CONFIG2) >> 4, 9);
        assert!(rig
            .machine
            .trace
            .contains(&(RadioState::Receiving, RadioState::Scan)));
    }

    #[esp32_test]
    fn test_reconfigure_bus_error_counts_and_relistens() {
        let mut rig = rig(FrequencyPlan::Au915, au915_sf7(), RadioSettings::default());
        rig.machine.start(0).unwrap();

        let wanted =
            ChannelConfig::from_plan(FrequencyPlan::Au915, 2, SpreadingFactor::Sf9).unwrap();
        rig.radio.fail_next(1);
        assert_eq!(
            rig.machine.reconfigure(wanted, 10),
            Err(ChannelError::Register(RegisterError::BusTimeout))
        );
        assert_eq!(rig.handle.stats().counters.bus_errors, 1);
        assert!(rig
            .machine
            .trace
            .contains(&(RadioState::Receiving, RadioState::Scan)));
        assert_eq!(rig.machine.state(), RadioState::Receiving);
        assert_eq!(*rig.machine.config(), au915_sf7());
        assert!(rig.radio.frequency_hz().abs_diff(916_800_000) <= 62);
    }
}
