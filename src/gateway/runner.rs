//! Gateway main loop.
//!
//! [`Gateway`] owns the radio state machine and the forwarder and moves
//! frames between them. One [`Gateway::step`] is one main-loop iteration:
//!
//! 1. apply a configuration change requested through the handle
//! 2. radio step (interrupt first, then timers)
//! 3. hand received frames and TX outcomes to the forwarder
//! 4. forwarder step (network receive, acks, periodic cycle)
//! 5. schedule downlinks and apply management requests
//!
//! Network I/O only happens in steps 3-5, never inside a bus transaction.

use super::buffers::TxReport;
use super::clock::Clock;
use super::handle::GatewayHandle;
use super::machine::RadioStateMachine;
use crate::config::{ConfigError, GatewayConfig};
use crate::lora::{
    ChannelConfig, ChannelError, RegisterBus, RegisterError, RegisterInterface, SpreadingFactor,
};
use crate::protocol::{Forwarder, GatewayEui, Inbound, ManagementCommand, Transport, TransportError};
use log::{debug, error, info, warn};
use std::fmt;
use std::time::Duration;

/// Sleep between main-loop iterations.
pub const LOOP_PERIOD: Duration = Duration::from_millis(1);

pub struct Gateway<B: RegisterBus, T: Transport> {
    machine: RadioStateMachine<B>,
    forwarder: Forwarder<T>,
    handle: GatewayHandle,
    clock: Clock,
}

impl<B: RegisterBus, T: Transport> Gateway<B, T> {
    /// Build the gateway. The configuration is validated here; nothing is
    /// sent to the radio or the backend before [`Gateway::start`].
    pub fn new(
        config: &GatewayConfig,
        bus: B,
        transport: T,
        eui: GatewayEui,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let channel = config.channel_config()?;
        let handle = GatewayHandle::new(config.region, channel, config.stat_records);
        handle.set_debug_level(config.debug_level);

        let machine = RadioStateMachine::new(
            RegisterInterface::new(bus),
            config.chip,
            config.radio_settings(),
            handle.clone(),
        );
        let forwarder = Forwarder::new(
            transport,
            eui,
            config.identity.clone(),
            config.forwarder_settings(),
            handle.clone(),
        );
        Ok(Self {
            machine,
            forwarder,
            handle,
            clock: Clock::new(),
        })
    }

    /// Replace the gateway clock. Interrupt timestamps must come from the
    /// same time base.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    pub fn machine(&self) -> &RadioStateMachine<B> {
        &self.machine
    }

    pub fn forwarder(&self) -> &Forwarder<T> {
        &self.forwarder
    }

    /// Radio clock of this gateway.
    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Bring the radio up and open the downlink path.
    pub fn start(&mut self, now_us: u64) -> Result<(), GatewayError> {
        if let Err(e) = self.machine.start(now_us) {
            error!("Radio start failed: {}", e);
            return Err(e);
        }
        self.handle.statistics().bump_reboot();
        self.forwarder.start(now_us);
        Ok(())
    }

    /// One main-loop iteration.
    pub fn step(&mut self, now_us: u64) {
        self.apply_pending_config(now_us);

        self.machine.poll(now_us);

        while let Some(frame) = self.machine.take_uplink() {
            self.forwarder.forward(frame, now_us);
        }
        while let Some(report) = self.machine.take_tx_report() {
            self.forwarder.report_tx(report);
        }

        for inbound in self.forwarder.poll(now_us) {
            match inbound {
                Inbound::Downlink(frame) => {
                    let token = frame.token;
                    if let Err(outcome) = self.machine.schedule_downlink(frame, now_us) {
                        self.forwarder.report_tx(TxReport { token, outcome });
                    }
                }
                Inbound::Management(command) => self.manage(command),
            }
        }
    }

    /// Run until `keep_running` returns false or a restart is requested.
    ///
    /// `keep_running` is called once per iteration, before the step.
    pub fn run(&mut self, mut keep_running: impl FnMut() -> bool) {
        info!("Gateway loop running");
        while keep_running() && !self.handle.restart_requested() {
            let now_us = self.clock.now_us();
            self.step(now_us);
            std::thread::sleep(LOOP_PERIOD);
        }
        info!("Gateway loop stopped");
    }

    fn apply_pending_config(&mut self, now_us: u64) {
        let Some(config) = self.handle.take_pending_config() else {
            return;
        };
        match self.machine.reconfigure(config, now_us) {
            Ok(()) => {}
            Err(ChannelError::NotQuiesced(state)) => {
                debug!("Configuration change waits for the radio to leave {}", state);
                self.handle.defer_pending_config(config);
            }
            Err(ChannelError::Register(e)) => {
                warn!("Configuration change interrupted by bus error, retrying: {}", e);
                self.handle.defer_pending_config(config);
            }
            Err(e) => warn!("Configuration change rejected: {}", e),
        }
    }

    fn manage(&mut self, command: ManagementCommand) {
        let current = self.handle.config();
        let requested = match command {
            ManagementCommand::Reset => {
                warn!("Restart requested by backend");
                self.handle.request_restart();
                return;
            }
            ManagementCommand::SetSpreadingFactor(sf) => SpreadingFactor::try_from(sf)
                .map(|spreading_factor| ChannelConfig {
                    spreading_factor,
                    ..current
                }),
            ManagementCommand::SetChannel(index) => self
                .handle
                .plan()
                .frequency(index)
                .map(|frequency_hz| ChannelConfig {
                    frequency_hz,
                    ..current
                })
                .ok_or(ChannelError::UnknownChannel(index)),
        };
        match requested.and_then(|config| self.handle.set_config(config)) {
            Ok(()) => info!("Backend requested {:?}", command),
            Err(e) => warn!("Ignoring {:?}: {}", command, e),
        }
    }
}

/// Errors that stop the gateway from starting.
#[derive(Debug)]
pub enum GatewayError {
    /// The transceiver answered with an unexpected version byte.
    ChipVersion { expected: u8, found: u8 },
    Register(RegisterError),
    Channel(ChannelError),
    Config(ConfigError),
    Transport(TransportError),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChipVersion { expected, found } => write!(
                f,
                "unexpected transceiver version {:#04x} (expected {:#04x})",
                found, expected
            ),
            Self::Register(e) => write!(f, "register access failed: {}", e),
            Self::Channel(e) => write!(f, "channel configuration failed: {}", e),
            Self::Config(e) => write!(f, "invalid configuration: {}", e),
            Self::Transport(e) => write!(f, "backend unreachable: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ChipVersion { .. } => None,
            Self::Register(e) => Some(e),
            Self::Channel(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Transport(e) => Some(e),
        }
    }
}

impl From<RegisterError> for GatewayError {
    fn from(e: RegisterError) -> Self {
        Self::Register(e)
    }
}

impl From<ChannelError> for GatewayError {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}

impl From<ConfigError> for GatewayError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<TransportError> for GatewayError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RadioState;
    use crate::lora::sim::SimulatedRadio;
    use crate::lora::{ChipVariant, FrequencyPlan};
    use crate::protocol::packet::{decode, MessageKind};
    use crate::protocol::transport::memory::MemoryTransport;
    use lora_1ch_gateway_macros::esp32_test;
    use serde_json::Value;

    const EUI: GatewayEui = GatewayEui([0xAA, 0x55, 0x5A, 0xFF, 0xFF, 0x00, 0x00, 0x02]);

    struct Rig {
        gateway: Gateway<SimulatedRadio, MemoryTransport>,
        radio: SimulatedRadio,
        backend: MemoryTransport,
    }

    fn rig(config: GatewayConfig) -> Rig {
        let radio = SimulatedRadio::new(ChipVariant::Sx1276);
        let backend = MemoryTransport::new();
        let gateway = Gateway::new(&config, radio.clone(), backend.clone(), EUI).unwrap();
        radio.connect_irq(gateway.handle().irq());
        Rig {
            gateway,
            radio,
            backend,
        }
    }

    fn au915() -> GatewayConfig {
        GatewayConfig {
            region: FrequencyPlan::Au915,
            chip: ChipVariant::Sx1276,
            ..GatewayConfig::default()
        }
    }

    fn pull_resp(token: u16, txpk: &str) -> Vec<u8> {
        let mut datagram = vec![2, (token >> 8) as u8, token as u8, 0x03];
        datagram.extend_from_slice(format!("{{\"txpk\":{}}}", txpk).as_bytes());
        datagram
    }

    fn of_kind(sent: &[Vec<u8>], kind: MessageKind) -> Vec<Vec<u8>> {
        sent.iter().filter(|d| d[3] == kind.id()).cloned().collect()
    }

    #[esp32_test]
    fn test_start_counts_boot_and_pulls() {
        let mut rig = rig(au915());
        rig.gateway.start(0).unwrap();
        let handle = rig.gateway.handle();
        assert_eq!(handle.state(), RadioState::Receiving);
        assert_eq!(handle.stats().counters.boots, 1);
        let sent = rig.backend.take_sent();
        assert_eq!(of_kind(&sent, MessageKind::PullData).len(), 1);
    }

    #[esp32_test]
    fn test_received_frame_is_pushed_upstream() {
        let mut rig = rig(au915());
        rig.gateway.start(0).unwrap();
        rig.backend.take_sent();

        let payload: Vec<u8> = (0..20).collect();
        rig.radio.inject_packet(&payload, 100, 28);
        rig.gateway.step(1_000);

        let sent = rig.backend.take_sent();
        let pushes = of_kind(&sent, MessageKind::PushData);
        assert_eq!(pushes.len(), 1);
        let push = decode(&pushes[0]).unwrap();
        assert_eq!(push.eui, Some(EUI));
        let body: Value = serde_json::from_slice(push.body).unwrap();
        assert_eq!(body["rxpk"][0]["size"], 20);
        assert_eq!(body["rxpk"][0]["freq"], 916.8);
        assert_eq!(body["rxpk"][0]["rssi"], -57);
        assert_eq!(rig.gateway.handle().stats().counters.push_sent, 1);
    }

    #[esp32_test]
    fn test_timed_downlink_transmitted_and_acknowledged() {
        let mut rig = rig(au915());
        rig.gateway.start(0).unwrap();
        rig.backend.take_sent();

        rig.backend.deliver(pull_resp(
            0x0102,
            r#"{"imme":false,"tmst":2000000,"freq":923.3,"powe":14,"modu":"LORA",
               "datr":"SF10BW500","codr":"4/5","ipol":true,"size":3,"data":"AQID"}"#,
        ));
        rig.gateway.step(1_000_000);
        assert!(rig.gateway.machine().has_pending_downlink());
        assert!(rig.radio.transmitted().is_empty());

        rig.gateway.step(2_000_000);
        let sent = rig.radio.transmitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, vec![1, 2, 3]);
        // strict single channel: back on the receive channel
        assert!(sent[0].frequency_hz.abs_diff(916_800_000) <= 62);

        rig.radio.complete_tx();
        rig.gateway.step(2_100_000);
        let acks = of_kind(&rig.backend.take_sent(), MessageKind::TxAck);
        assert_eq!(acks.len(), 1);
        let ack = decode(&acks[0]).unwrap();
        assert_eq!(ack.token.0, 0x0102);
        assert_eq!(ack.body, br#"{"txpk_ack":{"error":"NONE"}}"#);
        assert_eq!(rig.gateway.handle().state(), RadioState::Receiving);
    }

    #[esp32_test]
    fn test_rejected_downlink_acknowledged_at_once() {
        let mut rig = rig(au915());
        rig.gateway.start(0).unwrap();
        rig.backend.take_sent();

        rig.backend.deliver(pull_resp(
            0x0A0B,
            r#"{"tmst":1000,"freq":916.8,"modu":"LORA","datr":"SF7BW125","data":"AQID"}"#,
        ));
        rig.gateway.step(2_000_000);

        let acks = of_kind(&rig.backend.take_sent(), MessageKind::TxAck);
        assert_eq!(acks.len(), 1);
        let ack = decode(&acks[0]).unwrap();
        assert_eq!(ack.token.0, 0x0A0B);
        assert_eq!(ack.body, br#"{"txpk_ack":{"error":"TOO_LATE"}}"#);
        assert!(!rig.gateway.machine().has_pending_downlink());
    }

    #[esp32_test]
    fn test_config_change_applied_by_loop() {
        let mut rig = rig(au915());
        rig.gateway.start(0).unwrap();
        let handle = rig.gateway.handle();

        let wanted = ChannelConfig::from_plan(FrequencyPlan::Au915, 1, SpreadingFactor::Sf9).unwrap();
        handle.set_config(wanted).unwrap();
        assert_ne!(handle.config(), wanted);

        rig.gateway.step(1_000);
        assert_eq!(handle.config(), wanted);
        assert!(rig.radio.frequency_hz().abs_diff(917_000_000) <= 62);
        assert_eq!(handle.state(), RadioState::Receiving);
    }

    #[esp32_test]
    fn test_config_change_waits_for_transmission() {
        let mut rig = rig(au915());
        rig.gateway.start(0).unwrap();
        let handle = rig.gateway.handle();

        rig.backend.deliver(pull_resp(
            1,
            r#"{"imme":true,"freq":916.8,"modu":"LORA","datr":"SF7BW125","data":"AQID"}"#,
        ));
        rig.gateway.step(100);
        rig.gateway.step(200);
        assert_eq!(handle.state(), RadioState::Transmitting);

        let wanted = ChannelConfig::from_plan(FrequencyPlan::Au915, 2, SpreadingFactor::Sf8).unwrap();
        handle.set_config(wanted).unwrap();
        rig.gateway.step(300);
        assert_ne!(handle.config(), wanted);

        rig.radio.complete_tx();
        rig.gateway.step(400);
        rig.gateway.step(500);
        assert_eq!(handle.config(), wanted);
    }

    #[esp32_test]
    fn test_config_change_retried_after_bus_error() {
        let mut rig = rig(au915());
        rig.gateway.start(0).unwrap();
        let handle = rig.gateway.handle();

        let wanted = ChannelConfig::from_plan(FrequencyPlan::Au915, 1, SpreadingFactor::Sf9).unwrap();
        handle.set_config(wanted).unwrap();
        rig.radio.fail_next(1);
        rig.gateway.step(1_000);
        assert_ne!(handle.config(), wanted);
        assert_eq!(handle.stats().counters.bus_errors, 1);
        assert_eq!(handle.state(), RadioState::Receiving);

        rig.gateway.step(2_000);
        assert_eq!(handle.config(), wanted);
        assert!(rig.radio.frequency_hz().abs_diff(917_000_000) <= 62);
    }

    #[esp32_test]
    fn test_management_requests() {
        let mut rig = rig(GatewayConfig {
            udp_management: true,
            ..au915()
        });
        rig.gateway.start(0).unwrap();
        let handle = rig.gateway.handle();

        rig.backend.deliver(vec![1, 0, 1, 0x16, 11]);
        rig.gateway.step(100);
        rig.gateway.step(200);
        assert_eq!(handle.config().spreading_factor, SpreadingFactor::Sf11);

        rig.backend.deliver(vec![1, 0, 2, 0x16, 6]);
        rig.gateway.step(300);
        rig.gateway.step(400);
        assert_eq!(handle.config().spreading_factor, SpreadingFactor::Sf11);

        rig.backend.deliver(vec![1, 0, 3, 0x15]);
        rig.gateway.step(500);
        assert!(handle.restart_requested());
    }

    #[esp32_test]
    fn test_wrong_chip_fails_start() {
        let radio = SimulatedRadio::new(ChipVariant::Sx1272);
        let mut gateway =
            Gateway::new(&au915(), radio, MemoryTransport::new(), EUI).unwrap();
        assert!(matches!(
            gateway.start(0),
            Err(GatewayError::ChipVersion { .. })
        ));
        assert_eq!(gateway.handle().stats().counters.boots, 0);
    }

    #[esp32_test]
    fn test_invalid_config_rejected() {
        let config = GatewayConfig {
            spreading_factor: 6,
            ..au915()
        };
        let result = Gateway::new(
            &config,
            SimulatedRadio::new(ChipVariant::Sx1276),
            MemoryTransport::new(),
            EUI,
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
