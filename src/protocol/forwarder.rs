//! Packet forwarder client.
//!
//! Sends received frames upstream as PUSH_DATA, keeps the downlink path open
//! with periodic PULL_DATA, reports gateway status, and turns PULL_RESP into
//! [`DownlinkFrame`]s for the radio. Network I/O is non-blocking and happens
//! outside any radio bus transaction.
//!
//! Uplinks whose PUSH_DATA could not be sent, or was never acknowledged, are
//! kept (a few of them, for a limited time) and sent again with a new token
//! on the next periodic cycle. They are never re-sent right away.

use super::acks::{AckMatch, AckTracker, TokenTimeout};
use super::frames::{GatewayStatus, PushPayload, RxPacket, TxAckPayload, TxPacket};
use super::packet::{self, GatewayEui, MessageKind, ProtocolError, Token, MAX_DATAGRAM_LEN};
use super::transport::Transport;
use crate::config::GatewayIdentity;
use crate::gateway::{bump, DownlinkFrame, GatewayHandle, TxOutcome, TxReport, UplinkFrame};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Duration;

/// Uplinks kept for a later retry.
pub const MAX_RETAINED: usize = 4;

/// Datagrams handled per [`Forwarder::poll`].
const MAX_DATAGRAMS_PER_POLL: usize = 8;

/// Forwarder timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderSettings {
    pub pull_interval: Duration,
    pub stat_interval: Duration,
    /// How long a request may wait for its acknowledgement.
    pub ack_timeout: Duration,
    /// How long after its first send an uplink may still be retried.
    pub retry_window: Duration,
    /// Honour the gateway management messages.
    pub management: bool,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            pull_interval: Duration::from_secs(55),
            stat_interval: Duration::from_secs(120),
            ack_timeout: Duration::from_secs(5),
            retry_window: Duration::from_secs(30),
            management: false,
        }
    }
}

/// Backend request to manage the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementCommand {
    Reset,
    SetSpreadingFactor(u8),
    SetChannel(u8),
}

/// Something the backend sent that the gateway must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Downlink(DownlinkFrame),
    Management(ManagementCommand),
}

#[derive(Debug, Clone)]
struct Retained {
    packet: RxPacket,
    first_sent_us: u64,
}

pub struct Forwarder<T: Transport> {
    transport: T,
    eui: GatewayEui,
    identity: GatewayIdentity,
    settings: ForwarderSettings,
    handle: GatewayHandle,
    acks: AckTracker,
    /// Uplinks of each unacknowledged PUSH_DATA.
    in_flight: Vec<(Token, Vec<Retained>)>,
    retry: VecDeque<Retained>,
    next_pull_us: u64,
    next_stat_us: u64,
    buf: Vec<u8>,
}

impl<T: Transport> Forwarder<T> {
    pub fn new(
        transport: T,
        eui: GatewayEui,
        identity: GatewayIdentity,
        settings: ForwarderSettings,
        handle: GatewayHandle,
    ) -> Self {
        Self {
            transport,
            eui,
            identity,
            acks: AckTracker::new(settings.ack_timeout),
            settings,
            handle,
            in_flight: Vec::new(),
            retry: VecDeque::with_capacity(MAX_RETAINED),
            next_pull_us: 0,
            next_stat_us: 0,
            buf: vec![0u8; MAX_DATAGRAM_LEN],
        }
    }

    pub fn eui(&self) -> GatewayEui {
        self.eui
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Open the downlink path: first PULL_DATA now, status report after one
    /// stat interval.
    pub fn start(&mut self, now_us: u64) {
        info!("Forwarding as gateway {}", self.eui);
        self.send_pull(now_us);
        self.next_pull_us = now_us + self.settings.pull_interval.as_micros() as u64;
        self.next_stat_us = now_us + self.settings.stat_interval.as_micros() as u64;
    }

    /// Send one received frame upstream.
    pub fn forward(&mut self, frame: UplinkFrame, now_us: u64) {
        let retained = Retained {
            packet: RxPacket::from_uplink(&frame),
            first_sent_us: now_us,
        };
        self.send_push(vec![retained], None, now_us);
    }

    /// Report the outcome of a downlink.
    pub fn report_tx(&mut self, report: TxReport) {
        let body = match TxAckPayload::new(report.outcome).to_bytes() {
            Ok(body) => body,
            Err(e) => {
                warn!("Could not encode TX_ACK: {}", e);
                return;
            }
        };
        let datagram = packet::encode(MessageKind::TxAck, Token(report.token), &self.eui, &body);
        match self.transport.send(&datagram) {
            Ok(()) => debug!("TX_ACK {:#06x}: {:?}", report.token, report.outcome),
            Err(e) => warn!("TX_ACK {:#06x} not sent: {}", report.token, e),
        }
    }

    /// Receive waiting datagrams, expire acknowledgements and run the
    /// periodic PULL_DATA / status cycle.
    pub fn poll(&mut self, now_us: u64) -> Vec<Inbound> {
        let mut inbound = Vec::new();
        for _ in 0..MAX_DATAGRAMS_PER_POLL {
            let len = match self.transport.try_recv(&mut self.buf) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    warn!("Backend receive failed: {}", e);
                    break;
                }
            };
            let datagram = self.buf[..len].to_vec();
            if let Err(e) = self.handle_datagram(&datagram, now_us, &mut inbound) {
                warn!("Dropped datagram from backend: {}", e);
            }
        }

        let expired = self.acks.expire(now_us);
        for timeout in expired {
            self.on_timeout(timeout);
        }

        self.periodic(now_us);
        inbound
    }

    fn handle_datagram(
        &mut self,
        datagram: &[u8],
        now_us: u64,
        inbound: &mut Vec<Inbound>,
    ) -> Result<(), ProtocolError> {
        let datagram = packet::decode(datagram)?;
        match datagram.kind {
            MessageKind::PushAck | MessageKind::PullAck => {
                self.on_ack(datagram.kind, datagram.token, now_us)
            }
            MessageKind::PullResp => {
                let stats = self.handle.statistics();
                let frame = TxPacket::from_pull_resp(datagram.body)
                    .and_then(|txpk| txpk.into_downlink(datagram.token.0, now_us));
                match frame {
                    Ok(frame) => {
                        debug!(
                            "PULL_RESP {}: {} bytes on {} Hz",
                            datagram.token,
                            frame.payload.len(),
                            frame.frequency_hz
                        );
                        inbound.push(Inbound::Downlink(frame));
                    }
                    Err(e) => {
                        stats.update(|c| {
                            bump(&mut c.downlinks_received);
                            bump(&mut c.downlinks_rejected);
                        });
                        self.report_tx(TxReport {
                            token: datagram.token.0,
                            outcome: TxOutcome::Malformed,
                        });
                        return Err(e);
                    }
                }
            }
            kind if kind.is_management() => {
                if !self.settings.management {
                    debug!("Ignoring {}: management disabled", kind);
                    return Ok(());
                }
                let arg = datagram.body.first().copied();
                let command = match (kind, arg) {
                    (MessageKind::MgtReset, _) => ManagementCommand::Reset,
                    (MessageKind::MgtSetSf, Some(sf)) => ManagementCommand::SetSpreadingFactor(sf),
                    (MessageKind::MgtSetFreq, Some(ch)) => ManagementCommand::SetChannel(ch),
                    _ => {
                        return Err(ProtocolError::InvalidField {
                            field: "management argument",
                            reason: format!("{} without argument", kind),
                        })
                    }
                };
                info!("Management request from backend: {:?}", command);
                inbound.push(Inbound::Management(command));
            }
            other => debug!("Ignoring unexpected {} from backend", other),
        }
        Ok(())
    }

    fn on_ack(&mut self, kind: MessageKind, token: Token, now_us: u64) {
        match self.acks.acknowledge(kind, token, now_us) {
            AckMatch::Acknowledged { request, .. } => {
                let stats = self.handle.statistics();
                match request {
                    MessageKind::PushData => {
                        stats.update(|c| bump(&mut c.push_acked));
                        self.in_flight.retain(|(t, _)| *t != token);
                    }
                    _ => stats.update(|c| bump(&mut c.pull_acked)),
                }
            }
            AckMatch::Unmatched => {
                debug!("{} {} matches no outstanding request", kind, token);
            }
        }
    }

    fn on_timeout(&mut self, timeout: TokenTimeout) {
        self.handle
            .statistics()
            .update(|c| bump(&mut c.token_timeouts));
        if timeout.kind != MessageKind::PushData {
            return;
        }
        if let Some(i) = self.in_flight.iter().position(|(t, _)| *t == timeout.token) {
            let (_, uplinks) = self.in_flight.remove(i);
            for uplink in uplinks {
                self.retain(uplink);
            }
        }
    }

    fn retain(&mut self, uplink: Retained) {
        if self.retry.len() >= MAX_RETAINED {
            if let Some(dropped) = self.retry.pop_front() {
                warn!(
                    "Retry queue full, discarding uplink from {}",
                    dropped.packet.time
                );
                self.handle
                    .statistics()
                    .update(|c| bump(&mut c.push_discarded));
            }
        }
        self.retry.push_back(uplink);
    }

    fn periodic(&mut self, now_us: u64) {
        let pull_due = now_us >= self.next_pull_us;
        let stat_due = now_us >= self.next_stat_us;
        if !pull_due && !stat_due {
            return;
        }
        if pull_due {
            self.send_pull(now_us);
            self.next_pull_us = now_us + self.settings.pull_interval.as_micros() as u64;
        }

        let window_us = self.settings.retry_window.as_micros() as u64;
        let mut retries = Vec::new();
        while let Some(uplink) = self.retry.pop_front() {
            if now_us.saturating_sub(uplink.first_sent_us) > window_us {
                warn!("Uplink from {} outside retry window, discarding", uplink.packet.time);
                self.handle
                    .statistics()
                    .update(|c| bump(&mut c.push_discarded));
            } else {
                retries.push(uplink);
            }
        }
        if !retries.is_empty() {
            let count = retries.len() as u64;
            self.handle
                .statistics()
                .update(|c| c.push_retries = c.push_retries.saturating_add(count));
            info!("Retrying {} uplink(s)", count);
        }

        let stat = if stat_due {
            self.next_stat_us = now_us + self.settings.stat_interval.as_micros() as u64;
            Some(GatewayStatus::new(
                &self.handle.statistics().counters(),
                &self.identity,
                chrono::Utc::now(),
            ))
        } else {
            None
        };

        if !retries.is_empty() || stat.is_some() {
            self.send_push(retries, stat, now_us);
        }
    }

    fn send_pull(&mut self, now_us: u64) {
        let token = Token::random();
        let datagram = packet::encode(MessageKind::PullData, token, &self.eui, &[]);
        match self.transport.send(&datagram) {
            Ok(()) => {
                debug!("PULL_DATA {}", token);
                self.handle.statistics().update(|c| bump(&mut c.pull_sent));
                self.register(MessageKind::PullData, token, now_us);
            }
            Err(e) => warn!("PULL_DATA not sent: {}", e),
        }
    }

    fn send_push(&mut self, uplinks: Vec<Retained>, stat: Option<GatewayStatus>, now_us: u64) {
        let payload = PushPayload {
            rxpk: uplinks.iter().map(|u| u.packet.clone()).collect(),
            stat,
        };
        let body = match payload.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                warn!("Could not encode PUSH_DATA: {}", e);
                return;
            }
        };
        let token = Token::random();
        let datagram = packet::encode(MessageKind::PushData, token, &self.eui, &body);
        match self.transport.send(&datagram) {
            Ok(()) => {
                debug!(
                    "PUSH_DATA {}: {} rxpk{}",
                    token,
                    uplinks.len(),
                    if payload.stat.is_some() { " + stat" } else { "" }
                );
                self.handle.statistics().update(|c| bump(&mut c.push_sent));
                self.register(MessageKind::PushData, token, now_us);
                if !uplinks.is_empty() {
                    self.in_flight.push((token, uplinks));
                }
            }
            Err(e) => {
                warn!("PUSH_DATA not sent: {}", e);
                for uplink in uplinks {
                    self.retain(uplink);
                }
            }
        }
    }

    fn register(&mut self, kind: MessageKind, token: Token, now_us: u64) {
        if let Some(evicted) = self.acks.register(kind, token, now_us) {
            self.on_timeout(evicted);
        }
    }
}
