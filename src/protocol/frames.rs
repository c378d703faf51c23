//! JSON bodies carried by PUSH_DATA, PULL_RESP and TX_ACK.

use crate::config::GatewayIdentity;
use crate::gateway::{expand_tmst, DownlinkFrame, StatCounters, TxOutcome, UplinkFrame};
use crate::lora::{format_datarate, parse_datarate, CodingRate, Payload, MAX_PAYLOAD_LENGTH};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use super::packet::ProtocolError;

/// Modulation string for LoRa frames.
pub const MODULATION_LORA: &str = "LORA";

/// Preamble used when a PULL_RESP leaves `prea` out.
pub const DEFAULT_PREAMBLE: u16 = 8;

/// Power used when a PULL_RESP leaves `powe` out.
pub const DEFAULT_TX_POWER_DBM: i8 = 14;

/// One received packet (`rxpk` entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxPacket {
    /// UTC receive time, ISO 8601.
    pub time: String,
    /// Low 32 bits of the radio clock (µs) at RX-done.
    pub tmst: u32,
    pub chan: u8,
    pub rfch: u8,
    /// Centre frequency in MHz.
    pub freq: f64,
    /// CRC status: 1 = OK.
    pub stat: i8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    pub rssi: i16,
    pub lsnr: f32,
    pub size: u16,
    /// Base64 payload.
    pub data: String,
}

impl RxPacket {
    pub fn from_uplink(frame: &UplinkFrame) -> Self {
        let time = Utc
            .timestamp_millis_opt(frame.received_unix_ms)
            .single()
            .unwrap_or_default();
        Self {
            time: time.to_rfc3339_opts(SecondsFormat::Micros, true),
            tmst: frame.received_at_us as u32,
            chan: frame.channel_index,
            rfch: 0,
            freq: frame.frequency_hz as f64 / 1e6,
            stat: 1,
            modu: MODULATION_LORA.to_string(),
            datr: format_datarate(frame.spreading_factor, frame.bandwidth),
            codr: frame.coding_rate.to_string(),
            rssi: frame.rssi_dbm,
            lsnr: frame.snr_db,
            size: frame.payload.len() as u16,
            data: BASE64.encode(&frame.payload),
        }
    }
}

/// Gateway status report (`stat` object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatus {
    /// UTC time, "YYYY-MM-DD HH:MM:SS GMT".
    pub time: String,
    pub lati: f64,
    pub long: f64,
    pub alti: i32,
    /// Packets received.
    pub rxnb: u64,
    /// Packets received with a valid CRC.
    pub rxok: u64,
    /// Packets forwarded.
    pub rxfw: u64,
    /// Percentage of upstream datagrams acknowledged.
    pub ackr: f64,
    /// Downlinks received.
    pub dwnb: u64,
    /// Packets emitted.
    pub txnb: u64,
    pub pfrm: String,
    pub mail: String,
    pub desc: String,
}

impl GatewayStatus {
    pub fn new(counters: &StatCounters, identity: &GatewayIdentity, now: DateTime<Utc>) -> Self {
        let received = counters
            .rx_ok
            .saturating_add(counters.rx_crc_errors)
            .saturating_add(counters.rx_bad_header);
        let lost = counters
            .uplinks_dropped
            .saturating_add(counters.push_discarded);
        Self {
            time: now.format("%Y-%m-%d %H:%M:%S GMT").to_string(),
            lati: identity.latitude,
            long: identity.longitude,
            alti: identity.altitude,
            rxnb: received,
            rxok: counters.rx_ok,
            rxfw: counters.rx_ok.saturating_sub(lost),
            ackr: (counters.ack_ratio() * 10.0).round() / 10.0,
            dwnb: counters.downlinks_received,
            txnb: counters.tx_ok,
            pfrm: identity.platform.clone(),
            mail: identity.email.clone(),
            desc: identity.description.clone(),
        }
    }
}

/// PUSH_DATA body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rxpk: Vec<RxPacket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<GatewayStatus>,
}

impl PushPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Downlink request (`txpk` object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPacket {
    #[serde(default)]
    pub imme: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    /// Centre frequency in MHz.
    pub freq: f64,
    #[serde(default)]
    pub rfch: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powe: Option<i8>,
    pub modu: String,
    pub datr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    #[serde(default)]
    pub ipol: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prea: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u16>,
    pub data: String,
    #[serde(default)]
    pub ncrc: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PullResponse {
    txpk: TxPacket,
}

impl TxPacket {
    /// Parse a PULL_RESP body.
    pub fn from_pull_resp(body: &[u8]) -> Result<Self, ProtocolError> {
        let resp: PullResponse = serde_json::from_slice(body)?;
        Ok(resp.txpk)
    }

    /// Turn the request into a frame for the radio.
    ///
    /// `tmst` is expanded against the radio clock `now_us`; `token` is that
    /// of the PULL_RESP and comes back in the TX_ACK.
    pub fn into_downlink(self, token: u16, now_us: u64) -> Result<DownlinkFrame, ProtocolError> {
        if self.modu != MODULATION_LORA {
            return Err(invalid("modu", self.modu));
        }
        let (spreading_factor, bandwidth) =
            parse_datarate(&self.datr).map_err(|e| invalid("datr", e.to_string()))?;
        let coding_rate = match self.codr.as_deref() {
            Some(codr) => codr
                .parse::<CodingRate>()
                .map_err(|e| invalid("codr", e.to_string()))?,
            None => CodingRate::Cr4_5,
        };

        let raw = BASE64
            .decode(self.data.as_bytes())
            .map_err(|e| invalid("data", e.to_string()))?;
        if raw.is_empty() || raw.len() > MAX_PAYLOAD_LENGTH {
            return Err(invalid("size", raw.len().to_string()));
        }
        if let Some(size) = self.size {
            if size as usize != raw.len() {
                warn!(
                    "txpk size {} does not match {} decoded bytes, using decoded length",
                    size,
                    raw.len()
                );
            }
        }
        let payload =
            Payload::from_slice(&raw).map_err(|_| invalid("size", raw.len().to_string()))?;

        let target_us = if self.imme {
            now_us
        } else {
            let tmst = self
                .tmst
                .ok_or_else(|| invalid("tmst", "missing for timed downlink".to_string()))?;
            expand_tmst(tmst, now_us)
        };

        if !(self.freq.is_finite() && self.freq > 0.0) {
            return Err(invalid("freq", self.freq.to_string()));
        }

        Ok(DownlinkFrame {
            payload,
            target_us,
            immediate: self.imme,
            spreading_factor,
            bandwidth,
            coding_rate,
            frequency_hz: (self.freq * 1e6).round() as u32,
            tx_power_dbm: self.powe.unwrap_or(DEFAULT_TX_POWER_DBM),
            invert_iq: self.ipol,
            preamble: self.prea.unwrap_or(DEFAULT_PREAMBLE),
            crc: !self.ncrc,
            token,
        })
    }
}

fn invalid(field: &'static str, reason: String) -> ProtocolError {
    ProtocolError::InvalidField { field, reason }
}

/// TX_ACK error values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxAckError {
    None,
    TooLate,
    TooEarly,
    CollisionPacket,
    CollisionBeacon,
    TxFreq,
    TxPower,
    GpsUnlocked,
    /// The radio did not finish the transmission.
    TxFailed,
    /// The `txpk` object could not be parsed.
    InvalidTxpk,
}

impl From<TxOutcome> for TxAckError {
    fn from(outcome: TxOutcome) -> Self {
        match outcome {
            TxOutcome::Sent => Self::None,
            TxOutcome::TooLate => Self::TooLate,
            TxOutcome::TooEarly => Self::TooEarly,
            TxOutcome::Collision => Self::CollisionPacket,
            TxOutcome::UnsupportedFrequency => Self::TxFreq,
            TxOutcome::Failed => Self::TxFailed,
            TxOutcome::Malformed => Self::InvalidTxpk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAckBody {
    pub error: TxAckError,
}

/// TX_ACK body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxAckPayload {
    pub txpk_ack: TxAckBody,
}

impl TxAckPayload {
    pub fn new(outcome: TxOutcome) -> Self {
        Self {
            txpk_ack: TxAckBody {
                error: outcome.into(),
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::{Bandwidth, SpreadingFactor};
    use lora_1ch_gateway_macros::esp32_test;
    use serde_json::{json, Value};

    fn uplink() -> UplinkFrame {
        UplinkFrame {
            payload: Payload::from_slice(b"hello").unwrap(),
            received_at_us: (1u64 << 32) + 1_000,
            received_unix_ms: 1_700_000_000_123,
            rssi_dbm: -57,
            snr_db: 9.25,
            spreading_factor: SpreadingFactor::Sf9,
            bandwidth: Bandwidth::Khz125,
            coding_rate: CodingRate::Cr4_5,
            frequency_hz: 868_100_000,
            channel_index: 0,
        }
    }

    #[esp32_test]
    fn test_rxpk_fields() {
        let pkt = RxPacket::from_uplink(&uplink());
        let value: Value = serde_json::to_value(&pkt).unwrap();
        assert_eq!(value["tmst"], json!(1_000));
        assert_eq!(value["freq"], json!(868.1));
        assert_eq!(value["datr"], json!("SF9BW125"));
        assert_eq!(value["codr"], json!("4/5"));
        assert_eq!(value["modu"], json!("LORA"));
        assert_eq!(value["rssi"], json!(-57));
        assert_eq!(value["size"], json!(5));
        assert_eq!(value["data"], json!("aGVsbG8="));
        assert_eq!(pkt.time, "2023-11-14T22:13:20.123000Z");
    }

    #[esp32_test]
    fn test_push_payload_omits_empty_parts() {
        let only_rx = PushPayload {
            rxpk: vec![RxPacket::from_uplink(&uplink())],
            stat: None,
        };
        let value: Value = serde_json::from_slice(&only_rx.to_bytes().unwrap()).unwrap();
        assert!(value.get("stat").is_none());
        assert_eq!(value["rxpk"].as_array().unwrap().len(), 1);
    }

    #[esp32_test]
    fn test_stat_counts() {
        let counters = StatCounters {
            rx_ok: 10,
            rx_crc_errors: 2,
            uplinks_dropped: 1,
            push_sent: 4,
            push_acked: 3,
            downlinks_received: 2,
            tx_ok: 1,
            ..StatCounters::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let stat = GatewayStatus::new(&counters, &GatewayIdentity::default(), now);
        assert_eq!(stat.time, "2024-03-01 12:30:05 GMT");
        assert_eq!(stat.rxnb, 12);
        assert_eq!(stat.rxok, 10);
        assert_eq!(stat.rxfw, 9);
        assert_eq!(stat.ackr, 75.0);
        assert_eq!(stat.dwnb, 2);
        assert_eq!(stat.txnb, 1);
    }

    #[esp32_test]
    fn test_txpk_to_downlink() {
        let body = br#"{"txpk":{"imme":false,"tmst":5000000,"freq":869.525,"rfch":0,
            "powe":27,"modu":"LORA","datr":"SF9BW125","codr":"4/6","ipol":true,
            "size":3,"data":"AQID"}}"#;
        let txpk = TxPacket::from_pull_resp(body).unwrap();
        let frame = txpk.into_downlink(0x4242, (1u64 << 32) + 10).unwrap();

        assert_eq!(frame.target_us, (1u64 << 32) + 5_000_000);
        assert_eq!(frame.frequency_hz, 869_525_000);
        assert_eq!(frame.spreading_factor, SpreadingFactor::Sf9);
        assert_eq!(frame.coding_rate, CodingRate::Cr4_6);
        assert_eq!(frame.tx_power_dbm, 27);
        assert!(frame.invert_iq);
        assert!(frame.crc);
        assert_eq!(frame.preamble, DEFAULT_PREAMBLE);
        assert_eq!(frame.payload.as_slice(), &[1, 2, 3]);
        assert_eq!(frame.token, 0x4242);
    }

    #[esp32_test]
    fn test_txpk_rejects_bad_fields() {
        let base = json!({"imme": true, "freq": 868.1, "modu": "LORA",
            "datr": "SF7BW125", "data": "AQID"});

        let mut fsk = base.clone();
        fsk["modu"] = json!("FSK");
        let mut sf6 = base.clone();
        sf6["datr"] = json!("SF6BW125");
        let mut timed = base.clone();
        timed["imme"] = json!(false);
        let mut empty = base.clone();
        empty["data"] = json!("");

        for (bad, field) in [(fsk, "modu"), (sf6, "datr"), (timed, "tmst"), (empty, "size")] {
            let txpk: TxPacket = serde_json::from_value(bad).unwrap();
            match txpk.into_downlink(1, 0) {
                Err(ProtocolError::InvalidField { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected {} error, got {:?}", field, other),
            }
        }

        assert!(matches!(
            TxPacket::from_pull_resp(b"{\"rxpk\":[]}"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[esp32_test]
    fn test_tx_ack_errors() {
        let ack = TxAckPayload::new(TxOutcome::TooLate).to_bytes().unwrap();
        assert_eq!(ack, br#"{"txpk_ack":{"error":"TOO_LATE"}}"#);
        let ack = TxAckPayload::new(TxOutcome::Collision).to_bytes().unwrap();
        assert_eq!(ack, br#"{"txpk_ack":{"error":"COLLISION_PACKET"}}"#);
        let ack = TxAckPayload::new(TxOutcome::Sent).to_bytes().unwrap();
        assert_eq!(ack, br#"{"txpk_ack":{"error":"NONE"}}"#);
        assert_eq!(TxAckError::from(TxOutcome::UnsupportedFrequency), TxAckError::TxFreq);
    }
}
