//! Packet forwarder datagram header.
//!
//! Every datagram starts with a protocol version byte, a two-byte token and
//! a message identifier. PUSH_DATA, PULL_DATA and TX_ACK then carry the
//! 8-byte gateway EUI; the JSON body (if any) follows.
//!
//! ```text
//! | ver | token (BE) | kind | [EUI x8] | body ... |
//! ```

use rand_core::{OsRng, RngCore};
use std::fmt;
use std::str::FromStr;

/// Version written on outbound datagrams.
pub const PROTOCOL_VERSION: u8 = 1;

/// Versions accepted on inbound datagrams.
pub const SUPPORTED_VERSIONS: [u8; 2] = [1, 2];

/// Bytes before the EUI.
pub const HEADER_LEN: usize = 4;

/// Largest datagram the gateway sends or accepts.
pub const MAX_DATAGRAM_LEN: usize = 2048;

/// Message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PushData,
    PushAck,
    PullData,
    PullResp,
    PullAck,
    TxAck,
    /// Restart the gateway.
    MgtReset,
    /// Set the receive spreading factor (one body byte, 7..=12).
    MgtSetSf,
    /// Set the receive channel (one body byte, plan channel index).
    MgtSetFreq,
}

impl MessageKind {
    pub fn id(self) -> u8 {
        match self {
            Self::PushData => 0x00,
            Self::PushAck => 0x01,
            Self::PullData => 0x02,
            Self::PullResp => 0x03,
            Self::PullAck => 0x04,
            Self::TxAck => 0x05,
            Self::MgtReset => 0x15,
            Self::MgtSetSf => 0x16,
            Self::MgtSetFreq => 0x17,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, ProtocolError> {
        Ok(match id {
            0x00 => Self::PushData,
            0x01 => Self::PushAck,
            0x02 => Self::PullData,
            0x03 => Self::PullResp,
            0x04 => Self::PullAck,
            0x05 => Self::TxAck,
            0x15 => Self::MgtReset,
            0x16 => Self::MgtSetSf,
            0x17 => Self::MgtSetFreq,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }

    /// Whether the gateway EUI follows the header.
    pub fn carries_eui(self) -> bool {
        matches!(self, Self::PushData | Self::PullData | Self::TxAck)
    }

    /// The acknowledgement expected for a gateway request.
    pub fn ack(self) -> Option<MessageKind> {
        match self {
            Self::PushData => Some(Self::PushAck),
            Self::PullData => Some(Self::PullAck),
            _ => None,
        }
    }

    pub fn is_management(self) -> bool {
        matches!(self, Self::MgtReset | Self::MgtSetSf | Self::MgtSetFreq)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PushData => "PUSH_DATA",
            Self::PushAck => "PUSH_ACK",
            Self::PullData => "PULL_DATA",
            Self::PullResp => "PULL_RESP",
            Self::PullAck => "PULL_ACK",
            Self::TxAck => "TX_ACK",
            Self::MgtReset => "MGT_RESET",
            Self::MgtSetSf => "MGT_SET_SF",
            Self::MgtSetFreq => "MGT_SET_FREQ",
        };
        f.write_str(name)
    }
}

/// Request/acknowledgement correlation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u16);

impl Token {
    /// Fresh token from the OS random source.
    pub fn random() -> Self {
        Self(OsRng.next_u32() as u16)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// 64-bit gateway identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GatewayEui(pub [u8; 8]);

impl GatewayEui {
    /// Gateway identifier from the Wi-Fi MAC address, FFFF in the middle.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        Self([mac[0], mac[1], mac[2], 0xFF, 0xFF, mac[3], mac[4], mac[5]])
    }
}

impl fmt::Display for GatewayEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl FromStr for GatewayEui {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.len() != 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidEui(s.to_string()));
        }
        let mut eui = [0u8; 8];
        for (i, byte) in eui.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| ProtocolError::InvalidEui(s.to_string()))?;
        }
        Ok(Self(eui))
    }
}

impl serde::Serialize for GatewayEui {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for GatewayEui {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Decoded datagram, borrowing the body from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram<'a> {
    pub version: u8,
    pub token: Token,
    pub kind: MessageKind,
    pub eui: Option<GatewayEui>,
    pub body: &'a [u8],
}

/// Build a datagram. The EUI is written only for kinds that carry one.
pub fn encode(kind: MessageKind, token: Token, eui: &GatewayEui, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 8 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&token.0.to_be_bytes());
    out.push(kind.id());
    if kind.carries_eui() {
        out.extend_from_slice(&eui.0);
    }
    out.extend_from_slice(body);
    out
}

/// Parse a datagram header.
pub fn decode(buf: &[u8]) -> Result<Datagram<'_>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::TooShort(buf.len()));
    }
    let version = buf[0];
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let token = Token(u16::from_be_bytes([buf[1], buf[2]]));
    let kind = MessageKind::from_id(buf[3])?;

    let (eui, body) = if kind.carries_eui() {
        if buf.len() < HEADER_LEN + 8 {
            return Err(ProtocolError::TooShort(buf.len()));
        }
        let mut eui = [0u8; 8];
        eui.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + 8]);
        (Some(GatewayEui(eui)), &buf[HEADER_LEN + 8..])
    } else {
        (None, &buf[HEADER_LEN..])
    };

    Ok(Datagram {
        version,
        token,
        kind,
        eui,
        body,
    })
}

/// Wire protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    TooShort(usize),
    UnsupportedVersion(u8),
    UnknownKind(u8),
    InvalidEui(String),
    /// Body is not the expected JSON.
    Json(String),
    /// A field has a value the gateway cannot use.
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "datagram too short: {} bytes", len),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            Self::UnknownKind(id) => write!(f, "unknown message identifier {:#04x}", id),
            Self::InvalidEui(s) => write!(f, "invalid gateway EUI: {}", s),
            Self::Json(e) => write!(f, "invalid JSON body: {}", e),
            Self::InvalidField { field, reason } => write!(f, "invalid {}: {}", field, reason),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}
