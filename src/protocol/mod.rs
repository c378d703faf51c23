//! Semtech UDP packet forwarder protocol.
//!
//! - [`packet`]: datagram header, message kinds, tokens, gateway EUI
//! - [`frames`]: `rxpk` / `stat` / `txpk` / `txpk_ack` JSON bodies
//! - [`acks`]: token tracking for PUSH_DATA and PULL_DATA
//! - [`transport`]: non-blocking UDP socket to the backend
//! - [`forwarder`]: the client that ties them together

pub mod acks;
pub mod forwarder;
pub mod frames;
pub mod packet;
pub mod transport;

pub use acks::{AckMatch, AckTracker, TokenTimeout};
pub use forwarder::{Forwarder, ForwarderSettings, Inbound, ManagementCommand, MAX_RETAINED};
pub use frames::{GatewayStatus, PushPayload, RxPacket, TxAckError, TxAckPayload, TxPacket};
pub use packet::{
    decode, encode, Datagram, GatewayEui, MessageKind, ProtocolError, Token, PROTOCOL_VERSION,
};
pub use transport::{Transport, TransportError, UdpTransport, DEFAULT_PORT};
