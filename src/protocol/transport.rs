//! UDP transport to the packet forwarder backend.
//!
//! The gateway is the client: one socket, connected to the backend address,
//! non-blocking so the main loop never waits on the network.
//!
//! # Platform Notes
//!
//! - **Host**: std::net directly
//! - **ESP32**: std::net over ESP-IDF lwIP; Wi-Fi must be up before
//!   [`UdpTransport::connect`] is called

use log::{debug, error, info};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::packet::MAX_DATAGRAM_LEN;

/// Default backend port.
pub const DEFAULT_PORT: u16 = 1700;

/// Datagram transport used by the forwarder.
pub trait Transport {
    /// Send one datagram.
    fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Receive one datagram if one is waiting. Never blocks.
    fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;
}

/// Connected, non-blocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    server: String,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Resolve `server` ("host:port", or "host" for port 1700) and connect.
    pub fn connect(server: &str) -> Result<Self, TransportError> {
        let address = if server.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
            server.to_string()
        } else {
            format!("{}:{}", server, DEFAULT_PORT)
        };
        info!("Connecting to backend {}", address);

        let peer = address
            .to_socket_addrs()
            .map_err(|e| {
                error!("DNS resolution failed for {}: {}", address, e);
                TransportError::DnsResolution(e)
            })?
            .next()
            .ok_or_else(|| {
                error!("No addresses found for {}", address);
                TransportError::NoAddresses
            })?;
        debug!("Resolved {} to {}", address, peer);

        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).map_err(TransportError::Bind)?;
        socket.connect(peer).map_err(|e| {
            error!("UDP connect to {} failed: {}", peer, e);
            TransportError::Connection(e)
        })?;
        socket.set_nonblocking(true).map_err(TransportError::Io)?;

        info!(
            "Backend socket {} -> {}",
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            peer
        );
        Ok(Self {
            socket,
            server: address,
            peer,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
        if datagram.len() > MAX_DATAGRAM_LEN {
            return Err(TransportError::TooLarge(datagram.len()));
        }
        match self.socket.send(datagram) {
            Ok(n) if n == datagram.len() => Ok(()),
            Ok(n) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {} of {} bytes", n, datagram.len()),
            ))),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        match self.socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("server", &self.server)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Transport errors.
#[derive(Debug)]
pub enum TransportError {
    /// DNS resolution failed.
    DnsResolution(io::Error),
    /// No addresses found for hostname.
    NoAddresses,
    /// Local socket could not be bound.
    Bind(io::Error),
    /// Connecting the socket to the backend failed.
    Connection(io::Error),
    /// Datagram larger than the protocol allows.
    TooLarge(usize),
    /// I/O error during send/receive.
    Io(io::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DnsResolution(e) => write!(f, "DNS resolution failed: {}", e),
            Self::NoAddresses => write!(f, "no addresses found for hostname"),
            Self::Bind(e) => write!(f, "bind failed: {}", e),
            Self::Connection(e) => write!(f, "connection failed: {}", e),
            Self::TooLarge(len) => {
                write!(f, "datagram too large: {} bytes (max {})", len, MAX_DATAGRAM_LEN)
            }
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DnsResolution(e) | Self::Bind(e) | Self::Connection(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use lora_1ch_gateway_macros::esp32_test;
    use std::time::{Duration, Instant};

    #[esp32_test]
    fn test_udp_round_trip_on_loopback() {
        let backend = UdpSocket::bind("127.0.0.1:0").unwrap();
        let backend_addr = backend.local_addr().unwrap();
        backend
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let mut transport = UdpTransport::connect(&backend_addr.to_string()).unwrap();
        assert_eq!(transport.peer(), backend_addr);

        let mut buf = [0u8; 64];
        assert!(transport.try_recv(&mut buf).unwrap().is_none());

        transport.send(&[1, 0x12, 0x34, 2]).unwrap();
        let (n, from) = backend.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 0x12, 0x34, 2]);

        backend.send_to(&[1, 0x12, 0x34, 4], from).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let received = loop {
            if let Some(n) = transport.try_recv(&mut buf).unwrap() {
                break n;
            }
            assert!(Instant::now() < deadline, "no reply from loopback backend");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(&buf[..received], &[1, 0x12, 0x34, 4]);
    }

    #[esp32_test]
    fn test_oversized_datagram_rejected() {
        let backend = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut transport =
            UdpTransport::connect(&backend.local_addr().unwrap().to_string()).unwrap();
        let big = vec![0u8; MAX_DATAGRAM_LEN + 1];
        assert!(matches!(
            transport.send(&big),
            Err(TransportError::TooLarge(_))
        ));
    }

    #[esp32_test]
    fn test_unresolvable_server() {
        let result = UdpTransport::connect("no-such-host.invalid:1700");
        assert!(matches!(
            result,
            Err(TransportError::DnsResolution(_)) | Err(TransportError::NoAddresses)
        ));
    }
}
