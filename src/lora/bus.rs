//! Register interface over the shared SPI bus.
//!
//! [`RegisterBus`] is the raw transport (one chip-select transaction per call),
//! implemented by the ESP32 SPI driver and by the simulated transceiver.
//! [`RegisterInterface`] owns the bus lock: every register access, from any
//! context, goes through it. Multi-register sequences that must not be
//! interleaved (FIFO drain, TX setup) run inside [`RegisterInterface::transaction`].
//!
//! Work driven by the main loop's timers uses [`RegisterInterface::try_transaction`]
//! so that it yields to a holder that got there first instead of queueing
//! behind it.

use super::registers::REG_FIFO;
use heapless::Vec as HVec;
use log::warn;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

/// Maximum LoRa payload handled by the gateway (FIFO half).
pub const MAX_PAYLOAD_LENGTH: usize = 128;

/// Payload buffer with the FIFO-sized capacity.
pub type Payload = HVec<u8, MAX_PAYLOAD_LENGTH>;

/// Longest time a single SPI transaction may take before the transport
/// reports [`RegisterError::BusTimeout`].
pub const BUS_TIMEOUT: Duration = Duration::from_millis(10);

/// Raw register transport.
///
/// Implementations perform exactly one bus transaction per call and must
/// return [`RegisterError::BusTimeout`] when the transceiver does not
/// acknowledge within [`BUS_TIMEOUT`].
pub trait RegisterBus: Send {
    /// Read `buf.len()` consecutive bytes starting at `addr`.
    ///
    /// Reading `REG_FIFO` repeatedly pops the FIFO; the chip auto-increments
    /// its FIFO pointer.
    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), RegisterError>;

    /// Write `data` starting at `addr`.
    fn write(&mut self, addr: u8, data: &[u8]) -> Result<(), RegisterError>;
}

/// Register access errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// The transceiver did not acknowledge the transfer in time.
    BusTimeout,
    /// The SPI driver reported an error.
    Transfer(String),
    /// A burst transfer larger than the FIFO-sized buffer was requested.
    BurstTooLong { len: usize, max: usize },
    /// The bus lock is held elsewhere (only returned by `try_transaction`).
    Busy,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BusTimeout => write!(f, "register bus timeout"),
            Self::Transfer(e) => write!(f, "SPI transfer error: {}", e),
            Self::BurstTooLong { len, max } => {
                write!(f, "burst too long: {} bytes (max {})", len, max)
            }
            Self::Busy => write!(f, "register bus busy"),
        }
    }
}

impl std::error::Error for RegisterError {}

/// Exclusive access to the bus for the duration of a transaction.
pub struct BusGuard<'a, B: RegisterBus> {
    bus: MutexGuard<'a, B>,
}

impl<B: RegisterBus> BusGuard<'_, B> {
    pub fn read_register(&mut self, addr: u8) -> Result<u8, RegisterError> {
        let mut value = [0u8; 1];
        self.bus.read(addr, &mut value)?;
        Ok(value[0])
    }

    pub fn write_register(&mut self, addr: u8, value: u8) -> Result<(), RegisterError> {
        self.bus.write(addr, &[value])
    }

    /// Read `len` bytes from `addr` in one burst.
    pub fn read_burst(&mut self, addr: u8, len: usize) -> Result<Payload, RegisterError> {
        if len > MAX_PAYLOAD_LENGTH {
            return Err(RegisterError::BurstTooLong {
                len,
                max: MAX_PAYLOAD_LENGTH,
            });
        }
        let mut buf = [0u8; MAX_PAYLOAD_LENGTH];
        self.bus.read(addr, &mut buf[..len])?;
        // Cannot fail: len was checked against the capacity above.
        Ok(HVec::from_slice(&buf[..len]).unwrap_or_default())
    }

    pub fn write_burst(&mut self, addr: u8, data: &[u8]) -> Result<(), RegisterError> {
        if data.len() > MAX_PAYLOAD_LENGTH {
            return Err(RegisterError::BurstTooLong {
                len: data.len(),
                max: MAX_PAYLOAD_LENGTH,
            });
        }
        self.bus.write(addr, data)
    }

    /// Read-modify-write of a single register.
    pub fn update_register(&mut self, addr: u8, mask: u8, bits: u8) -> Result<(), RegisterError> {
        let current = self.read_register(addr)?;
        self.write_register(addr, (current & !mask) | (bits & mask))
    }

    /// Pop `len` bytes from the FIFO.
    pub fn read_fifo(&mut self, len: usize) -> Result<Payload, RegisterError> {
        self.read_burst(REG_FIFO, len)
    }

    pub fn write_fifo(&mut self, data: &[u8]) -> Result<(), RegisterError> {
        self.write_burst(REG_FIFO, data)
    }
}

/// Lock-protected register interface.
///
/// Cloning shares the same bus and lock.
pub struct RegisterInterface<B: RegisterBus> {
    bus: Arc<Mutex<B>>,
}

impl<B: RegisterBus> Clone for RegisterInterface<B> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
        }
    }
}

impl<B: RegisterBus> RegisterInterface<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus: Arc::new(Mutex::new(bus)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, B> {
        // A panic while holding the lock leaves the bus itself usable;
        // the next transaction starts from a fresh chip-select.
        match self.bus.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Register bus mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Run `f` with the bus lock held for its whole duration.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut BusGuard<'_, B>) -> Result<R, RegisterError>,
    ) -> Result<R, RegisterError> {
        let mut guard = BusGuard { bus: self.lock() };
        f(&mut guard)
    }

    /// Like [`transaction`](Self::transaction) but fails with
    /// [`RegisterError::Busy`] instead of waiting for the lock.
    pub fn try_transaction<R>(
        &self,
        f: impl FnOnce(&mut BusGuard<'_, B>) -> Result<R, RegisterError>,
    ) -> Result<R, RegisterError> {
        let bus = match self.bus.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(RegisterError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("Register bus mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let mut guard = BusGuard { bus };
        f(&mut guard)
    }

    pub fn read_register(&self, addr: u8) -> Result<u8, RegisterError> {
        self.transaction(|bus| bus.read_register(addr))
    }

    pub fn write_register(&self, addr: u8, value: u8) -> Result<(), RegisterError> {
        self.transaction(|bus| bus.write_register(addr, value))
    }

    pub fn read_burst(&self, addr: u8, len: usize) -> Result<Payload, RegisterError> {
        self.transaction(|bus| bus.read_burst(addr, len))
    }

    pub fn write_burst(&self, addr: u8, data: &[u8]) -> Result<(), RegisterError> {
        self.transaction(|bus| bus.write_burst(addr, data))
    }
}
