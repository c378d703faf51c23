//! SX127x on the ESP32 SPI bus.
//!
//! Register transport and DIO interrupt wiring for Heltec-style boards
//! (WiFi LoRa 32, TTGO LoRa32).
//!
//! # Pin Configuration
//!
//! | Signal | GPIO | Notes |
//! |--------|------|-------|
//! | SPI CLK | 5 | SPI Clock |
//! | SPI MISO | 19 | Master In Slave Out |
//! | SPI MOSI | 27 | Master Out Slave In |
//! | NSS (CS) | 18 | Chip Select |
//! | RESET | 14 | Radio Reset |
//! | DIO0 | 26 | RxDone / TxDone / CadDone |
//! | DIO1 | 33 | RxTimeout / CadDetected |
//!
//! Every SPI frame is one address byte (bit 7 set for writes) followed by
//! the data. The chip auto-increments the address within a burst, except on
//! `REG_FIFO` where it advances the FIFO pointer instead.

use super::bus::{RegisterBus, RegisterError, MAX_PAYLOAD_LENGTH};
use crate::gateway::{DioLine, IrqSlot};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{
    Gpio14, Gpio18, Gpio19, Gpio26, Gpio27, Gpio33, Gpio5, Input, InputPin, InterruptType,
    Output, OutputPin, PinDriver, Pull,
};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::spi::config::Config as SpiConfig;
use esp_idf_hal::spi::config::DriverConfig;
use esp_idf_hal::spi::{SpiDeviceDriver, SpiDriver, SPI2};
use esp_idf_hal::units::FromValueType;
use esp_idf_sys::EspError;
use log::{debug, info};
use std::sync::Arc;

/// Address bit selecting a register write.
const WRITE_FLAG: u8 = 0x80;

/// One address byte plus the largest burst.
const FRAME_LEN: usize = MAX_PAYLOAD_LENGTH + 1;

/// Microseconds since boot from the ESP high-resolution timer.
///
/// Safe to call from interrupt context. The gateway clock is aligned to this
/// counter with [`crate::gateway::Clock::with_elapsed`].
pub fn timer_us() -> u64 {
    // SAFETY: esp_timer_get_time has no preconditions and is ISR-safe.
    let now = unsafe { esp_idf_sys::esp_timer_get_time() };
    now.max(0) as u64
}

fn transfer_error(e: EspError) -> RegisterError {
    if e.code() == esp_idf_sys::ESP_ERR_TIMEOUT as esp_idf_sys::esp_err_t {
        RegisterError::BusTimeout
    } else {
        RegisterError::Transfer(format!("{:?}", e))
    }
}

/// SX127x register transport over `SPI2`.
pub struct EspSpiBus<'d> {
    device: SpiDeviceDriver<'d, SpiDriver<'d>>,
}

impl<'d> EspSpiBus<'d> {
    /// Configure `SPI2` for the transceiver.
    ///
    /// The SX127x accepts up to 10 MHz; 8 MHz leaves margin for long
    /// board traces.
    pub fn new(
        spi: impl Peripheral<P = SPI2> + 'd,
        sclk: impl Peripheral<P = Gpio5> + 'd,
        mosi: impl Peripheral<P = Gpio27> + 'd,
        miso: impl Peripheral<P = Gpio19> + 'd,
        cs: impl Peripheral<P = Gpio18> + 'd,
    ) -> Result<Self, RegisterError> {
        let spi_config = SpiConfig::new().baudrate(8.MHz().into());
        let driver_config = DriverConfig::new();

        let spi_driver =
            SpiDriver::new(spi, sclk, mosi, Some(miso), &driver_config).map_err(transfer_error)?;
        let device =
            SpiDeviceDriver::new(spi_driver, Some(cs), &spi_config).map_err(transfer_error)?;

        info!("SX127x SPI bus ready");
        Ok(Self { device })
    }
}

impl RegisterBus for EspSpiBus<'_> {
    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), RegisterError> {
        if buf.len() >= FRAME_LEN {
            return Err(RegisterError::BurstTooLong {
                len: buf.len(),
                max: MAX_PAYLOAD_LENGTH,
            });
        }
        let mut frame = [0u8; FRAME_LEN];
        let frame = &mut frame[..buf.len() + 1];
        frame[0] = addr & !WRITE_FLAG;
        self.device
            .transfer_in_place(frame)
            .map_err(transfer_error)?;
        buf.copy_from_slice(&frame[1..]);
        Ok(())
    }

    fn write(&mut self, addr: u8, data: &[u8]) -> Result<(), RegisterError> {
        if data.len() >= FRAME_LEN {
            return Err(RegisterError::BurstTooLong {
                len: data.len(),
                max: MAX_PAYLOAD_LENGTH,
            });
        }
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = addr | WRITE_FLAG;
        frame[1..=data.len()].copy_from_slice(data);
        self.device
            .write(&frame[..data.len() + 1])
            .map_err(transfer_error)
    }
}

/// Pulse the transceiver's reset line and wait for it to come up.
pub fn reset_transceiver(
    reset: impl Peripheral<P = Gpio14> + 'static,
) -> Result<PinDriver<'static, Gpio14, Output>, RegisterError> {
    debug!("Resetting transceiver");
    let mut pin = PinDriver::output(reset).map_err(transfer_error)?;
    pin.set_low().map_err(transfer_error)?;
    FreeRtos::delay_ms(1);
    pin.set_high().map_err(transfer_error)?;
    FreeRtos::delay_ms(10);
    Ok(pin)
}

/// DIO0/DIO1 rising-edge interrupts feeding an [`IrqSlot`].
///
/// The handlers only record the line and the timer value. ESP-IDF disables a
/// pin interrupt after it fires, so the main loop calls [`DioInterrupts::rearm`]
/// once per iteration.
pub struct DioInterrupts {
    dio0: PinDriver<'static, Gpio26, Input>,
    dio1: PinDriver<'static, Gpio33, Input>,
}

impl DioInterrupts {
    pub fn new(
        dio0: impl Peripheral<P = Gpio26> + 'static,
        dio1: impl Peripheral<P = Gpio33> + 'static,
        irq: Arc<IrqSlot>,
    ) -> Result<Self, RegisterError> {
        let mut dio0 = PinDriver::input(dio0).map_err(transfer_error)?;
        let mut dio1 = PinDriver::input(dio1).map_err(transfer_error)?;

        dio0.subscribe_line(DioLine::Dio0, irq.clone())?;
        dio1.subscribe_line(DioLine::Dio1, irq)?;

        let mut interrupts = Self { dio0, dio1 };
        interrupts.rearm()?;
        info!("DIO0/DIO1 interrupts enabled");
        Ok(interrupts)
    }

    /// Re-enable both interrupts.
    pub fn rearm(&mut self) -> Result<(), RegisterError> {
        self.dio0.enable_interrupt().map_err(transfer_error)?;
        self.dio1.enable_interrupt().map_err(transfer_error)
    }
}

trait DioPin {
    fn subscribe_line(&mut self, line: DioLine, irq: Arc<IrqSlot>) -> Result<(), RegisterError>;
}

impl<P: InputPin + OutputPin> DioPin for PinDriver<'static, P, Input> {
    fn subscribe_line(&mut self, line: DioLine, irq: Arc<IrqSlot>) -> Result<(), RegisterError> {
        self.set_pull(Pull::Down).map_err(transfer_error)?;
        self.set_interrupt_type(InterruptType::PosEdge)
            .map_err(transfer_error)?;
        // SAFETY: the handler only touches atomics and the ISR-safe timer.
        unsafe {
            self.subscribe(move || irq.signal(line, timer_us() as u32))
                .map_err(transfer_error)?;
        }
        Ok(())
    }
}
