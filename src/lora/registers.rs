//! SX127x register map.
//!
//! Addresses and bit values for the LoRa mode of the SX1276/RFM95 and SX1272
//! transceivers. The two chip families share the map except for the PA DAC
//! register and the modem configuration bit layout, which [`ChipVariant`]
//! captures.

pub const REG_FIFO: u8 = 0x00;
pub const REG_OPMODE: u8 = 0x01;
pub const REG_FRF_MSB: u8 = 0x06;
pub const REG_FRF_MID: u8 = 0x07;
pub const REG_FRF_LSB: u8 = 0x08;
pub const REG_PA_CONFIG: u8 = 0x09;
pub const REG_LNA: u8 = 0x0C;
pub const REG_FIFO_ADDR_PTR: u8 = 0x0D;
pub const REG_FIFO_TX_BASE_ADDR: u8 = 0x0E;
pub const REG_FIFO_RX_BASE_ADDR: u8 = 0x0F;
pub const REG_FIFO_RX_CURRENT_ADDR: u8 = 0x10;
pub const REG_IRQ_FLAGS_MASK: u8 = 0x11;
pub const REG_IRQ_FLAGS: u8 = 0x12;
pub const REG_RX_NB_BYTES: u8 = 0x13;
pub const REG_MODEM_STAT: u8 = 0x18;
pub const REG_PKT_SNR_VALUE: u8 = 0x19;
/// RSSI of the last packet.
pub const REG_PKT_RSSI: u8 = 0x1A;
/// Current RSSI.
pub const REG_RSSI: u8 = 0x1B;
pub const REG_HOP_CHANNEL: u8 = 0x1C;
pub const REG_MODEM_CONFIG1: u8 = 0x1D;
pub const REG_MODEM_CONFIG2: u8 = 0x1E;
pub const REG_SYMB_TIMEOUT_LSB: u8 = 0x1F;
pub const REG_PREAMBLE_MSB: u8 = 0x20;
pub const REG_PREAMBLE_LSB: u8 = 0x21;
pub const REG_PAYLOAD_LENGTH: u8 = 0x22;
pub const REG_MAX_PAYLOAD_LENGTH: u8 = 0x23;
pub const REG_HOP_PERIOD: u8 = 0x24;
pub const REG_MODEM_CONFIG3: u8 = 0x26;
pub const REG_INVERTIQ: u8 = 0x33;
/// Detection threshold (only relevant for SF6).
pub const REG_DET_THRESH: u8 = 0x37;
pub const REG_SYNC_WORD: u8 = 0x39;
pub const REG_DIO_MAPPING_1: u8 = 0x40;
pub const REG_DIO_MAPPING_2: u8 = 0x41;
pub const REG_VERSION: u8 = 0x42;
pub const REG_PADAC_SX1276: u8 = 0x4D;
pub const REG_PADAC_SX1272: u8 = 0x5A;

/// Operating modes written to `REG_OPMODE`, always combined with [`opmode::LORA`].
pub mod opmode {
    pub const LORA: u8 = 0x80;
    pub const MASK: u8 = 0x07;
    pub const SLEEP: u8 = 0x00;
    pub const STANDBY: u8 = 0x01;
    pub const FSTX: u8 = 0x02;
    pub const TX: u8 = 0x03;
    pub const FSRX: u8 = 0x04;
    pub const RX_CONTINUOUS: u8 = 0x05;
    pub const RX_SINGLE: u8 = 0x06;
    pub const CAD: u8 = 0x07;
}

/// DIO pin function mappings for `REG_DIO_MAPPING_1`.
pub mod dio {
    pub const DIO0_RX_DONE: u8 = 0x00;
    pub const DIO0_TX_DONE: u8 = 0x40;
    pub const DIO0_CAD_DONE: u8 = 0x80;
    pub const DIO0_NOP: u8 = 0xC0;

    pub const DIO1_RX_TIMEOUT: u8 = 0x00;
    pub const DIO1_FHSS_CHANGE: u8 = 0x10;
    pub const DIO1_CAD_DETECTED: u8 = 0x20;
    pub const DIO1_NOP: u8 = 0x30;

    pub const DIO2_FHSS_CHANGE: u8 = 0x00;
    pub const DIO2_NOP: u8 = 0x0C;

    pub const DIO3_CAD_DONE: u8 = 0x00;
    pub const DIO3_NOP: u8 = 0x03;
}

/// Bits of `REG_IRQ_FLAGS` / `REG_IRQ_FLAGS_MASK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqFlags(pub u8);

impl IrqFlags {
    pub const RX_TIMEOUT: u8 = 0x80;
    pub const RX_DONE: u8 = 0x40;
    pub const CRC_ERROR: u8 = 0x20;
    pub const VALID_HEADER: u8 = 0x10;
    pub const TX_DONE: u8 = 0x08;
    pub const CAD_DONE: u8 = 0x04;
    pub const FHSS_CHANGE: u8 = 0x02;
    pub const CAD_DETECTED: u8 = 0x01;
    pub const ALL: u8 = 0xFF;

    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Modem status bit: a LoRa preamble has been detected and demodulation is running.
pub const MODEM_STAT_SIGNAL_DETECTED: u8 = 0x01;
/// Modem status bit: a valid header has been received for the current packet.
pub const MODEM_STAT_HEADER_VALID: u8 = 0x08;

/// LNA at maximum gain with boost on the HF port.
pub const LNA_MAX_GAIN: u8 = 0x23;

/// Public LoRaWAN network sync word.
pub const LORAWAN_SYNC_WORD: u8 = 0x34;

/// PA_BOOST output selection bit of `REG_PA_CONFIG`.
pub const PA_BOOST: u8 = 0x80;
/// Default PA DAC setting (+17 dBm max on PA_BOOST).
pub const PADAC_DEFAULT: u8 = 0x84;
/// PA DAC setting that enables +20 dBm on PA_BOOST.
pub const PADAC_HIGH_POWER: u8 = 0x87;

/// `REG_INVERTIQ` value for normal IQ (uplink polarity).
pub const INVERTIQ_OFF: u8 = 0x27;
/// `REG_INVERTIQ` bit that inverts TX IQ (downlinks to LoRaWAN nodes).
pub const INVERTIQ_TX: u8 = 0x40;

/// FIFO base addresses: receive in the lower half, transmit in the upper half.
pub const FIFO_RX_BASE: u8 = 0x00;
pub const FIFO_TX_BASE: u8 = 0x80;

/// Transceiver family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipVariant {
    /// SX1276/SX1277/SX1278/SX1279 and RFM95/96/98 modules.
    Sx1276,
    /// SX1272/SX1273 and RFM92.
    Sx1272,
}

impl ChipVariant {
    /// Expected content of `REG_VERSION`.
    pub fn version(self) -> u8 {
        match self {
            Self::Sx1276 => 0x12,
            Self::Sx1272 => 0x22,
        }
    }

    /// Address of the PA DAC register, the only address that moves between variants.
    pub fn pa_dac_register(self) -> u8 {
        match self {
            Self::Sx1276 => REG_PADAC_SX1276,
            Self::Sx1272 => REG_PADAC_SX1272,
        }
    }

    /// Offset subtracted from the raw packet RSSI to get dBm (HF port).
    pub fn rssi_correction(self) -> i16 {
        match self {
            Self::Sx1276 => 157,
            Self::Sx1272 => 139,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sx1276 => "SX1276",
            Self::Sx1272 => "SX1272",
        }
    }
}

impl Default for ChipVariant {
    fn default() -> Self {
        #[cfg(feature = "chip-sx1272")]
        return Self::Sx1272;
        #[cfg(not(feature = "chip-sx1272"))]
        Self::Sx1276
    }
}
