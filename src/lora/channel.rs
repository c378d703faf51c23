//! Channel and modem configuration.
//!
//! Translates a logical channel (frequency, spreading factor, bandwidth,
//! coding rate) into SX127x register values and writes them. The frequency
//! registers hold `round(frequency / step)` with `step = 32 MHz / 2^19`
//! (about 61 Hz).

use super::bus::{BusGuard, RegisterBus, RegisterError, RegisterInterface};
use super::plan::FrequencyPlan;
use super::registers::*;
use crate::gateway::RadioState;
use std::fmt;
use std::str::FromStr;

/// Crystal frequency of the SX127x reference design.
pub const CRYSTAL_HZ: u64 = 32_000_000;

/// Symbol timeout used by single receives after CAD (in symbols).
pub const SYMBOL_TIMEOUT: u8 = 0x08;

/// LoRa spreading factor. SF6 needs implicit header mode and is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpreadingFactor {
    Sf7 = 7,
    Sf8 = 8,
    Sf9 = 9,
    Sf10 = 10,
    Sf11 = 11,
    Sf12 = 12,
}

impl SpreadingFactor {
    pub const ALL: [SpreadingFactor; 6] = [
        Self::Sf7,
        Self::Sf8,
        Self::Sf9,
        Self::Sf10,
        Self::Sf11,
        Self::Sf12,
    ];

    pub fn value(self) -> u8 {
        self as u8
    }

    /// Next factor of the CAD sweep, wrapping from SF12 back to SF7.
    pub fn next_wrapping(self) -> Self {
        match self {
            Self::Sf7 => Self::Sf8,
            Self::Sf8 => Self::Sf9,
            Self::Sf9 => Self::Sf10,
            Self::Sf10 => Self::Sf11,
            Self::Sf11 => Self::Sf12,
            Self::Sf12 => Self::Sf7,
        }
    }
}

impl TryFrom<u8> for SpreadingFactor {
    type Error = ChannelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            7 => Ok(Self::Sf7),
            8 => Ok(Self::Sf8),
            9 => Ok(Self::Sf9),
            10 => Ok(Self::Sf10),
            11 => Ok(Self::Sf11),
            12 => Ok(Self::Sf12),
            other => Err(ChannelError::UnsupportedSpreadingFactor(other)),
        }
    }
}

impl fmt::Display for SpreadingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SF{}", self.value())
    }
}

/// Signal bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bandwidth {
    Khz125,
    Khz250,
    Khz500,
}

impl Bandwidth {
    pub fn khz(self) -> u32 {
        match self {
            Self::Khz125 => 125,
            Self::Khz250 => 250,
            Self::Khz500 => 500,
        }
    }

    pub fn hz(self) -> u32 {
        self.khz() * 1000
    }

    pub fn from_khz(khz: u32) -> Result<Self, ChannelError> {
        match khz {
            125 => Ok(Self::Khz125),
            250 => Ok(Self::Khz250),
            500 => Ok(Self::Khz500),
            other => Err(ChannelError::UnsupportedBandwidth(other)),
        }
    }
}

/// Forward error correction rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodingRate {
    Cr4_5,
    Cr4_6,
    Cr4_7,
    Cr4_8,
}

impl CodingRate {
    /// Denominator of the rate (5 for 4/5).
    pub fn denominator(self) -> u8 {
        match self {
            Self::Cr4_5 => 5,
            Self::Cr4_6 => 6,
            Self::Cr4_7 => 7,
            Self::Cr4_8 => 8,
        }
    }

    /// The 3-bit register encoding shared by both variants (1 for 4/5).
    fn bits(self) -> u8 {
        self.denominator() - 4
    }
}

impl fmt::Display for CodingRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "4/{}", self.denominator())
    }
}

impl FromStr for CodingRate {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "4/5" => Ok(Self::Cr4_5),
            "4/6" | "2/3" => Ok(Self::Cr4_6),
            "4/7" => Ok(Self::Cr4_7),
            "4/8" | "1/2" => Ok(Self::Cr4_8),
            other => Err(ChannelError::UnsupportedCodingRate(other.to_string())),
        }
    }
}

/// Data rate string of the forwarder protocol, e.g. `SF7BW125`.
pub fn format_datarate(sf: SpreadingFactor, bw: Bandwidth) -> String {
    format!("SF{}BW{}", sf.value(), bw.khz())
}

/// Parse a `SF<n>BW<khz>` data rate string.
pub fn parse_datarate(datr: &str) -> Result<(SpreadingFactor, Bandwidth), ChannelError> {
    let malformed = || ChannelError::MalformedDatarate(datr.to_string());
    let rest = datr.strip_prefix("SF").ok_or_else(malformed)?;
    let (sf, bw) = rest.split_once("BW").ok_or_else(malformed)?;
    let sf: u8 = sf.parse().map_err(|_| malformed())?;
    let bw: u32 = bw.parse().map_err(|_| malformed())?;
    Ok((SpreadingFactor::try_from(sf)?, Bandwidth::from_khz(bw)?))
}

/// Symbol duration in microseconds.
pub fn symbol_duration_us(sf: SpreadingFactor, bw: Bandwidth) -> u64 {
    (1u64 << sf.value()) * 1_000_000 / bw.hz() as u64
}

/// Low data rate optimisation is mandatory above 16 ms per symbol
/// (SF11/SF12 at 125 kHz, SF12 at 250 kHz).
pub fn low_data_rate_optimize(sf: SpreadingFactor, bw: Bandwidth) -> bool {
    symbol_duration_us(sf, bw) > 16_000
}

/// Time on air of an explicit-header packet with CRC, in microseconds.
pub fn airtime_us(
    payload_len: usize,
    sf: SpreadingFactor,
    bw: Bandwidth,
    cr: CodingRate,
    preamble_symbols: u16,
) -> u64 {
    let sf_v = sf.value() as i64;
    let de = low_data_rate_optimize(sf, bw) as i64;
    let t_sym = symbol_duration_us(sf, bw);

    // 8*PL - 4*SF + 28 + 16 (CRC), explicit header
    let numerator = 8 * payload_len as i64 - 4 * sf_v + 28 + 16;
    let denominator = 4 * (sf_v - 2 * de);
    let ceil = (numerator + denominator - 1).div_euclid(denominator).max(0);
    let payload_symbols = 8 + ceil as u64 * cr.denominator() as u64;

    // preamble + 4.25 symbols, kept in quarter symbols to stay integral
    let preamble_quarters = (preamble_symbols as u64 * 4 + 17) * t_sym / 4;
    preamble_quarters + payload_symbols * t_sym
}

/// Logical channel the gateway listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub frequency_hz: u32,
    pub spreading_factor: SpreadingFactor,
    pub bandwidth: Bandwidth,
    pub coding_rate: CodingRate,
    /// Sweep spreading factors with channel activity detection instead of
    /// continuous receive.
    pub cad_enabled: bool,
    /// Hop over the first plan channels during CAD.
    pub hop_enabled: bool,
}

impl ChannelConfig {
    /// Channel `index` of `plan` at 125 kHz, 4/5, continuous receive.
    pub fn from_plan(
        plan: FrequencyPlan,
        index: u8,
        spreading_factor: SpreadingFactor,
    ) -> Result<Self, ChannelError> {
        let frequency_hz = plan
            .frequency(index)
            .ok_or(ChannelError::UnknownChannel(index))?;
        Ok(Self {
            frequency_hz,
            spreading_factor,
            bandwidth: Bandwidth::Khz125,
            coding_rate: CodingRate::Cr4_5,
            cad_enabled: false,
            hop_enabled: false,
        })
    }

    /// Check the configuration against `plan`.
    pub fn validate(&self, plan: FrequencyPlan) -> Result<(), ChannelError> {
        if !plan.contains(self.frequency_hz) {
            return Err(ChannelError::UnsupportedFrequency(self.frequency_hz));
        }
        Ok(())
    }

    pub fn channel_index(&self, plan: FrequencyPlan) -> Option<u8> {
        plan.channel_index(self.frequency_hz)
    }
}

/// Values for `REG_MODEM_CONFIG1..3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemRegisters {
    pub config1: u8,
    pub config2: u8,
    /// SX1276 only; the SX1272 keeps these bits in `config1`/`config2`.
    pub config3: Option<u8>,
}

impl ModemRegisters {
    pub fn compute(
        variant: ChipVariant,
        sf: SpreadingFactor,
        bw: Bandwidth,
        cr: CodingRate,
        crc: bool,
    ) -> Self {
        let ldro = low_data_rate_optimize(sf, bw);
        match variant {
            ChipVariant::Sx1276 => {
                // BW[7:4] CR[3:1] ImplicitHeader[0]
                let bw_bits = match bw {
                    Bandwidth::Khz125 => 0x70,
                    Bandwidth::Khz250 => 0x80,
                    Bandwidth::Khz500 => 0x90,
                };
                // SF[7:4] TxCont[3] RxCrcOn[2]
                let config2 = (sf.value() << 4) | if crc { 0x04 } else { 0x00 };
                // LDRO[3] AgcAutoOn[2]
                let config3 = 0x04 | if ldro { 0x08 } else { 0x00 };
                Self {
                    config1: bw_bits | (cr.bits() << 1),
                    config2,
                    config3: Some(config3),
                }
            }
            ChipVariant::Sx1272 => {
                // BW[7:6] CR[5:3] ImplicitHeader[2] RxCrcOn[1] LDRO[0]
                let bw_bits = match bw {
                    Bandwidth::Khz125 => 0x00,
                    Bandwidth::Khz250 => 0x40,
                    Bandwidth::Khz500 => 0x80,
                };
                let config1 = bw_bits
                    | (cr.bits() << 3)
                    | if crc { 0x02 } else { 0x00 }
                    | if ldro { 0x01 } else { 0x00 };
                // SF[7:4] TxCont[3] AgcAutoOn[2]
                Self {
                    config1,
                    config2: (sf.value() << 4) | 0x04,
                    config3: None,
                }
            }
        }
    }
}

/// Frequency register value for `frequency_hz`, rounded to the nearest step.
pub fn frf_from_hz(frequency_hz: u32) -> u32 {
    ((((frequency_hz as u64) << 19) + CRYSTAL_HZ / 2) / CRYSTAL_HZ) as u32
}

/// Frequency in Hz for a frequency register value, rounded to the nearest Hz.
pub fn hz_from_frf(frf: u32) -> u32 {
    ((frf as u64 * CRYSTAL_HZ + (1 << 18)) >> 19) as u32
}

/// Write the frequency registers (MSB first).
pub(crate) fn write_frequency<B: RegisterBus>(
    bus: &mut BusGuard<'_, B>,
    frequency_hz: u32,
) -> Result<(), RegisterError> {
    let frf = frf_from_hz(frequency_hz);
    bus.write_register(REG_FRF_MSB, (frf >> 16) as u8)?;
    bus.write_register(REG_FRF_MID, (frf >> 8) as u8)?;
    bus.write_register(REG_FRF_LSB, frf as u8)
}

/// Write the modem configuration registers for one hypothesis.
pub(crate) fn write_modem<B: RegisterBus>(
    bus: &mut BusGuard<'_, B>,
    variant: ChipVariant,
    sf: SpreadingFactor,
    bw: Bandwidth,
    cr: CodingRate,
    crc: bool,
) -> Result<(), RegisterError> {
    let modem = ModemRegisters::compute(variant, sf, bw, cr, crc);
    bus.write_register(REG_MODEM_CONFIG1, modem.config1)?;
    bus.write_register(REG_MODEM_CONFIG2, modem.config2)?;
    if let Some(config3) = modem.config3 {
        bus.write_register(REG_MODEM_CONFIG3, config3)?;
    }
    Ok(())
}

/// Retune frequency and spreading factor in standby, keeping the remaining
/// settings of `config`. Used by the CAD sweep and by hopping.
pub(crate) fn write_hypothesis<B: RegisterBus>(
    bus: &mut BusGuard<'_, B>,
    variant: ChipVariant,
    config: &ChannelConfig,
    frequency_hz: u32,
    sf: SpreadingFactor,
) -> Result<(), RegisterError> {
    bus.write_register(REG_OPMODE, opmode::LORA | opmode::STANDBY)?;
    write_frequency(bus, frequency_hz)?;
    write_modem(bus, variant, sf, config.bandwidth, config.coding_rate, true)
}

/// Apply `config` to the transceiver.
///
/// Only allowed while the state machine is quiesced (`Init` or `Scan`). On a
/// validation error nothing is written.
pub fn apply_config<B: RegisterBus>(
    regs: &RegisterInterface<B>,
    config: &ChannelConfig,
    plan: FrequencyPlan,
    variant: ChipVariant,
    state: RadioState,
) -> Result<(), ChannelError> {
    if !matches!(state, RadioState::Init | RadioState::Scan) {
        return Err(ChannelError::NotQuiesced(state));
    }
    config.validate(plan)?;

    regs.transaction(|bus| {
        bus.write_register(REG_OPMODE, opmode::LORA | opmode::SLEEP)?;
        bus.write_register(REG_OPMODE, opmode::LORA | opmode::STANDBY)?;
        write_frequency(bus, config.frequency_hz)?;
        write_modem(
            bus,
            variant,
            config.spreading_factor,
            config.bandwidth,
            config.coding_rate,
            true,
        )?;
        bus.write_register(REG_SYNC_WORD, LORAWAN_SYNC_WORD)?;
        bus.write_register(REG_SYMB_TIMEOUT_LSB, SYMBOL_TIMEOUT)?;
        bus.write_register(REG_MAX_PAYLOAD_LENGTH, 0x80)?;
        bus.write_register(REG_PAYLOAD_LENGTH, 0x40)?;
        bus.write_register(REG_HOP_PERIOD, 0x00)?;
        bus.write_register(REG_FIFO_RX_BASE_ADDR, FIFO_RX_BASE)?;
        bus.write_register(REG_FIFO_TX_BASE_ADDR, FIFO_TX_BASE)?;
        bus.write_register(REG_INVERTIQ, INVERTIQ_OFF)?;
        bus.write_register(REG_LNA, LNA_MAX_GAIN)
    })?;

    log::debug!(
        "Applied channel {:.3} MHz {} BW{} CR{} on {}",
        config.frequency_hz as f64 / 1e6,
        config.spreading_factor,
        config.bandwidth.khz(),
        config.coding_rate,
        variant.name()
    );
    Ok(())
}

/// Frequency currently programmed in the FRF registers.
pub fn read_frequency<B: RegisterBus>(regs: &RegisterInterface<B>) -> Result<u32, RegisterError> {
    let frf = regs.transaction(|bus| {
        let msb = bus.read_register(REG_FRF_MSB)? as u32;
        let mid = bus.read_register(REG_FRF_MID)? as u32;
        let lsb = bus.read_register(REG_FRF_LSB)? as u32;
        Ok((msb << 16) | (mid << 8) | lsb)
    })?;
    Ok(hz_from_frf(frf))
}

/// Channel configuration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Frequency is not part of the active frequency plan.
    UnsupportedFrequency(u32),
    /// Spreading factor outside 7..=12.
    UnsupportedSpreadingFactor(u8),
    UnsupportedBandwidth(u32),
    UnsupportedCodingRate(String),
    MalformedDatarate(String),
    /// Channel index outside the plan.
    UnknownChannel(u8),
    /// Registers may only be written in `Init` or `Scan`.
    NotQuiesced(RadioState),
    Register(RegisterError),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedFrequency(hz) => write!(f, "unsupported frequency: {} Hz", hz),
            Self::UnsupportedSpreadingFactor(sf) => {
                write!(f, "unsupported spreading factor: SF{}", sf)
            }
            Self::UnsupportedBandwidth(khz) => write!(f, "unsupported bandwidth: {} kHz", khz),
            Self::UnsupportedCodingRate(cr) => write!(f, "unsupported coding rate: {}", cr),
            Self::MalformedDatarate(d) => write!(f, "malformed data rate: {}", d),
            Self::UnknownChannel(i) => write!(f, "unknown channel index: {}", i),
            Self::NotQuiesced(state) => {
                write!(f, "radio not quiesced (state {}), cannot reconfigure", state)
            }
            Self::Register(e) => write!(f, "register error: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Register(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegisterError> for ChannelError {
    fn from(e: RegisterError) -> Self {
        Self::Register(e)
    }
}
