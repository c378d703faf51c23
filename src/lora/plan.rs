//! Regional frequency plans.
//!
//! A single-channel gateway listens on one channel of its region's plan (or
//! hops over the first [`NUM_HOPS`] channels). The default plan is selected
//! at build time with a `region-*` feature; the plan in use is ordinary
//! run-time configuration so the state machine stays identical for every
//! region.

#[cfg(any(
    all(feature = "region-eu868", feature = "region-eu433"),
    all(feature = "region-eu868", feature = "region-au915"),
    all(feature = "region-eu868", feature = "region-us915"),
    all(feature = "region-eu433", feature = "region-au915"),
    all(feature = "region-eu433", feature = "region-us915"),
    all(feature = "region-au915", feature = "region-us915"),
))]
compile_error!("select exactly one region-* feature");

/// Number of plan channels visited when frequency hopping is enabled.
///
/// Three is the minimum channel set a LoRaWAN gateway must support.
pub const NUM_HOPS: usize = 3;

const EU868_CHANNELS: &[u32] = &[
    868_100_000,
    868_300_000,
    868_500_000,
    867_100_000,
    867_300_000,
    867_500_000,
    867_700_000,
    867_900_000,
    868_800_000,
    // RX2 responses, SF9
    869_525_000,
];

const EU433_CHANNELS: &[u32] = &[
    433_175_000,
    433_375_000,
    433_575_000,
    433_775_000,
    433_975_000,
    434_175_000,
    434_375_000,
    434_575_000,
    434_775_000,
];

const AU915_CHANNELS: &[u32] = &[
    916_800_000,
    917_000_000,
    917_200_000,
    917_400_000,
    917_600_000,
    917_800_000,
    918_000_000,
    918_200_000,
    // SF8BW500
    917_500_000,
];

const US915_CHANNELS: &[u32] = &[
    903_900_000,
    904_100_000,
    904_300_000,
    904_500_000,
    904_700_000,
    904_900_000,
    905_100_000,
    905_300_000,
    // SF8BW500
    904_600_000,
];

/// Frequency plan of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyPlan {
    /// EU 863-870 MHz.
    Eu868,
    /// EU 433 MHz.
    Eu433,
    /// Australia 915-928 MHz (uplink sub-band 1).
    Au915,
    /// US 902-928 MHz (uplink sub-band 1).
    Us915,
}

impl FrequencyPlan {
    /// Uplink channel frequencies in Hz, channel 0 first.
    pub fn channels(self) -> &'static [u32] {
        match self {
            Self::Eu868 => EU868_CHANNELS,
            Self::Eu433 => EU433_CHANNELS,
            Self::Au915 => AU915_CHANNELS,
            Self::Us915 => US915_CHANNELS,
        }
    }

    /// Frequency of channel `index`.
    pub fn frequency(self, index: u8) -> Option<u32> {
        self.channels().get(index as usize).copied()
    }

    /// Channel index of `frequency_hz`, if it is part of the plan.
    pub fn channel_index(self, frequency_hz: u32) -> Option<u8> {
        self.channels()
            .iter()
            .position(|&f| f == frequency_hz)
            .map(|i| i as u8)
    }

    pub fn contains(self, frequency_hz: u32) -> bool {
        self.channel_index(frequency_hz).is_some()
    }

    /// Channels visited while hopping.
    pub fn hop_channels(self) -> &'static [u32] {
        let channels = self.channels();
        &channels[..NUM_HOPS.min(channels.len())]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Eu868 => "EU868",
            Self::Eu433 => "EU433",
            Self::Au915 => "AU915",
            Self::Us915 => "US915",
        }
    }
}

impl Default for FrequencyPlan {
    fn default() -> Self {
        #[cfg(feature = "region-eu433")]
        return Self::Eu433;
        #[cfg(feature = "region-au915")]
        return Self::Au915;
        #[cfg(feature = "region-us915")]
        return Self::Us915;
        #[cfg(not(any(
            feature = "region-eu433",
            feature = "region-au915",
            feature = "region-us915"
        )))]
        Self::Eu868
    }
}
