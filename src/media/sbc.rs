//! SBC (Sub-Band Coding) codec
//!
//! SBC is the mandatory codec for A2DP and provides good audio quality with
//! reasonable computational requirements. The capability blob is the four
//! byte A2DP layout: sampling frequency and channel mode share the first
//! byte, block length / subbands / allocation method the second, followed by
//! the minimum and maximum bitpool.

use core::cmp::Ordering;

use super::{
    AudioParams, CodecError, CodecId, ConfigBlob, Direction, MediaCodec, MediaSettings, ids,
};

/// SBC Sampling Frequency Support (bitfield, upper nibble of byte 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcSamplingFrequency(pub u8);

impl SbcSamplingFrequency {
    /// 16000 Hz
    pub const HZ_16000: u8 = 0x08;
    /// 32000 Hz
    pub const HZ_32000: u8 = 0x04;
    /// 44100 Hz
    pub const HZ_44100: u8 = 0x02;
    /// 48000 Hz
    pub const HZ_48000: u8 = 0x01;

    /// Create with all frequencies supported
    #[must_use]
    pub const fn all() -> Self {
        Self(Self::HZ_16000 | Self::HZ_32000 | Self::HZ_44100 | Self::HZ_48000)
    }

    /// Check if frequency bit is supported
    #[must_use]
    pub const fn supports(&self, freq: u8) -> bool {
        (self.0 & freq) != 0
    }

    /// Frequency bit for a sample rate in Hz
    #[must_use]
    pub const fn bit_for_rate(rate: u32) -> Option<u8> {
        match rate {
            16_000 => Some(Self::HZ_16000),
            32_000 => Some(Self::HZ_32000),
            44_100 => Some(Self::HZ_44100),
            48_000 => Some(Self::HZ_48000),
            _ => None,
        }
    }
}

/// SBC Channel Mode Support (bitfield, lower nibble of byte 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcChannelMode(pub u8);

impl SbcChannelMode {
    /// Mono
    pub const MONO: u8 = 0x08;
    /// Dual Channel
    pub const DUAL_CHANNEL: u8 = 0x04;
    /// Stereo
    pub const STEREO: u8 = 0x02;
    /// Joint Stereo
    pub const JOINT_STEREO: u8 = 0x01;

    /// Create with all channel modes supported
    #[must_use]
    pub const fn all() -> Self {
        Self(Self::MONO | Self::DUAL_CHANNEL | Self::STEREO | Self::JOINT_STEREO)
    }

    /// Check if mode bit is supported
    #[must_use]
    pub const fn supports(&self, mode: u8) -> bool {
        (self.0 & mode) != 0
    }
}

/// SBC Block Length Support (bitfield, upper nibble of byte 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcBlockLength(pub u8);

impl SbcBlockLength {
    /// 4 blocks
    pub const BLOCKS_4: u8 = 0x08;
    /// 8 blocks
    pub const BLOCKS_8: u8 = 0x04;
    /// 12 blocks
    pub const BLOCKS_12: u8 = 0x02;
    /// 16 blocks
    pub const BLOCKS_16: u8 = 0x01;

    /// Create with all block lengths supported
    #[must_use]
    pub const fn all() -> Self {
        Self(Self::BLOCKS_4 | Self::BLOCKS_8 | Self::BLOCKS_12 | Self::BLOCKS_16)
    }
}

/// SBC Subband Support (bitfield, bits 2-3 of byte 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcSubbands(pub u8);

impl SbcSubbands {
    /// 4 subbands
    pub const SUBBANDS_4: u8 = 0x02;
    /// 8 subbands
    pub const SUBBANDS_8: u8 = 0x01;

    /// Create with both subband counts supported
    #[must_use]
    pub const fn all() -> Self {
        Self(Self::SUBBANDS_4 | Self::SUBBANDS_8)
    }
}

/// SBC Allocation Method Support (bitfield, bits 0-1 of byte 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcAllocationMethod(pub u8);

impl SbcAllocationMethod {
    /// SNR allocation
    pub const SNR: u8 = 0x02;
    /// Loudness allocation
    pub const LOUDNESS: u8 = 0x01;

    /// Create with both allocation methods supported
    #[must_use]
    pub const fn all() -> Self {
        Self(Self::SNR | Self::LOUDNESS)
    }
}

/// Minimum bitpool value allowed by the SBC specification
pub const SBC_MIN_BITPOOL: u8 = 2;

/// Default upper bitpool bound, the high-quality joint-stereo operating point
pub const SBC_MAX_BITPOOL: u8 = 53;

/// Largest bitpool advertised in the local capabilities
pub const SBC_CAPS_MAX_BITPOOL: u8 = 64;

const SBC_CAPS_LEN: usize = 4;

/// The SBC codec
pub struct Sbc;

impl Sbc {
    fn frequency_bit(caps: SbcSamplingFrequency, rate: u32) -> Option<u8> {
        if let Some(bit) = SbcSamplingFrequency::bit_for_rate(rate) {
            if caps.supports(bit) {
                return Some(bit);
            }
        }
        // fall back to the highest supported rate
        [
            SbcSamplingFrequency::HZ_48000,
            SbcSamplingFrequency::HZ_44100,
            SbcSamplingFrequency::HZ_32000,
            SbcSamplingFrequency::HZ_16000,
        ]
        .into_iter()
        .find(|bit| caps.supports(*bit))
    }

    fn channel_mode_bit(caps: SbcChannelMode, channels: u8) -> Option<u8> {
        let order: &[u8] = if channels <= 1 {
            &[
                SbcChannelMode::MONO,
                SbcChannelMode::JOINT_STEREO,
                SbcChannelMode::STEREO,
                SbcChannelMode::DUAL_CHANNEL,
            ]
        } else {
            &[
                SbcChannelMode::JOINT_STEREO,
                SbcChannelMode::STEREO,
                SbcChannelMode::DUAL_CHANNEL,
                SbcChannelMode::MONO,
            ]
        };
        order.iter().copied().find(|bit| caps.supports(*bit))
    }
}

impl MediaCodec for Sbc {
    fn id(&self) -> CodecId {
        ids::SBC
    }

    fn name(&self) -> &'static str {
        "sbc"
    }

    fn supports_direction(&self, _direction: Direction) -> bool {
        true
    }

    fn fill_capabilities(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        if buf.len() < SBC_CAPS_LEN {
            return Err(CodecError::BufferTooSmall);
        }
        buf[0] = (SbcSamplingFrequency::all().0 << 4) | SbcChannelMode::all().0;
        buf[1] = (SbcBlockLength::all().0 << 4)
            | (SbcSubbands::all().0 << 2)
            | SbcAllocationMethod::all().0;
        buf[2] = SBC_MIN_BITPOOL;
        buf[3] = SBC_CAPS_MAX_BITPOOL;
        Ok(SBC_CAPS_LEN)
    }

    fn select_configuration(
        &self,
        caps: &[u8],
        params: &AudioParams,
        settings: &MediaSettings,
    ) -> Result<ConfigBlob, CodecError> {
        if caps.len() < SBC_CAPS_LEN {
            return Err(CodecError::InvalidCapabilities);
        }
        let frequencies = SbcSamplingFrequency(caps[0] >> 4);
        let modes = SbcChannelMode(caps[0] & 0x0F);
        let blocks = SbcBlockLength(caps[1] >> 4);
        let subbands = SbcSubbands((caps[1] >> 2) & 0x03);
        let allocation = SbcAllocationMethod(caps[1] & 0x03);

        let frequency = Self::frequency_bit(frequencies, params.rate)
            .ok_or(CodecError::NoMatchingConfiguration)?;
        let mode = Self::channel_mode_bit(modes, params.channels)
            .ok_or(CodecError::NoMatchingConfiguration)?;

        let block = [
            SbcBlockLength::BLOCKS_16,
            SbcBlockLength::BLOCKS_12,
            SbcBlockLength::BLOCKS_8,
            SbcBlockLength::BLOCKS_4,
        ]
        .into_iter()
        .find(|bit| (blocks.0 & bit) != 0)
        .ok_or(CodecError::NoMatchingConfiguration)?;

        let subband = [SbcSubbands::SUBBANDS_8, SbcSubbands::SUBBANDS_4]
            .into_iter()
            .find(|bit| (subbands.0 & bit) != 0)
            .ok_or(CodecError::NoMatchingConfiguration)?;

        let alloc = [SbcAllocationMethod::LOUDNESS, SbcAllocationMethod::SNR]
            .into_iter()
            .find(|bit| (allocation.0 & bit) != 0)
            .ok_or(CodecError::NoMatchingConfiguration)?;

        let min_bitpool = caps[2]
            .max(SBC_MIN_BITPOOL)
            .max(settings.sbc_min_bitpool.unwrap_or(SBC_MIN_BITPOOL));
        let max_bitpool = caps[3]
            .min(settings.sbc_max_bitpool.unwrap_or(SBC_MAX_BITPOOL));
        if min_bitpool > max_bitpool {
            return Err(CodecError::NoMatchingConfiguration);
        }

        let mut config = ConfigBlob::new();
        config
            .extend_from_slice(&[
                (frequency << 4) | mode,
                (block << 4) | (subband << 2) | alloc,
                min_bitpool,
                max_bitpool,
            ])
            .map_err(|()| CodecError::BufferTooSmall)?;
        Ok(config)
    }

    fn has_preference(&self) -> bool {
        true
    }

    fn compare_capabilities(&self, a: &[u8], b: &[u8]) -> Ordering {
        // Higher score wins: peers offering the standard high-quality rates
        // and a larger bitpool ceiling are preferred.
        fn score(caps: &[u8]) -> i32 {
            if caps.len() < SBC_CAPS_LEN {
                return i32::MIN;
            }
            let frequencies = SbcSamplingFrequency(caps[0] >> 4);
            let mut value = i32::from(caps[3]);
            if frequencies.supports(SbcSamplingFrequency::HZ_48000)
                || frequencies.supports(SbcSamplingFrequency::HZ_44100)
            {
                value += 256;
            }
            value
        }
        score(b).cmp(&score(a))
    }

    fn validate_configuration(&self, config: &[u8]) -> bool {
        if config.len() != SBC_CAPS_LEN {
            return false;
        }
        let frequency = config[0] >> 4;
        let mode = config[0] & 0x0F;
        // exactly one frequency and one channel mode bit
        frequency.count_ones() == 1
            && mode.count_ones() == 1
            && config[2] >= SBC_MIN_BITPOOL
            && config[2] <= config[3]
    }

    fn configured_channels(&self, config: &[u8]) -> u8 {
        match config.first() {
            Some(byte) if byte & 0x0F == SbcChannelMode::MONO => 1,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_caps() -> [u8; 4] {
        let mut buf = [0u8; 4];
        Sbc.fill_capabilities(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_select_prefers_requested_rate() {
        let params = AudioParams {
            rate: 44_100,
            channels: 2,
        };
        let config = Sbc
            .select_configuration(&full_caps(), &params, &MediaSettings::default())
            .unwrap();
        assert_eq!(config[0] >> 4, SbcSamplingFrequency::HZ_44100);
        assert_eq!(config[0] & 0x0F, SbcChannelMode::JOINT_STEREO);
        assert_eq!(config[1] >> 4, SbcBlockLength::BLOCKS_16);
        assert!(Sbc.validate_configuration(&config));
    }

    #[test]
    fn test_select_falls_back_to_supported_rate() {
        // peer supports only 32 kHz, stereo, 8 blocks, 4 subbands, SNR
        let caps = [
            (SbcSamplingFrequency::HZ_32000 << 4) | SbcChannelMode::STEREO,
            (SbcBlockLength::BLOCKS_8 << 4)
                | (SbcSubbands::SUBBANDS_4 << 2)
                | SbcAllocationMethod::SNR,
            10,
            40,
        ];
        let config = Sbc
            .select_configuration(&caps, &AudioParams::default(), &MediaSettings::default())
            .unwrap();
        assert_eq!(config[0] >> 4, SbcSamplingFrequency::HZ_32000);
        assert_eq!(config[0] & 0x0F, SbcChannelMode::STEREO);
        assert_eq!(config[1] & 0x03, SbcAllocationMethod::SNR);
        assert_eq!(config[2], 10);
        assert_eq!(config[3], 40);
    }

    #[test]
    fn test_select_clamps_bitpool() {
        let config = Sbc
            .select_configuration(
                &full_caps(),
                &AudioParams::default(),
                &MediaSettings::default(),
            )
            .unwrap();
        assert_eq!(config[2], SBC_MIN_BITPOOL);
        assert_eq!(config[3], SBC_MAX_BITPOOL);

        let settings = MediaSettings {
            sbc_min_bitpool: Some(20),
            sbc_max_bitpool: Some(35),
        };
        let config = Sbc
            .select_configuration(&full_caps(), &AudioParams::default(), &settings)
            .unwrap();
        assert_eq!(config[2], 20);
        assert_eq!(config[3], 35);
    }

    #[test]
    fn test_select_rejects_bad_caps() {
        assert_eq!(
            Sbc.select_configuration(
                &[0x00, 0x00],
                &AudioParams::default(),
                &MediaSettings::default()
            ),
            Err(CodecError::InvalidCapabilities)
        );
        // min bitpool above our ceiling
        let caps = [
            (SbcSamplingFrequency::HZ_48000 << 4) | SbcChannelMode::JOINT_STEREO,
            (SbcBlockLength::BLOCKS_16 << 4)
                | (SbcSubbands::SUBBANDS_8 << 2)
                | SbcAllocationMethod::LOUDNESS,
            60,
            64,
        ];
        assert_eq!(
            Sbc.select_configuration(&caps, &AudioParams::default(), &MediaSettings::default()),
            Err(CodecError::NoMatchingConfiguration)
        );
    }

    #[test]
    fn test_mono_channel_selection() {
        let params = AudioParams {
            rate: 48_000,
            channels: 1,
        };
        let config = Sbc
            .select_configuration(&full_caps(), &params, &MediaSettings::default())
            .unwrap();
        assert_eq!(config[0] & 0x0F, SbcChannelMode::MONO);
        assert_eq!(Sbc.configured_channels(&config), 1);
    }

    #[test]
    fn test_capability_preference_ordering() {
        let rich = full_caps();
        // low-rate peer with a small bitpool ceiling
        let poor = [
            (SbcSamplingFrequency::HZ_16000 << 4) | SbcChannelMode::MONO,
            (SbcBlockLength::BLOCKS_4 << 4)
                | (SbcSubbands::SUBBANDS_4 << 2)
                | SbcAllocationMethod::SNR,
            2,
            18,
        ];
        assert!(Sbc.has_preference());
        assert_eq!(Sbc.compare_capabilities(&rich, &poor), Ordering::Less);
        assert_eq!(Sbc.compare_capabilities(&poor, &rich), Ordering::Greater);
        // malformed capabilities sort last
        assert_eq!(Sbc.compare_capabilities(&rich, &[0x01]), Ordering::Less);
    }

    #[test]
    fn test_validate_configuration() {
        assert!(!Sbc.validate_configuration(&[]));
        // two frequency bits set
        assert!(!Sbc.validate_configuration(&[0x31, 0x15, 2, 53]));
        assert!(Sbc.validate_configuration(&[0x11, 0x15, 2, 53]));
    }
}
