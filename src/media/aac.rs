//! MPEG-2,4 AAC codec
//!
//! Six byte A2DP capability layout: object types, a twelve bit sampling
//! frequency mask split over bytes 1 and 2, channel bits, then the VBR flag
//! and a 23 bit peak bitrate.

use core::cmp::Ordering;

use super::{
    AudioParams, CodecError, CodecId, ConfigBlob, Direction, MediaCodec, MediaSettings, ids,
};

/// MPEG-2 AAC LC object type
pub const AAC_OBJECT_MPEG2_LC: u8 = 0x80;
/// MPEG-4 AAC LC object type
pub const AAC_OBJECT_MPEG4_LC: u8 = 0x40;

/// 44100 Hz bit in capability byte 1
pub const AAC_SAMPLING_44100: u8 = 0x01;
/// 48000 Hz bit in capability byte 2 (upper nibble)
pub const AAC_SAMPLING_48000: u8 = 0x80;

/// One channel bit in capability byte 2
pub const AAC_CHANNELS_1: u8 = 0x08;
/// Two channel bit in capability byte 2
pub const AAC_CHANNELS_2: u8 = 0x04;

/// VBR flag in capability byte 3
pub const AAC_VBR: u8 = 0x80;

/// Peak bitrate advertised and negotiated by default, in bit/s
pub const AAC_DEFAULT_BITRATE: u32 = 320_000;

const AAC_CAPS_LEN: usize = 6;

fn bitrate_of(caps: &[u8]) -> u32 {
    (u32::from(caps[3] & 0x7F) << 16) | (u32::from(caps[4]) << 8) | u32::from(caps[5])
}

/// The MPEG-2,4 AAC codec
pub struct Aac;

impl MediaCodec for Aac {
    fn id(&self) -> CodecId {
        ids::AAC
    }

    fn name(&self) -> &'static str {
        "aac"
    }

    fn supports_direction(&self, _direction: Direction) -> bool {
        true
    }

    fn fill_capabilities(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        if buf.len() < AAC_CAPS_LEN {
            return Err(CodecError::BufferTooSmall);
        }
        buf[0] = AAC_OBJECT_MPEG2_LC | AAC_OBJECT_MPEG4_LC;
        buf[1] = AAC_SAMPLING_44100;
        buf[2] = AAC_SAMPLING_48000 | AAC_CHANNELS_1 | AAC_CHANNELS_2;
        buf[3] = AAC_VBR | ((AAC_DEFAULT_BITRATE >> 16) as u8 & 0x7F);
        buf[4] = (AAC_DEFAULT_BITRATE >> 8) as u8;
        buf[5] = AAC_DEFAULT_BITRATE as u8;
        Ok(AAC_CAPS_LEN)
    }

    fn select_configuration(
        &self,
        caps: &[u8],
        params: &AudioParams,
        _settings: &MediaSettings,
    ) -> Result<ConfigBlob, CodecError> {
        if caps.len() < AAC_CAPS_LEN {
            return Err(CodecError::InvalidCapabilities);
        }

        let object = if caps[0] & AAC_OBJECT_MPEG4_LC != 0 {
            AAC_OBJECT_MPEG4_LC
        } else if caps[0] & AAC_OBJECT_MPEG2_LC != 0 {
            AAC_OBJECT_MPEG2_LC
        } else {
            return Err(CodecError::NoMatchingConfiguration);
        };

        let supports_48k = caps[2] & AAC_SAMPLING_48000 != 0;
        let supports_44k1 = caps[1] & AAC_SAMPLING_44100 != 0;
        let (rate_byte1, rate_byte2) = match (params.rate, supports_48k, supports_44k1) {
            (44_100, _, true) => (AAC_SAMPLING_44100, 0),
            (_, true, _) => (0, AAC_SAMPLING_48000),
            (_, false, true) => (AAC_SAMPLING_44100, 0),
            _ => return Err(CodecError::NoMatchingConfiguration),
        };

        let channels = if params.channels >= 2 && caps[2] & AAC_CHANNELS_2 != 0 {
            AAC_CHANNELS_2
        } else if caps[2] & AAC_CHANNELS_1 != 0 {
            AAC_CHANNELS_1
        } else if caps[2] & AAC_CHANNELS_2 != 0 {
            AAC_CHANNELS_2
        } else {
            return Err(CodecError::NoMatchingConfiguration);
        };

        let peer_bitrate = bitrate_of(caps);
        let bitrate = if peer_bitrate == 0 {
            AAC_DEFAULT_BITRATE
        } else {
            peer_bitrate.min(AAC_DEFAULT_BITRATE)
        };
        let vbr = caps[3] & AAC_VBR;

        let mut config = ConfigBlob::new();
        config
            .extend_from_slice(&[
                object,
                rate_byte1,
                rate_byte2 | channels,
                vbr | ((bitrate >> 16) as u8 & 0x7F),
                (bitrate >> 8) as u8,
                bitrate as u8,
            ])
            .map_err(|()| CodecError::BufferTooSmall)?;
        Ok(config)
    }

    fn has_preference(&self) -> bool {
        true
    }

    fn compare_capabilities(&self, a: &[u8], b: &[u8]) -> Ordering {
        // Peers allowing a higher peak bitrate are preferred.
        fn score(caps: &[u8]) -> i64 {
            if caps.len() < AAC_CAPS_LEN {
                return i64::MIN;
            }
            let mut value = i64::from(bitrate_of(caps));
            if value == 0 {
                value = i64::from(AAC_DEFAULT_BITRATE);
            }
            value
        }
        score(b).cmp(&score(a))
    }

    fn validate_configuration(&self, config: &[u8]) -> bool {
        config.len() == AAC_CAPS_LEN
            && config[0].count_ones() == 1
            && (config[2] & (AAC_CHANNELS_1 | AAC_CHANNELS_2)).count_ones() == 1
    }

    fn configured_channels(&self, config: &[u8]) -> u8 {
        match config.get(2) {
            Some(byte) if byte & AAC_CHANNELS_1 != 0 => 1,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_caps() -> [u8; 6] {
        let mut buf = [0u8; 6];
        Aac.fill_capabilities(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_select_picks_48k_stereo() {
        let config = Aac
            .select_configuration(
                &full_caps(),
                &AudioParams::default(),
                &MediaSettings::default(),
            )
            .unwrap();
        assert_eq!(config[0], AAC_OBJECT_MPEG4_LC);
        assert_eq!(config[1], 0);
        assert_eq!(config[2] & 0xF0, AAC_SAMPLING_48000);
        assert_eq!(config[2] & 0x0C, AAC_CHANNELS_2);
        assert_eq!(bitrate_of(&config), AAC_DEFAULT_BITRATE);
        assert!(Aac.validate_configuration(&config));
        assert_eq!(Aac.configured_channels(&config), 2);
    }

    #[test]
    fn test_select_honors_requested_rate() {
        let params = AudioParams {
            rate: 44_100,
            channels: 2,
        };
        let config = Aac
            .select_configuration(&full_caps(), &params, &MediaSettings::default())
            .unwrap();
        assert_eq!(config[1], AAC_SAMPLING_44100);
        assert_eq!(config[2] & 0xF0, 0);
    }

    #[test]
    fn test_select_limits_bitrate_to_peer() {
        let mut caps = full_caps();
        caps[3] = 0x02; // 128 kbit/s, no VBR
        caps[4] = 0x00;
        caps[5] = 0x00;
        let config = Aac
            .select_configuration(&caps, &AudioParams::default(), &MediaSettings::default())
            .unwrap();
        assert_eq!(bitrate_of(&config), 128 * 1024);
        assert_eq!(config[3] & AAC_VBR, 0);
    }

    #[test]
    fn test_select_requires_lc_object() {
        let mut caps = full_caps();
        caps[0] = 0x20; // MPEG-4 LTP only
        assert_eq!(
            Aac.select_configuration(&caps, &AudioParams::default(), &MediaSettings::default()),
            Err(CodecError::NoMatchingConfiguration)
        );
    }

    #[test]
    fn test_capability_preference_by_bitrate() {
        let rich = full_caps();
        let mut poor = full_caps();
        poor[3] = 0x00;
        poor[4] = 0x40;
        poor[5] = 0x00;
        assert_eq!(Aac.compare_capabilities(&rich, &poor), Ordering::Less);
        assert_eq!(Aac.compare_capabilities(&[], &rich), Ordering::Greater);
    }
}
