//! LC3 codec for LE audio
//!
//! LE audio capabilities and configurations are length-type-value records.
//! Capabilities carry bitmasks (supported sampling frequencies, frame
//! durations, channel counts, octet range); the selected configuration
//! carries single values. LC3 also derives the isochronous stream QoS
//! parameters exchanged during the `SelectProperties` negotiation.

use core::cmp::Ordering;

use super::{
    AudioParams, CodecError, CodecId, ConfigBlob, Direction, MediaCodec, MediaSettings, QosParams,
    ids,
};

/// Capability LTV type: supported sampling frequencies (u16 bitmask)
pub const LC3_TYPE_FREQUENCY: u8 = 0x01;
/// Capability LTV type: supported frame durations (u8 bitmask)
pub const LC3_TYPE_DURATION: u8 = 0x02;
/// Capability LTV type: supported channel counts (u8 bitmask)
pub const LC3_TYPE_CHANNELS: u8 = 0x03;
/// Capability LTV type: octets per codec frame (u16 min, u16 max)
pub const LC3_TYPE_FRAME_LEN: u8 = 0x04;

/// 8 kHz bit in the sampling frequency mask
pub const LC3_FREQ_8000: u16 = 1 << 0;
/// 16 kHz bit
pub const LC3_FREQ_16000: u16 = 1 << 2;
/// 24 kHz bit
pub const LC3_FREQ_24000: u16 = 1 << 4;
/// 32 kHz bit
pub const LC3_FREQ_32000: u16 = 1 << 5;
/// 48 kHz bit
pub const LC3_FREQ_48000: u16 = 1 << 7;

/// 7.5 ms frame duration bit
pub const LC3_DUR_7_5: u8 = 1 << 0;
/// 10 ms frame duration bit
pub const LC3_DUR_10: u8 = 1 << 1;

/// Octets per frame for the 48 kHz / 10 ms high-quality operating point
pub const LC3_DEFAULT_FRAME_LEN: u16 = 120;

fn ltv_find(data: &[u8], wanted: u8) -> Option<&[u8]> {
    let mut rest = data;
    while rest.len() >= 2 {
        let len = rest[0] as usize;
        if len < 1 || rest.len() < 1 + len {
            return None;
        }
        let ty = rest[1];
        let value = &rest[2..1 + len];
        if ty == wanted {
            return Some(value);
        }
        rest = &rest[1 + len..];
    }
    None
}

fn ltv_push(out: &mut ConfigBlob, ty: u8, value: &[u8]) -> Result<(), CodecError> {
    out.push(value.len() as u8 + 1)
        .map_err(|_| CodecError::BufferTooSmall)?;
    out.push(ty).map_err(|_| CodecError::BufferTooSmall)?;
    out.extend_from_slice(value)
        .map_err(|()| CodecError::BufferTooSmall)?;
    Ok(())
}

fn freq_code(bit: u16) -> u8 {
    match bit {
        LC3_FREQ_8000 => 0x01,
        LC3_FREQ_16000 => 0x03,
        LC3_FREQ_24000 => 0x05,
        LC3_FREQ_32000 => 0x06,
        _ => 0x08, // 48 kHz
    }
}

/// The LC3 codec
pub struct Lc3;

impl MediaCodec for Lc3 {
    fn id(&self) -> CodecId {
        ids::LC3
    }

    fn name(&self) -> &'static str {
        "lc3"
    }

    fn is_le_audio(&self) -> bool {
        true
    }

    fn supports_direction(&self, _direction: Direction) -> bool {
        true
    }

    fn fill_capabilities(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut out = ConfigBlob::new();
        let freqs = LC3_FREQ_8000 | LC3_FREQ_16000 | LC3_FREQ_24000 | LC3_FREQ_32000
            | LC3_FREQ_48000;
        ltv_push(&mut out, LC3_TYPE_FREQUENCY, &freqs.to_le_bytes())?;
        ltv_push(&mut out, LC3_TYPE_DURATION, &[LC3_DUR_7_5 | LC3_DUR_10])?;
        ltv_push(&mut out, LC3_TYPE_CHANNELS, &[0x03])?;
        let mut frame = [0u8; 4];
        frame[..2].copy_from_slice(&26u16.to_le_bytes());
        frame[2..].copy_from_slice(&155u16.to_le_bytes());
        ltv_push(&mut out, LC3_TYPE_FRAME_LEN, &frame)?;
        if buf.len() < out.len() {
            return Err(CodecError::BufferTooSmall);
        }
        buf[..out.len()].copy_from_slice(&out);
        Ok(out.len())
    }

    fn select_configuration(
        &self,
        caps: &[u8],
        params: &AudioParams,
        _settings: &MediaSettings,
    ) -> Result<ConfigBlob, CodecError> {
        let freq_mask = ltv_find(caps, LC3_TYPE_FREQUENCY)
            .filter(|v| v.len() >= 2)
            .map(|v| u16::from_le_bytes([v[0], v[1]]))
            .ok_or(CodecError::InvalidCapabilities)?;

        let preferred = match params.rate {
            0..=8_000 => LC3_FREQ_8000,
            8_001..=16_000 => LC3_FREQ_16000,
            16_001..=24_000 => LC3_FREQ_24000,
            24_001..=32_000 => LC3_FREQ_32000,
            _ => LC3_FREQ_48000,
        };
        let frequency = if freq_mask & preferred != 0 {
            preferred
        } else {
            [
                LC3_FREQ_48000,
                LC3_FREQ_32000,
                LC3_FREQ_24000,
                LC3_FREQ_16000,
                LC3_FREQ_8000,
            ]
            .into_iter()
            .find(|bit| freq_mask & bit != 0)
            .ok_or(CodecError::NoMatchingConfiguration)?
        };

        let durations = ltv_find(caps, LC3_TYPE_DURATION)
            .and_then(|v| v.first().copied())
            .unwrap_or(LC3_DUR_10);
        if durations & (LC3_DUR_10 | LC3_DUR_7_5) == 0 {
            return Err(CodecError::NoMatchingConfiguration);
        }
        let duration_code: u8 = if durations & LC3_DUR_10 != 0 { 0x01 } else { 0x00 };

        let channel_mask = ltv_find(caps, LC3_TYPE_CHANNELS)
            .and_then(|v| v.first().copied())
            .unwrap_or(0x01);
        let channels: u8 = if params.channels >= 2 && channel_mask & 0x02 != 0 {
            2
        } else {
            1
        };

        let frame_len = match ltv_find(caps, LC3_TYPE_FRAME_LEN) {
            Some(v) if v.len() >= 4 => {
                let min = u16::from_le_bytes([v[0], v[1]]);
                let max = u16::from_le_bytes([v[2], v[3]]);
                if min > max {
                    return Err(CodecError::InvalidCapabilities);
                }
                LC3_DEFAULT_FRAME_LEN.clamp(min, max)
            }
            _ => LC3_DEFAULT_FRAME_LEN,
        };

        let mut config = ConfigBlob::new();
        ltv_push(&mut config, LC3_TYPE_FREQUENCY, &[freq_code(frequency)])?;
        ltv_push(&mut config, LC3_TYPE_DURATION, &[duration_code])?;
        ltv_push(&mut config, LC3_TYPE_CHANNELS, &[channels])?;
        ltv_push(&mut config, LC3_TYPE_FRAME_LEN, &frame_len.to_le_bytes())?;
        Ok(config)
    }

    fn compare_capabilities(&self, a: &[u8], b: &[u8]) -> Ordering {
        fn score(caps: &[u8]) -> i32 {
            match ltv_find(caps, LC3_TYPE_FREQUENCY) {
                Some(v) if v.len() >= 2 => {
                    i32::from(u16::from_le_bytes([v[0], v[1]]).count_ones() as u16)
                }
                _ => i32::MIN,
            }
        }
        score(b).cmp(&score(a))
    }

    fn has_preference(&self) -> bool {
        true
    }

    fn validate_configuration(&self, config: &[u8]) -> bool {
        ltv_find(config, LC3_TYPE_FREQUENCY).is_some()
    }

    fn configured_channels(&self, config: &[u8]) -> u8 {
        ltv_find(config, LC3_TYPE_CHANNELS)
            .and_then(|v| v.first().copied())
            .unwrap_or(1)
    }

    fn qos(&self, config: &[u8]) -> Option<QosParams> {
        let frame_len = ltv_find(config, LC3_TYPE_FRAME_LEN)
            .filter(|v| v.len() >= 2)
            .map(|v| u16::from_le_bytes([v[0], v[1]]))?;
        let channels = self.configured_channels(config);
        let framed = ltv_find(config, LC3_TYPE_DURATION)
            .and_then(|v| v.first().copied())
            .map(|code| code == 0x00);
        Some(QosParams {
            interval_us: if framed == Some(true) { 7_500 } else { 10_000 },
            framing: framed == Some(true),
            phy_2m: true,
            sdu_size: frame_len * u16::from(channels),
            retransmissions: 5,
            latency_ms: 20,
            delay_us: 40_000,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_caps() -> ConfigBlob {
        let mut buf = [0u8; 32];
        let len = Lc3.fill_capabilities(&mut buf).unwrap();
        let mut caps = ConfigBlob::new();
        caps.extend_from_slice(&buf[..len]).unwrap();
        caps
    }

    #[test]
    fn test_ltv_round_trip() {
        let caps = full_caps();
        let freq = ltv_find(&caps, LC3_TYPE_FREQUENCY).unwrap();
        assert_eq!(freq.len(), 2);
        let mask = u16::from_le_bytes([freq[0], freq[1]]);
        assert_ne!(mask & LC3_FREQ_48000, 0);
        assert!(ltv_find(&caps, 0x7F).is_none());
    }

    #[test]
    fn test_select_prefers_48k_stereo() {
        let config = Lc3
            .select_configuration(
                &full_caps(),
                &AudioParams::default(),
                &MediaSettings::default(),
            )
            .unwrap();
        assert_eq!(ltv_find(&config, LC3_TYPE_FREQUENCY).unwrap(), &[0x08]);
        assert_eq!(ltv_find(&config, LC3_TYPE_DURATION).unwrap(), &[0x01]);
        assert_eq!(Lc3.configured_channels(&config), 2);
        let frame = ltv_find(&config, LC3_TYPE_FRAME_LEN).unwrap();
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), 120);
        assert!(Lc3.validate_configuration(&config));
    }

    #[test]
    fn test_select_clamps_frame_length() {
        let mut caps = ConfigBlob::new();
        ltv_push(&mut caps, LC3_TYPE_FREQUENCY, &LC3_FREQ_24000.to_le_bytes()).unwrap();
        let mut frame = [0u8; 4];
        frame[..2].copy_from_slice(&30u16.to_le_bytes());
        frame[2..].copy_from_slice(&60u16.to_le_bytes());
        ltv_push(&mut caps, LC3_TYPE_FRAME_LEN, &frame).unwrap();

        let config = Lc3
            .select_configuration(&caps, &AudioParams::default(), &MediaSettings::default())
            .unwrap();
        assert_eq!(ltv_find(&config, LC3_TYPE_FREQUENCY).unwrap(), &[0x05]);
        let frame = ltv_find(&config, LC3_TYPE_FRAME_LEN).unwrap();
        assert_eq!(u16::from_le_bytes([frame[0], frame[1]]), 60);
    }

    #[test]
    fn test_select_requires_frequency_record() {
        assert_eq!(
            Lc3.select_configuration(&[], &AudioParams::default(), &MediaSettings::default()),
            Err(CodecError::InvalidCapabilities)
        );
    }

    #[test]
    fn test_qos_derivation() {
        let config = Lc3
            .select_configuration(
                &full_caps(),
                &AudioParams::default(),
                &MediaSettings::default(),
            )
            .unwrap();
        let qos = Lc3.qos(&config).unwrap();
        assert_eq!(qos.interval_us, 10_000);
        assert_eq!(qos.sdu_size, 240);
        assert!(!qos.framing);
        assert!(Lc3.qos(&[]).is_none());
    }
}
