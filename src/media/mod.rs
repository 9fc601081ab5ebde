//! Media codec support for transport negotiation
//!
//! This module defines the codec collaborator interface consumed by the
//! codec-switch engine and the local negotiation endpoints, together with
//! the built-in codec implementations: SBC and AAC for A2DP and LC3 for LE
//! audio.
//!
//! A codec implementation knows how to describe the local capability blob,
//! how to pick a concrete configuration against a peer capability blob, and
//! optionally how to rank peer endpoints and derive stream QoS parameters.

pub mod aac;
pub mod lc3;
pub mod sbc;

pub use aac::Aac;
pub use lc3::Lc3;
pub use sbc::Sbc;

use core::cmp::Ordering;

use crate::ObjectPath;
use crate::constants::{DEFAULT_AUDIO_CHANNELS, DEFAULT_AUDIO_RATE, MAX_CAPS_SIZE};
use crate::profile::Profile;

/// Numeric codec identifier as advertised by remote endpoints
pub type CodecId = u8;

/// Codec identifier constants
pub mod ids {
    use super::CodecId;

    /// SBC (Sub-Band Coding), the mandatory A2DP codec
    pub const SBC: CodecId = 0x00;
    /// MPEG-2,4 AAC
    pub const AAC: CodecId = 0x02;
    /// LC3, the LE audio codec
    pub const LC3: CodecId = 0x06;
}

/// Direction of a local media endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// We render a stream the peer produces
    Sink,
    /// We produce a stream the peer renders
    Source,
}

/// Reference audio parameters used when selecting a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    /// Preferred sample rate in Hz
    pub rate: u32,
    /// Preferred channel count
    pub channels: u8,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            rate: DEFAULT_AUDIO_RATE,
            channels: DEFAULT_AUDIO_CHANNELS,
        }
    }
}

/// Global tuning knobs consulted during configuration selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaSettings {
    /// Lower clamp for the negotiated SBC bitpool
    pub sbc_min_bitpool: Option<u8>,
    /// Upper clamp for the negotiated SBC bitpool
    pub sbc_max_bitpool: Option<u8>,
}

/// Quality-of-service parameters for isochronous LE audio streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosParams {
    /// SDU interval in microseconds
    pub interval_us: u32,
    /// Whether framed PDUs are required
    pub framing: bool,
    /// Whether the 2M PHY is preferred
    pub phy_2m: bool,
    /// Maximum SDU size in bytes
    pub sdu_size: u16,
    /// Retransmission effort
    pub retransmissions: u8,
    /// Maximum transport latency in milliseconds
    pub latency_ms: u16,
    /// Presentation delay in microseconds
    pub delay_us: u32,
}

/// A selected codec configuration blob
pub type ConfigBlob = heapless::Vec<u8, MAX_CAPS_SIZE>;

/// Codec negotiation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodecError {
    /// Capability blob is malformed or too short
    InvalidCapabilities,
    /// No configuration satisfies both sides
    NoMatchingConfiguration,
    /// Output buffer cannot hold the blob
    BufferTooSmall,
}

/// Capability negotiation interface implemented by each codec
pub trait MediaCodec: Sync {
    /// Numeric codec identifier matched against remote endpoints
    fn id(&self) -> CodecId;

    /// Short lowercase codec name, also the last local endpoint path segment
    fn name(&self) -> &'static str;

    /// Whether this codec negotiates over the LE audio profiles
    fn is_le_audio(&self) -> bool {
        false
    }

    /// Whether streams of `direction` are supported
    fn supports_direction(&self, direction: Direction) -> bool;

    /// Fill `buf` with the local capability blob
    ///
    /// # Errors
    ///
    /// Returns `CodecError::BufferTooSmall` if `buf` cannot hold the blob.
    fn fill_capabilities(&self, buf: &mut [u8]) -> Result<usize, CodecError>;

    /// Select a configuration against a peer capability blob
    ///
    /// # Errors
    ///
    /// Returns an error if the capabilities are malformed or no mutually
    /// supported configuration exists; the caller treats this as a rejected
    /// candidate, not a failure.
    fn select_configuration(
        &self,
        caps: &[u8],
        params: &AudioParams,
        settings: &MediaSettings,
    ) -> Result<ConfigBlob, CodecError>;

    /// Whether [`MediaCodec::compare_capabilities`] expresses a real
    /// preference for this codec
    fn has_preference(&self) -> bool {
        false
    }

    /// Three-way preference between two peer capability blobs.
    /// `Ordering::Less` means `a` is preferred over `b`.
    fn compare_capabilities(&self, _a: &[u8], _b: &[u8]) -> Ordering {
        Ordering::Equal
    }

    /// Validate a configuration blob received from the daemon
    fn validate_configuration(&self, config: &[u8]) -> bool {
        !config.is_empty()
    }

    /// Channel count encoded in a configuration blob
    fn configured_channels(&self, _config: &[u8]) -> u8 {
        DEFAULT_AUDIO_CHANNELS
    }

    /// Stream QoS parameters for a configuration, for codecs that take part
    /// in the quality-of-service exchange
    fn qos(&self, _config: &[u8]) -> Option<QosParams> {
        None
    }
}

/// Built-in codecs in negotiation priority order
pub const ALL_CODECS: &[&'static dyn MediaCodec] = &[&Aac, &Sbc, &Lc3];

/// Look up a built-in codec by its numeric identifier
#[must_use]
pub fn codec_by_id(id: CodecId) -> Option<&'static dyn MediaCodec> {
    ALL_CODECS.iter().find(|c| c.id() == id).copied()
}

/// Look up a built-in codec by name
#[must_use]
pub fn codec_by_name(name: &str) -> Option<&'static dyn MediaCodec> {
    ALL_CODECS.iter().find(|c| c.name() == name).copied()
}

/// Local endpoint path for a codec and direction, e.g.
/// `/MediaEndpoint/A2DPSource/sbc`
#[must_use]
pub fn endpoint_path(codec: &dyn MediaCodec, direction: Direction) -> ObjectPath {
    let prefix = match (codec.is_le_audio(), direction) {
        (false, Direction::Sink) => "/MediaEndpoint/A2DPSink/",
        (false, Direction::Source) => "/MediaEndpoint/A2DPSource/",
        (true, Direction::Sink) => "/MediaEndpoint/BAPSink/",
        (true, Direction::Source) => "/MediaEndpoint/BAPSource/",
    };
    let mut s: heapless::String<{ crate::constants::MAX_PATH_LENGTH }> = heapless::String::new();
    s.push_str(prefix).ok();
    s.push_str(codec.name()).ok();
    // prefix + name always fit MAX_PATH_LENGTH
    ObjectPath::new(s.as_str()).unwrap_or_default()
}

/// Resolve a local endpoint path back to its codec and direction
#[must_use]
pub fn endpoint_info(path: &ObjectPath) -> Option<(&'static dyn MediaCodec, Direction)> {
    let rest = path.as_str().strip_prefix("/MediaEndpoint/")?;
    let (role, name) = rest.split_once('/')?;
    let direction = match role {
        "A2DPSink" | "BAPSink" => Direction::Sink,
        "A2DPSource" | "BAPSource" => Direction::Source,
        _ => return None,
    };
    codec_by_name(name).map(|codec| (codec, direction))
}

/// Device-side profile a local endpoint serves. A local source endpoint
/// produces audio for peers in the sink role and vice versa.
#[must_use]
pub fn endpoint_profile(path: &ObjectPath) -> Profile {
    let Some(rest) = path.as_str().strip_prefix("/MediaEndpoint/") else {
        return Profile::NONE;
    };
    let Some((role, _)) = rest.split_once('/') else {
        return Profile::NONE;
    };
    match role {
        "A2DPSource" => Profile::A2DP_SINK,
        "A2DPSink" => Profile::A2DP_SOURCE,
        "BAPSource" => Profile::BAP_SINK,
        "BAPSink" => Profile::BAP_SOURCE,
        _ => Profile::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_lookup() {
        assert_eq!(codec_by_id(ids::SBC).unwrap().name(), "sbc");
        assert_eq!(codec_by_id(ids::AAC).unwrap().name(), "aac");
        assert_eq!(codec_by_id(ids::LC3).unwrap().name(), "lc3");
        assert!(codec_by_id(0x7F).is_none());
        assert_eq!(codec_by_name("sbc").unwrap().id(), ids::SBC);
        assert!(codec_by_name("mystery").is_none());
    }

    #[test]
    fn test_endpoint_path_round_trip() {
        let sbc = codec_by_id(ids::SBC).unwrap();
        let path = endpoint_path(sbc, Direction::Source);
        assert_eq!(path.as_str(), "/MediaEndpoint/A2DPSource/sbc");

        let (codec, direction) = endpoint_info(&path).unwrap();
        assert_eq!(codec.id(), ids::SBC);
        assert_eq!(direction, Direction::Source);
        assert_eq!(endpoint_profile(&path), Profile::A2DP_SINK);

        let lc3 = codec_by_id(ids::LC3).unwrap();
        let path = endpoint_path(lc3, Direction::Sink);
        assert_eq!(path.as_str(), "/MediaEndpoint/BAPSink/lc3");
        assert_eq!(endpoint_profile(&path), Profile::BAP_SOURCE);
    }

    #[test]
    fn test_endpoint_info_rejects_foreign_paths() {
        let path = ObjectPath::new("/org/bluez/hci0/dev_11/sep1").unwrap();
        assert!(endpoint_info(&path).is_none());
        assert_eq!(endpoint_profile(&path), Profile::NONE);
    }
}
