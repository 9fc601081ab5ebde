//! Bluetooth audio profile bitmask and UUID mapping
//!
//! A `Profile` value is a bitmask over the audio-related service roles a
//! peer can expose. Devices track two masks: the profiles the peer
//! advertises (from its UUID list) and the profiles currently live. The
//! composite masks group profiles by stream direction for the aggregate
//! connection policy.

use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, Not};

use crate::constants::MAX_UUID_LENGTH;

/// A profile UUID string as reported by the daemon
pub type Uuid = heapless::String<MAX_UUID_LENGTH>;

/// Service UUID constants for the supported audio profiles
pub mod uuid {
    /// A2DP audio source
    pub const A2DP_SOURCE: &str = "0000110a-0000-1000-8000-00805f9b34fb";
    /// A2DP audio sink
    pub const A2DP_SINK: &str = "0000110b-0000-1000-8000-00805f9b34fb";
    /// HSP headset
    pub const HSP_HS: &str = "00001108-0000-1000-8000-00805f9b34fb";
    /// HSP headset (alternative registration)
    pub const HSP_HS_ALT: &str = "00001131-0000-1000-8000-00805f9b34fb";
    /// HSP audio gateway
    pub const HSP_AG: &str = "00001112-0000-1000-8000-00805f9b34fb";
    /// HFP hands-free unit
    pub const HFP_HF: &str = "0000111e-0000-1000-8000-00805f9b34fb";
    /// HFP audio gateway
    pub const HFP_AG: &str = "0000111f-0000-1000-8000-00805f9b34fb";
    /// LE audio sink endpoint (Sink PAC)
    pub const BAP_SINK: &str = "00002bc9-0000-1000-8000-00805f9b34fb";
    /// LE audio source endpoint (Source PAC)
    pub const BAP_SOURCE: &str = "00002bcb-0000-1000-8000-00805f9b34fb";
}

/// Bitmask of Bluetooth audio profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Profile(pub u32);

impl Profile {
    /// Empty mask
    pub const NONE: Profile = Profile(0);
    /// A2DP source role on the peer
    pub const A2DP_SOURCE: Profile = Profile(1 << 0);
    /// A2DP sink role on the peer
    pub const A2DP_SINK: Profile = Profile(1 << 1);
    /// HSP headset role on the peer
    pub const HSP_HS: Profile = Profile(1 << 2);
    /// HSP audio gateway role on the peer
    pub const HSP_AG: Profile = Profile(1 << 3);
    /// HFP hands-free role on the peer
    pub const HFP_HF: Profile = Profile(1 << 4);
    /// HFP audio gateway role on the peer
    pub const HFP_AG: Profile = Profile(1 << 5);
    /// LE audio source role on the peer
    pub const BAP_SOURCE: Profile = Profile(1 << 6);
    /// LE audio sink role on the peer
    pub const BAP_SINK: Profile = Profile(1 << 7);

    /// Headset head-unit role: either HSP or HFP satisfies it
    pub const HEADSET_HEAD_UNIT: Profile = Profile(Self::HSP_HS.0 | Self::HFP_HF.0);
    /// Headset audio-gateway role: either HSP or HFP satisfies it
    pub const HEADSET_AUDIO_GATEWAY: Profile = Profile(Self::HSP_AG.0 | Self::HFP_AG.0);
    /// Peer renders audio we send
    pub const MEDIA_SINK: Profile = Profile(Self::A2DP_SINK.0 | Self::BAP_SINK.0);
    /// Peer produces audio we consume
    pub const MEDIA_SOURCE: Profile = Profile(Self::A2DP_SOURCE.0 | Self::BAP_SOURCE.0);
    /// Every supported profile
    pub const ALL: Profile = Profile(
        Self::MEDIA_SINK.0
            | Self::MEDIA_SOURCE.0
            | Self::HEADSET_HEAD_UNIT.0
            | Self::HEADSET_AUDIO_GATEWAY.0,
    );

    /// Whether every bit of `other` is set in `self`
    #[must_use]
    pub const fn contains(self, other: Profile) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Whether any bit of `other` is set in `self`
    #[must_use]
    pub const fn intersects(self, other: Profile) -> bool {
        (self.0 & other.0) != 0
    }

    /// Whether no bit is set
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Mask with the bits of `other` removed
    #[must_use]
    pub const fn without(self, other: Profile) -> Profile {
        Profile(self.0 & !other.0)
    }

    /// Map a profile UUID string to its profile bit
    ///
    /// Unknown UUIDs map to `Profile::NONE`; the daemon advertises many
    /// services this crate does not care about.
    #[must_use]
    pub fn from_uuid(value: &str) -> Profile {
        match value {
            uuid::A2DP_SOURCE => Profile::A2DP_SOURCE,
            uuid::A2DP_SINK => Profile::A2DP_SINK,
            uuid::HSP_HS | uuid::HSP_HS_ALT => Profile::HSP_HS,
            uuid::HSP_AG => Profile::HSP_AG,
            uuid::HFP_HF => Profile::HFP_HF,
            uuid::HFP_AG => Profile::HFP_AG,
            uuid::BAP_SINK => Profile::BAP_SINK,
            uuid::BAP_SOURCE => Profile::BAP_SOURCE,
            _ => Profile::NONE,
        }
    }

    /// The UUID used to request a connection of this profile (single bit)
    #[must_use]
    pub fn to_uuid(self) -> Option<&'static str> {
        match self {
            Profile::A2DP_SOURCE => Some(uuid::A2DP_SOURCE),
            Profile::A2DP_SINK => Some(uuid::A2DP_SINK),
            Profile::HSP_HS => Some(uuid::HSP_HS),
            Profile::HSP_AG => Some(uuid::HSP_AG),
            Profile::HFP_HF => Some(uuid::HFP_HF),
            Profile::HFP_AG => Some(uuid::HFP_AG),
            Profile::BAP_SINK => Some(uuid::BAP_SINK),
            Profile::BAP_SOURCE => Some(uuid::BAP_SOURCE),
            _ => None,
        }
    }
}

impl BitOr for Profile {
    type Output = Profile;

    fn bitor(self, rhs: Profile) -> Profile {
        Profile(self.0 | rhs.0)
    }
}

impl BitOrAssign for Profile {
    fn bitor_assign(&mut self, rhs: Profile) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Profile {
    type Output = Profile;

    fn bitand(self, rhs: Profile) -> Profile {
        Profile(self.0 & rhs.0)
    }
}

impl BitAndAssign for Profile {
    fn bitand_assign(&mut self, rhs: Profile) {
        self.0 &= rhs.0;
    }
}

impl BitXor for Profile {
    type Output = Profile;

    fn bitxor(self, rhs: Profile) -> Profile {
        Profile(self.0 ^ rhs.0)
    }
}

impl Not for Profile {
    type Output = Profile;

    fn not(self) -> Profile {
        Profile(!self.0)
    }
}
