//! `Warbler` Constants
//!
//! This module contains all the constants used throughout the `Warbler`
//! library. These constants define capacity limits for the bounded object
//! registry, sizes of daemon-assigned identifiers, and the timing parameters
//! of the reconnect, codec-switch and transport-release state machines.

use embassy_time::Duration;

/// Depth of the request/response/event channels
pub const MAX_CHANNELS: usize = 8;

/// Depth of the notification channel towards the media graph
pub const MAX_NOTIFICATIONS: usize = 16;

/// Maximum number of local Bluetooth adapters (power of two)
pub const MAX_ADAPTERS: usize = 4;

/// Maximum number of tracked remote devices (power of two)
pub const MAX_DEVICES: usize = 16;

/// Maximum number of remote codec endpoints across all devices (power of two)
pub const MAX_ENDPOINTS: usize = 32;

/// Maximum number of media transports across all devices (power of two)
pub const MAX_TRANSPORTS: usize = 16;

/// Maximum remote endpoints referenced by a single device
pub const MAX_DEVICE_ENDPOINTS: usize = 16;

/// Maximum transports referenced by a single device
pub const MAX_DEVICE_TRANSPORTS: usize = 8;

/// Maximum transports sharing one multi-stream group resource
pub const MAX_LINKED_TRANSPORTS: usize = 8;

/// Maximum codecs considered in one negotiation session
pub const MAX_CODECS: usize = 8;

/// Codec-switch sessions kept per device: the authoritative one plus a
/// superseded one still waiting for its in-flight reply
pub const MAX_CODEC_SWITCHES: usize = 2;

/// Maximum length of a daemon-assigned object path in bytes
pub const MAX_PATH_LENGTH: usize = 64;

/// Maximum device name/alias length in bytes
pub const MAX_NAME_LENGTH: usize = 32;

/// Length of a profile UUID string
pub const MAX_UUID_LENGTH: usize = 36;

/// Maximum size of a codec capability or configuration blob in bytes
pub const MAX_CAPS_SIZE: usize = 32;

/// Maximum service UUIDs advertised by one device
pub const MAX_DEVICE_UUIDS: usize = 16;

/// Maximum objects in one bulk enumeration reply
pub const MAX_OBJECT_RECORDS: usize = 64;

/// Maximum interfaces carried by one object record
pub const MAX_OBJECT_INTERFACES: usize = 4;

/// Maximum properties in one property bundle
pub const MAX_BUNDLE_PROPS: usize = 16;

/// Minimum spacing between negotiation-affecting calls to the daemon.
/// Issuing configuration calls faster than this is known to destabilize the
/// daemon's internal profile state.
pub const DAEMON_ACTION_RATE: Duration = Duration::from_millis(3000);

/// Retries per codec/endpoint candidate before advancing to the next one
pub const CODEC_SWITCH_RETRIES: u8 = 1;

/// Reconnect window while initial profiles are still being negotiated
pub const DEVICE_RECONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Window to tolerate slow secondary-profile connects once at least one
/// profile is live, without flapping the aggregate connection state
pub const DEVICE_PROFILE_TIMEOUT: Duration = Duration::from_secs(6);

/// Grace period an SCO stream resource is held open after its last release
pub const SCO_RELEASE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default sample rate used as reference for codec configuration selection
pub const DEFAULT_AUDIO_RATE: u32 = 48_000;

/// Default channel count used as reference for codec configuration selection
pub const DEFAULT_AUDIO_CHANNELS: u8 = 2;

/// Hardware volume range maximum used by audio/video remote profiles
pub const HW_VOLUME_MAX: u16 = 127;
