#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(dead_code, clippy::unused_async, clippy::too_many_lines)]

#[macro_use]
mod fmt;

mod address;
pub mod api;
pub mod backend;
pub mod bus;
mod codec_switch;
pub mod constants;
mod device;
pub mod media;
mod monitor;
mod path;
pub mod processor;
pub mod profile;
mod registry;
mod transport;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::{MappedMutexGuard, Mutex, MutexGuard};

use crate::constants::{MAX_CHANNELS, MAX_CODECS, MAX_DEVICES, MAX_NAME_LENGTH, MAX_NOTIFICATIONS};

pub use address::BluetoothAddress;
pub use backend::{BackendKind, BackendSelection};
pub use bus::{BusError, BusEvent, HostBus, StreamHandle};
pub use codec_switch::CodecSwitchStatus;
pub use device::{Device, ReconnectState};
pub use media::{AudioParams, CodecId, MediaCodec, MediaSettings};
pub use monitor::{DiscoveryPhase, Monitor};
pub use path::ObjectPath;
pub use profile::Profile;
pub use registry::{Adapter, Registry, RemoteEndpoint};
pub use transport::{Transport, TransportState, TransportVolume, VolumeChannel};

pub(crate) static REQUEST_CHANNEL: Channel<CriticalSectionRawMutex, Request, MAX_CHANNELS> =
    Channel::new();

pub(crate) static RESPONSE_CHANNEL: Channel<CriticalSectionRawMutex, Response, MAX_CHANNELS> =
    Channel::new();

pub(crate) static EVENT_CHANNEL: Channel<CriticalSectionRawMutex, BusEvent, MAX_CHANNELS> =
    Channel::new();

pub(crate) static NOTIFICATION_CHANNEL: Channel<
    CriticalSectionRawMutex,
    Notification,
    MAX_NOTIFICATIONS,
> = Channel::new();

/// Global `Monitor`, initialized by the client at runtime
pub(crate) static MONITOR: Mutex<CriticalSectionRawMutex, Option<Monitor>> = Mutex::new(None);

/// Initialize the global `Monitor` with the given options.
///
/// This function must be called before using any API functions or spawning
/// the processor task; [`processor::run`] calls it for you.
///
/// # Errors
///
/// Returns an error if the `Monitor` has already been initialized.
pub async fn init_monitor(options: MonitorOptions) -> Result<(), &'static str> {
    let mut guard = MONITOR.lock().await;
    if guard.is_some() {
        return Err("Monitor already initialized");
    }
    *guard = Some(Monitor::new(options));
    Ok(())
}

/// Get a locked reference to the global `Monitor`.
///
/// # Errors
///
/// Returns an error if the `Monitor` has not been initialized.
///
/// # Panics
///
/// This function panics if the mutex guard cannot be mapped (should never
/// happen in practice).
///
/// # Note
///
/// This function is primarily intended for internal use by the processor
/// task. API users should use the functions in the `api` module instead.
pub async fn monitor<'a>()
-> Result<MappedMutexGuard<'a, CriticalSectionRawMutex, Monitor>, &'static str> {
    let guard = MONITOR.lock().await;
    if guard.is_none() {
        return Err("Monitor not initialized");
    }
    Ok(MutexGuard::map(guard, |opt| opt.as_mut().unwrap()))
}

/// Monitor-level errors with detailed error information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MonitorError {
    /// Operation not supported in the current configuration
    NotSupported,
    /// Device with the specified path is not known
    DeviceNotFound,
    /// Transport with the specified path is not known
    TransportNotFound,
    /// The device has no (known) adapter
    AdapterNotFound,
    /// No codec/endpoint candidate was accepted by the peer
    NoEndpointFound,
    /// Invalid object state for the requested operation
    InvalidState,
    /// Invalid parameter provided (e.g., malformed path or address)
    InvalidParameter,
    /// The monitor has not been initialized
    NotInitialized,
    /// A bounded registry map is full
    CapacityExceeded,
    /// The IPC substrate or the daemon reported an error
    BusFailure,
}

/// Options for configuring a `Monitor` instance
///
/// # Examples
///
/// ```rust
/// use warbler::{BackendSelection, MonitorOptions};
///
/// // Use default options
/// let default_options = MonitorOptions::default();
///
/// // Telephony through the first available backend
/// let custom = MonitorOptions {
///     backend: BackendSelection::Any,
///     ..MonitorOptions::default()
/// };
/// # let _ = (default_options, custom);
/// ```
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Telephony backend selection policy
    pub backend: BackendSelection,
    /// Codecs allowed in negotiation, in no particular order
    pub enabled_codecs: heapless::Vec<CodecId, MAX_CODECS>,
    /// Reference audio parameters for configuration selection
    pub audio: AudioParams,
    /// Global codec tuning knobs
    pub media: MediaSettings,
    /// Profiles to actively reconnect on bonded devices
    pub reconnect_profiles: Profile,
    /// Profiles allowed to drive hardware volume
    pub hw_volume_profiles: Profile,
}

impl MonitorOptions {
    /// Whether a codec takes part in negotiation
    #[must_use]
    pub fn codec_enabled(&self, id: CodecId) -> bool {
        self.enabled_codecs.iter().any(|codec| *codec == id)
    }
}

impl Default for MonitorOptions {
    fn default() -> Self {
        let mut enabled_codecs = heapless::Vec::new();
        for codec in media::ALL_CODECS {
            enabled_codecs.push(codec.id()).ok();
        }
        Self {
            backend: BackendSelection::default(),
            enabled_codecs,
            audio: AudioParams::default(),
            media: MediaSettings::default(),
            reconnect_profiles: Profile::A2DP_SINK | Profile::HSP_HS | Profile::HFP_HF,
            hw_volume_profiles: Profile::MEDIA_SINK | Profile::MEDIA_SOURCE,
        }
    }
}

/// Snapshot of one device for API consumers
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Daemon-assigned path
    pub path: ObjectPath,
    /// Peer address, once reported
    pub address: Option<BluetoothAddress>,
    /// Remote-provided name
    pub name: Option<heapless::String<MAX_NAME_LENGTH>>,
    /// User-set alias
    pub alias: Option<heapless::String<MAX_NAME_LENGTH>>,
    /// Aggregate connection state
    pub connected: bool,
    /// Profiles the peer advertises
    pub profiles: Profile,
    /// Profiles currently live
    pub connected_profiles: Profile,
    /// Battery percentage reported by the peer
    pub battery: Option<u8>,
}

/// API requests sent to the processor task
#[derive(Debug, Clone)]
pub(crate) enum Request {
    /// Get the list of tracked devices
    GetDevices,
    /// Negotiate a media codec for a device
    EnsureMediaCodec {
        device: ObjectPath,
        codec: Option<CodecId>,
    },
    /// Acquire the stream resource behind a transport
    AcquireTransport {
        transport: ObjectPath,
        optional: bool,
    },
    /// Release the stream resource behind a transport
    ReleaseTransport { transport: ObjectPath },
    /// Toggle the keepalive hold on a transport
    SetTransportKeepalive {
        transport: ObjectPath,
        keepalive: bool,
    },
    /// Set the hardware volume of a transport channel
    SetTransportVolume {
        transport: ObjectPath,
        channel: VolumeChannel,
        volume: u16,
    },
}

/// API responses sent back from the processor task
#[derive(Debug, Clone)]
pub(crate) enum Response {
    /// List of tracked devices
    Devices(heapless::Vec<DeviceInfo, MAX_DEVICES>),
    /// The codec switch was accepted; completion arrives as a
    /// [`Notification::CodecSwitched`]
    Accepted,
    /// The acquired stream resource
    Stream(StreamHandle),
    /// Operation completed
    Done,
    /// Error occurred
    Error(MonitorError),
}

/// Entity lifecycle notifications consumed by the media-graph layer
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// An adapter became usable (both interfaces present)
    AdapterAdded(ObjectPath),
    /// An adapter was removed, after all its devices
    AdapterRemoved(ObjectPath),
    /// A device became visible to consumers
    DeviceAdded(ObjectPath),
    /// A device is about to be destroyed
    DeviceRemoved(ObjectPath),
    /// A device's aggregate connection state changed
    DeviceConnected {
        /// The device
        path: ObjectPath,
        /// New aggregate state
        connected: bool,
    },
    /// A device's live profile mask changed
    ProfilesChanged {
        /// The device
        path: ObjectPath,
        /// Mask before the change
        prev_connected: Profile,
        /// Mask after the change
        connected: Profile,
    },
    /// A codec switch finished
    CodecSwitched {
        /// The device
        path: ObjectPath,
        /// Outcome
        status: CodecSwitchStatus,
    },
    /// A transport was created
    TransportAdded(ObjectPath),
    /// A transport was destroyed
    TransportRemoved(ObjectPath),
    /// A transport's daemon-side stream state changed
    TransportStateChanged {
        /// The transport
        path: ObjectPath,
        /// New stream state
        state: TransportState,
    },
    /// The peer changed a transport's hardware volume
    TransportVolumeChanged {
        /// The transport
        path: ObjectPath,
        /// Affected stream direction
        channel: VolumeChannel,
        /// New hardware volume step
        volume: u16,
    },
    /// The peer reported a battery level
    BatteryChanged {
        /// The device
        path: ObjectPath,
        /// Charge percentage
        percentage: u8,
    },
}

/// Bounded queue of pending notifications inside the monitor
pub(crate) type Notifications = heapless::Deque<Notification, MAX_NOTIFICATIONS>;

/// Queue a notification, dropping the oldest entry on overflow
pub(crate) fn push_note(notes: &mut Notifications, note: Notification) {
    if notes.is_full() {
        warn!("notification queue overflow, dropping oldest entry");
        notes.pop_front();
    }
    notes.push_back(note).ok();
}
