//! Abstract IPC substrate towards the Bluetooth daemon
//!
//! Warbler never speaks the wire protocol itself. Applications implement
//! [`HostBus`] on top of their IPC stack and feed inbound daemon signals and
//! call replies into the event channel via [`submit`]. Outbound calls come
//! in two flavours: fire-and-forget enqueues whose replies (if any) arrive
//! later as [`BusEvent`]s correlated by [`CallToken`], and short awaited
//! calls such as transport acquisition.
//!
//! Property bundles arrive pre-decoded as typed [`Property`] values; keys
//! the substrate does not understand are passed through as
//! [`Property::Unknown`] so the dispatcher can log and skip them.

use crate::backend::BackendKind;
use crate::constants::{
    MAX_BUNDLE_PROPS, MAX_CAPS_SIZE, MAX_DEVICE_UUIDS, MAX_LINKED_TRANSPORTS, MAX_NAME_LENGTH,
    MAX_OBJECT_INTERFACES, MAX_OBJECT_RECORDS,
};
use crate::media::{ConfigBlob, QosParams};
use crate::path::ObjectPath;
use crate::profile::Uuid;
use crate::transport::TransportState;

/// Correlation token for an outbound call whose reply arrives as an event
pub type CallToken = u32;

/// Errors reported by the IPC substrate or the remote daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// The call could not be sent or the daemon returned a generic error
    Failure,
    /// The remote object is not available right now
    NotAvailable,
    /// The peer rejected the request
    Rejected,
    /// The request carried arguments the daemon refused
    InvalidArguments,
}

/// An acquired kernel stream resource backing a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamHandle {
    /// File descriptor of the stream socket
    pub fd: i32,
    /// Read MTU in bytes
    pub read_mtu: u16,
    /// Write MTU in bytes
    pub write_mtu: u16,
}

/// Daemon-side interfaces an object can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InterfaceKind {
    /// A local adapter
    Adapter,
    /// The media side of a local adapter
    Media,
    /// A remote device
    Device,
    /// A remote codec endpoint
    MediaEndpoint,
    /// A negotiated media transport
    MediaTransport,
    /// Battery reporting on a remote device
    Battery,
    /// The daemon's profile manager (enables the native telephony backend)
    ProfileManager,
}

/// One decoded property value
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    /// Device or adapter address string, `XX:XX:XX:XX:XX:XX`
    Address(heapless::String<17>),
    /// Human-readable name
    Name(heapless::String<MAX_NAME_LENGTH>),
    /// User-set alias
    Alias(heapless::String<MAX_NAME_LENGTH>),
    /// Icon name
    Icon(heapless::String<MAX_NAME_LENGTH>),
    /// Owning adapter of a device
    Adapter(ObjectPath),
    /// Bonded flag
    Paired(bool),
    /// Trusted flag
    Trusted(bool),
    /// Blocked flag
    Blocked(bool),
    /// Daemon-side aggregate connection flag
    Connected(bool),
    /// Service discovery finished
    ServicesResolved(bool),
    /// Adapter powered flag
    Powered(bool),
    /// Advertised service UUIDs
    Uuids(heapless::Vec<Uuid, MAX_DEVICE_UUIDS>),
    /// Profile UUID of a remote endpoint or transport
    Uuid(Uuid),
    /// Owning device of an endpoint or transport
    Device(ObjectPath),
    /// Numeric codec identifier
    Codec(u8),
    /// Codec capability blob (replaced wholesale)
    Capabilities(heapless::Vec<u8, MAX_CAPS_SIZE>),
    /// Selected transport configuration blob
    Configuration(heapless::Vec<u8, MAX_CAPS_SIZE>),
    /// Endpoint supports delay reporting
    DelayReporting(bool),
    /// Endpoint acts as stream acceptor
    Acceptor(bool),
    /// Daemon-side transport state
    State(TransportState),
    /// Hardware volume
    Volume(u16),
    /// Presentation delay in 1/10 ms units
    Delay(u16),
    /// Transports sharing one physical stream group
    Links(heapless::Vec<ObjectPath, MAX_LINKED_TRANSPORTS>),
    /// Battery charge percentage
    Percentage(u8),
    /// A key this crate does not model; logged and skipped
    Unknown(heapless::String<24>),
}

/// Set of properties delivered for one interface
pub type PropertyBundle = heapless::Vec<Property, MAX_BUNDLE_PROPS>;

/// Properties of one interface on one object
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceProps {
    /// Which interface the bundle belongs to
    pub interface: InterfaceKind,
    /// The decoded properties
    pub props: PropertyBundle,
}

/// One object from an enumeration reply or an added-signal
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    /// Daemon-assigned path of the object
    pub path: ObjectPath,
    /// Interfaces present on the object
    pub interfaces: heapless::Vec<InterfaceProps, MAX_OBJECT_INTERFACES>,
}

/// External services whose availability gates a telephony backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelephonyService {
    /// The oFono daemon
    Ofono,
    /// The hsphfpd daemon
    Hsphfpd,
}

/// Configuration and QoS answer for a `SelectProperties` exchange
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedProperties {
    /// Chosen configuration blob
    pub configuration: ConfigBlob,
    /// Stream QoS parameters, when the codec provides them
    pub qos: Option<QosParams>,
}

/// Inbound daemon signals, call replies and negotiation callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// The daemon claimed its well-known identity
    DaemonAppeared,
    /// The daemon disappeared from the bus; all mirrored state is stale
    DaemonDisappeared,
    /// An external telephony service appeared or disappeared
    ServiceAvailability {
        /// Which service changed
        service: TelephonyService,
        /// Whether it is now available
        available: bool,
    },
    /// Reply to [`HostBus::enumerate_objects`]
    ObjectsEnumerated {
        /// The enumerated object graph, or the daemon's error
        result: Result<heapless::Vec<ObjectRecord, MAX_OBJECT_RECORDS>, BusError>,
    },
    /// Incremental object-added signal
    InterfacesAdded {
        /// The added object and its interface property bundles
        record: ObjectRecord,
    },
    /// Incremental object-removed signal
    InterfacesRemoved {
        /// Path of the removed object
        path: ObjectPath,
        /// Interfaces removed from it
        interfaces: heapless::Vec<InterfaceKind, MAX_OBJECT_INTERFACES>,
    },
    /// Incremental property-change signal
    PropertiesChanged {
        /// Path of the changed object
        path: ObjectPath,
        /// Interface the changes apply to
        interface: InterfaceKind,
        /// Changed keys and their new values
        props: PropertyBundle,
    },
    /// Reply to [`HostBus::set_endpoint_configuration`]
    ConfigureReply {
        /// Token passed when the call was issued
        token: CallToken,
        /// Whether the peer accepted the configuration
        result: Result<(), BusError>,
    },
    /// Daemon asks a local endpoint for a best-effort configuration pick
    SelectConfiguration {
        /// Local endpoint being addressed
        endpoint: ObjectPath,
        /// Peer capability blob
        capabilities: heapless::Vec<u8, MAX_CAPS_SIZE>,
        /// Token to answer with [`HostBus::reply_select_configuration`]
        reply: CallToken,
    },
    /// Daemon asks a local endpoint for configuration plus stream QoS
    SelectProperties {
        /// Local endpoint being addressed
        endpoint: ObjectPath,
        /// Peer capability blob
        capabilities: heapless::Vec<u8, MAX_CAPS_SIZE>,
        /// Token to answer with [`HostBus::reply_select_properties`]
        reply: CallToken,
    },
    /// Daemon materializes or updates a transport on a local endpoint
    SetConfiguration {
        /// Local endpoint being configured
        endpoint: ObjectPath,
        /// Path of the transport object
        transport: ObjectPath,
        /// Transport properties
        props: PropertyBundle,
    },
    /// Daemon tears down a transport previously set on a local endpoint
    ClearConfiguration {
        /// Path of the transport object
        transport: ObjectPath,
    },
    /// Daemon released a local endpoint registration
    EndpointReleased {
        /// The released local endpoint
        endpoint: ObjectPath,
    },
}

/// Outbound calls towards the daemon
///
/// Methods returning plain `Result` enqueue the call and return immediately;
/// their replies, when relevant, arrive as [`BusEvent`]s. The `async`
/// methods block the caller until the daemon answers and are only used for
/// exchanges the original protocol serializes anyway.
pub trait HostBus {
    /// Request the bulk object enumeration; answered by
    /// [`BusEvent::ObjectsEnumerated`]
    ///
    /// # Errors
    /// Returns an error if the call cannot be sent.
    fn enumerate_objects(&self) -> Result<(), BusError>;

    /// Ask the daemon to connect one profile of a device (result ignored)
    ///
    /// # Errors
    /// Returns an error if the call cannot be sent.
    fn connect_profile(&self, device: &ObjectPath, uuid: &str) -> Result<(), BusError>;

    /// Offer a configuration to a remote endpoint; answered by
    /// [`BusEvent::ConfigureReply`] with the same `token`
    ///
    /// # Errors
    /// Returns an error if the call cannot be sent.
    fn set_endpoint_configuration(
        &self,
        endpoint: &ObjectPath,
        local_endpoint: &ObjectPath,
        config: &[u8],
        token: CallToken,
    ) -> Result<(), BusError>;

    /// Acquire the kernel stream resource behind a transport
    ///
    /// # Errors
    /// Returns an error if the daemon refuses; with `optional` set an
    /// unavailable transport answers `BusError::NotAvailable`.
    async fn acquire_transport(
        &self,
        transport: &ObjectPath,
        optional: bool,
    ) -> Result<StreamHandle, BusError>;

    /// Release the kernel stream resource behind a transport
    ///
    /// # Errors
    /// Returns an error if the daemon refuses the release.
    async fn release_transport(&self, transport: &ObjectPath) -> Result<(), BusError>;

    /// Close a stream handle obtained from [`HostBus::acquire_transport`]
    ///
    /// # Errors
    /// Returns an error if the handle is already gone.
    fn close_stream(&self, stream: StreamHandle) -> Result<(), BusError>;

    /// Write a transport's hardware volume property
    ///
    /// # Errors
    /// Returns an error if the call cannot be sent.
    fn set_transport_volume(&self, transport: &ObjectPath, volume: u16) -> Result<(), BusError>;

    /// Register the local media application (codec endpoints) on an adapter
    ///
    /// # Errors
    /// Returns an error if the daemon rejects the registration.
    async fn register_media_application(
        &self,
        adapter: &ObjectPath,
        le_audio: bool,
    ) -> Result<(), BusError>;

    /// Register the virtual battery provider on an adapter
    ///
    /// # Errors
    /// Returns an error if the daemon has no battery provider support.
    async fn register_battery_provider(&self, adapter: &ObjectPath) -> Result<(), BusError>;

    /// Export a battery object for a device
    ///
    /// # Errors
    /// Returns an error if the call cannot be sent.
    fn export_battery(&self, device: &ObjectPath, percentage: u8) -> Result<(), BusError>;

    /// Update a previously exported battery object
    ///
    /// # Errors
    /// Returns an error if the call cannot be sent.
    fn update_battery(&self, device: &ObjectPath, percentage: u8) -> Result<(), BusError>;

    /// Remove a previously exported battery object
    ///
    /// # Errors
    /// Returns an error if the call cannot be sent.
    fn remove_battery(&self, device: &ObjectPath) -> Result<(), BusError>;

    /// Register the telephony profiles of a backend
    ///
    /// # Errors
    /// Returns an error if the backend's daemon rejects the registration.
    async fn register_telephony_profiles(&self, backend: BackendKind) -> Result<(), BusError>;

    /// Unregister the telephony profiles of a backend
    ///
    /// # Errors
    /// Returns an error if the call cannot be sent.
    async fn unregister_telephony_profiles(&self, backend: BackendKind) -> Result<(), BusError>;

    /// Answer a [`BusEvent::SelectConfiguration`] callback
    ///
    /// # Errors
    /// Returns an error if the reply cannot be sent.
    fn reply_select_configuration(
        &self,
        reply: CallToken,
        result: Result<&[u8], BusError>,
    ) -> Result<(), BusError>;

    /// Answer a [`BusEvent::SelectProperties`] callback
    ///
    /// # Errors
    /// Returns an error if the reply cannot be sent.
    fn reply_select_properties(
        &self,
        reply: CallToken,
        result: Result<&SelectedProperties, BusError>,
    ) -> Result<(), BusError>;
}

/// Feed an inbound daemon event into the processor task
pub async fn submit(event: BusEvent) {
    crate::EVENT_CHANNEL.send(event).await;
}
