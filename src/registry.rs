//! Object registry: the local mirror of the daemon's object graph
//!
//! Entities are arena-held in bounded maps keyed by their daemon-assigned
//! path. Cross-references between entities are paths resolved through the
//! maps, never ownership, and destruction nulls every referrer before the
//! entity is dropped: destroying an adapter destroys its devices first,
//! destroying a device force-releases its transports and detaches the
//! endpoints and transports still pointing at it.
//!
//! Property updates are partial, key-by-key merges. Unknown keys are logged
//! and skipped, and records may arrive incomplete; profile logic only
//! activates once a device has both an address and an adapter.

use embassy_time::Instant;

use crate::address::BluetoothAddress;
use crate::bus::{HostBus, Property, PropertyBundle, StreamHandle};
use crate::constants::{MAX_ADAPTERS, MAX_CAPS_SIZE, MAX_DEVICES, MAX_ENDPOINTS, MAX_TRANSPORTS};
use crate::device::Device;
use crate::media::CodecId;
use crate::path::ObjectPath;
use crate::profile::{Profile, Uuid};
use crate::transport::{Transport, TransportState, VolumeChannel};
use crate::{MonitorError, Notification, Notifications, push_note};

/// One local Bluetooth radio
#[derive(Debug, Clone)]
pub struct Adapter {
    /// Daemon-assigned path
    pub path: ObjectPath,
    /// Adapter address, once reported
    pub address: Option<BluetoothAddress>,
    /// Profiles the adapter supports
    pub profiles: Profile,
    /// Powered flag
    pub powered: bool,
    /// The plain adapter interface has been seen
    pub has_adapter_interface: bool,
    /// The media interface has been seen
    pub has_media_interface: bool,
    /// Our media application registration succeeded
    pub media_application_registered: bool,
    /// Our LE audio application registration succeeded
    pub bap_application_registered: bool,
    /// The daemon accepted our battery provider
    pub battery_provider_available: bool,
    /// Adapter advertises LE audio support
    pub le_audio_supported: bool,
}

impl Adapter {
    /// Create an adapter shell for `path`; properties arrive separately
    #[must_use]
    pub fn new(path: ObjectPath) -> Self {
        Self {
            path,
            address: None,
            profiles: Profile::NONE,
            powered: false,
            has_adapter_interface: false,
            has_media_interface: false,
            media_application_registered: false,
            bap_application_registered: false,
            battery_provider_available: false,
            le_audio_supported: false,
        }
    }

    /// Both daemon-side interfaces have appeared; registration may proceed
    #[must_use]
    pub fn ready(&self) -> bool {
        self.has_adapter_interface && self.has_media_interface
    }

    /// Profiles this adapter can connect on a peer: the counterparts of the
    /// roles the adapter itself exposes
    #[must_use]
    pub fn connectable_profiles(&self) -> Profile {
        let mut mask = Profile::NONE;
        let pairs = [
            (Profile::A2DP_SINK, Profile::A2DP_SOURCE),
            (Profile::A2DP_SOURCE, Profile::A2DP_SINK),
            (Profile::BAP_SINK, Profile::BAP_SOURCE),
            (Profile::BAP_SOURCE, Profile::BAP_SINK),
            (Profile::HSP_AG, Profile::HSP_HS),
            (Profile::HSP_HS, Profile::HSP_AG),
            (Profile::HFP_AG, Profile::HFP_HF),
            (Profile::HFP_HF, Profile::HFP_AG),
        ];
        for (own, counterpart) in pairs {
            if self.profiles.intersects(own) {
                mask |= counterpart;
            }
        }
        mask
    }
}

/// One peer-advertised codec capability record
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    /// Daemon-assigned path
    pub path: ObjectPath,
    /// Profile UUID of the endpoint
    pub uuid: Option<Uuid>,
    /// Codec identifier the endpoint advertises
    pub codec_id: Option<CodecId>,
    /// Capability blob, replaced wholesale on every update
    pub capabilities: Option<heapless::Vec<u8, MAX_CAPS_SIZE>>,
    /// Owning device, if still alive
    pub device: Option<ObjectPath>,
    /// Endpoint supports delay reporting
    pub delay_reporting: bool,
    /// Endpoint acts as stream acceptor
    pub acceptor: bool,
}

impl RemoteEndpoint {
    /// Create an endpoint shell for `path`; properties arrive separately
    #[must_use]
    pub fn new(path: ObjectPath) -> Self {
        Self {
            path,
            uuid: None,
            codec_id: None,
            capabilities: None,
            device: None,
            delay_reporting: false,
            acceptor: false,
        }
    }
}

/// Summary of what a device property bundle changed
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DeviceChanges {
    /// The daemon-side `Connected` flag was part of the bundle
    pub connected: Option<bool>,
    /// The advertised UUID set grew
    pub profiles_added: bool,
}

/// Summary of what a transport property bundle changed
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TransportChanges {
    /// Daemon-side stream state changed to this value
    pub state: Option<TransportState>,
    /// Hardware volume changed on this channel
    pub volume: Option<(VolumeChannel, u16)>,
}

/// The in-memory mirror of the daemon's object graph
#[derive(Debug)]
pub struct Registry {
    /// Local adapters by path
    pub adapters: heapless::FnvIndexMap<ObjectPath, Adapter, MAX_ADAPTERS>,
    /// Remote devices by path
    pub devices: heapless::FnvIndexMap<ObjectPath, Device, MAX_DEVICES>,
    /// Remote endpoints by path (global index, negotiation replies carry
    /// only a path)
    pub endpoints: heapless::FnvIndexMap<ObjectPath, RemoteEndpoint, MAX_ENDPOINTS>,
    /// Media transports by path
    pub transports: heapless::FnvIndexMap<ObjectPath, Transport, MAX_TRANSPORTS>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: heapless::FnvIndexMap::new(),
            devices: heapless::FnvIndexMap::new(),
            endpoints: heapless::FnvIndexMap::new(),
            transports: heapless::FnvIndexMap::new(),
        }
    }

    /// Create the adapter on first reference
    ///
    /// # Errors
    /// Returns `MonitorError::CapacityExceeded` when the adapter map is full.
    pub fn ensure_adapter(&mut self, path: &ObjectPath) -> Result<(), MonitorError> {
        if self.adapters.contains_key(path) {
            return Ok(());
        }
        self.adapters
            .insert(path.clone(), Adapter::new(path.clone()))
            .map(|_| ())
            .map_err(|_| MonitorError::CapacityExceeded)
    }

    /// Create the device on first reference
    ///
    /// # Errors
    /// Returns `MonitorError::CapacityExceeded` when the device map is full.
    pub fn ensure_device(&mut self, path: &ObjectPath, now: Instant) -> Result<(), MonitorError> {
        if self.devices.contains_key(path) {
            return Ok(());
        }
        self.devices
            .insert(path.clone(), Device::new(path.clone(), now))
            .map(|_| ())
            .map_err(|_| MonitorError::CapacityExceeded)
    }

    /// Create the remote endpoint on first reference
    ///
    /// # Errors
    /// Returns `MonitorError::CapacityExceeded` when the endpoint map is full.
    pub fn ensure_endpoint(&mut self, path: &ObjectPath) -> Result<(), MonitorError> {
        if self.endpoints.contains_key(path) {
            return Ok(());
        }
        self.endpoints
            .insert(path.clone(), RemoteEndpoint::new(path.clone()))
            .map(|_| ())
            .map_err(|_| MonitorError::CapacityExceeded)
    }

    /// Create the transport on first reference
    ///
    /// # Errors
    /// Returns `MonitorError::CapacityExceeded` when the transport map is full.
    pub fn ensure_transport(&mut self, path: &ObjectPath) -> Result<(), MonitorError> {
        if self.transports.contains_key(path) {
            return Ok(());
        }
        self.transports
            .insert(path.clone(), Transport::new(path.clone()))
            .map(|_| ())
            .map_err(|_| MonitorError::CapacityExceeded)
    }

    /// Apply an adapter property bundle (partial, key-by-key)
    pub(crate) fn apply_adapter_props(&mut self, path: &ObjectPath, props: &PropertyBundle) {
        let Some(adapter) = self.adapters.get_mut(path) else {
            warn!("adapter props for unknown adapter {}", path.as_str());
            return;
        };
        for prop in props {
            match prop {
                Property::Address(value) => match BluetoothAddress::from_hex(value.as_str()) {
                    Ok(address) => adapter.address = Some(address),
                    Err(_) => warn!("adapter {}: malformed address", path.as_str()),
                },
                Property::Powered(value) => adapter.powered = *value,
                Property::Uuids(uuids) => {
                    for uuid in uuids {
                        let profile = Profile::from_uuid(uuid.as_str());
                        adapter.profiles |= profile;
                        if profile.intersects(Profile::BAP_SINK | Profile::BAP_SOURCE) {
                            adapter.le_audio_supported = true;
                        }
                    }
                }
                Property::Unknown(key) => {
                    debug!("adapter {}: unhandled key {}", path.as_str(), key.as_str());
                }
                _ => {
                    debug!("adapter {}: property for another interface", path.as_str());
                }
            }
        }
    }

    /// Apply a device property bundle; the connection state machine is
    /// driven by the caller from the returned summary
    pub(crate) fn apply_device_props(
        &mut self,
        path: &ObjectPath,
        props: &PropertyBundle,
    ) -> DeviceChanges {
        let mut changes = DeviceChanges::default();
        // the adapter back-reference is recorded even when the adapter has
        // not been seen yet; it resolves once the adapter appears
        let mut adapter_ref: Option<ObjectPath> = None;
        for prop in props {
            if let Property::Adapter(adapter_path) = prop {
                if !self.adapters.contains_key(adapter_path) {
                    info!("device {}: unknown adapter", path.as_str());
                }
                adapter_ref = Some(adapter_path.clone());
            }
        }

        let Some(device) = self.devices.get_mut(path) else {
            warn!("device props for unknown device {}", path.as_str());
            return changes;
        };
        if adapter_ref.is_some() {
            device.adapter = adapter_ref;
        }
        for prop in props {
            match prop {
                Property::Address(value) => match BluetoothAddress::from_hex(value.as_str()) {
                    Ok(address) => device.address = Some(address),
                    Err(_) => warn!("device {}: malformed address", path.as_str()),
                },
                Property::Name(value) => device.name = Some(value.clone()),
                Property::Alias(value) => device.alias = Some(value.clone()),
                Property::Icon(value) => device.icon = Some(value.clone()),
                Property::Paired(value) => device.paired = *value,
                Property::Trusted(value) => device.trusted = *value,
                Property::Blocked(value) => device.blocked = *value,
                Property::ServicesResolved(value) => device.services_resolved = *value,
                Property::Connected(value) => changes.connected = Some(*value),
                Property::Uuids(uuids) => {
                    let before = device.profiles;
                    for uuid in uuids {
                        device.profiles |= Profile::from_uuid(uuid.as_str());
                    }
                    if device.profiles != before {
                        changes.profiles_added = true;
                    }
                }
                Property::Adapter(_) => {}
                Property::Unknown(key) => {
                    debug!("device {}: unhandled key {}", path.as_str(), key.as_str());
                }
                _ => {
                    debug!("device {}: property for another interface", path.as_str());
                }
            }
        }
        changes
    }

    /// Apply a remote endpoint property bundle; returns the owning device
    pub(crate) fn apply_endpoint_props(
        &mut self,
        path: &ObjectPath,
        props: &PropertyBundle,
    ) -> Option<ObjectPath> {
        let mut attach: Option<ObjectPath> = None;
        {
            let Some(endpoint) = self.endpoints.get_mut(path) else {
                warn!("endpoint props for unknown endpoint {}", path.as_str());
                return None;
            };
            for prop in props {
                match prop {
                    Property::Uuid(value) => endpoint.uuid = Some(value.clone()),
                    Property::Codec(value) => endpoint.codec_id = Some(*value),
                    Property::Capabilities(value) => {
                        // replaced wholesale, never merged
                        endpoint.capabilities = Some(value.clone());
                    }
                    Property::Device(device_path) => {
                        endpoint.device = Some(device_path.clone());
                        attach = Some(device_path.clone());
                    }
                    Property::DelayReporting(value) => endpoint.delay_reporting = *value,
                    Property::Acceptor(value) => endpoint.acceptor = *value,
                    Property::Unknown(key) => {
                        debug!("endpoint {}: unhandled key {}", path.as_str(), key.as_str());
                    }
                    _ => {
                        debug!("endpoint {}: property for another interface", path.as_str());
                    }
                }
            }
        }
        if let Some(device_path) = &attach {
            if let Some(device) = self.devices.get_mut(device_path) {
                if !device.endpoints.contains(path) {
                    device.endpoints.push(path.clone()).ok();
                }
            } else {
                info!("endpoint {}: unknown device", path.as_str());
            }
        }
        self.endpoints.get(path).and_then(|e| e.device.clone())
    }

    /// Apply a transport property bundle
    pub(crate) fn apply_transport_props(
        &mut self,
        path: &ObjectPath,
        props: &PropertyBundle,
    ) -> TransportChanges {
        let mut changes = TransportChanges::default();
        let mut attach: Option<ObjectPath> = None;
        {
            let Some(transport) = self.transports.get_mut(path) else {
                warn!("transport props for unknown transport {}", path.as_str());
                return changes;
            };
            for prop in props {
                match prop {
                    Property::Uuid(value) => {
                        transport.profile = Profile::from_uuid(value.as_str());
                    }
                    Property::Codec(value) => transport.codec_id = Some(*value),
                    Property::Configuration(value) => {
                        transport.configuration.clear();
                        transport.configuration.extend_from_slice(value).ok();
                    }
                    Property::State(value) => {
                        if transport.state != *value {
                            transport.state = *value;
                            changes.state = Some(*value);
                        }
                    }
                    Property::Device(device_path) => {
                        transport.device = Some(device_path.clone());
                        attach = Some(device_path.clone());
                    }
                    Property::Volume(value) => {
                        if let Some(channel) = transport.volume_channel() {
                            let record = &mut transport.volumes[channel as usize];
                            if record.hw_volume != *value {
                                record.hw_volume = *value;
                                record.active = true;
                                changes.volume = Some((channel, *value));
                            }
                        }
                    }
                    Property::Delay(value) => transport.delay = Some(*value),
                    Property::Links(links) => {
                        transport.links.clear();
                        for link in links {
                            if link != path {
                                transport.links.push(link.clone()).ok();
                            }
                        }
                    }
                    Property::Unknown(key) => {
                        debug!("transport {}: unhandled key {}", path.as_str(), key.as_str());
                    }
                    _ => {
                        debug!("transport {}: property for another interface", path.as_str());
                    }
                }
            }
        }
        if let Some(device_path) = &attach {
            if let Some(device) = self.devices.get_mut(device_path) {
                if !device.transports.contains(path) {
                    device.transports.push(path.clone()).ok();
                }
            } else {
                info!("transport {}: unknown device", path.as_str());
            }
        }
        changes
    }

    /// Stream handle of an acquired linked sibling on the same device
    pub(crate) fn linked_stream(&self, path: &ObjectPath) -> Option<StreamHandle> {
        let transport = self.transports.get(path)?;
        for link in &transport.links {
            if let Some(sibling) = self.transports.get(link) {
                if sibling.acquired && sibling.device == transport.device {
                    if let Some(stream) = sibling.stream {
                        return Some(stream);
                    }
                }
            }
        }
        None
    }

    /// Whether an acquired linked sibling still holds the shared stream,
    /// meaning the wire release must be skipped
    fn linked_holder_exists(&self, transport: &Transport) -> bool {
        transport.links.iter().any(|link| {
            self.transports
                .get(link)
                .is_some_and(|sibling| sibling.acquired && sibling.device == transport.device)
        })
    }

    /// Force-release the resource behind a transport immediately, bypassing
    /// the deferred-release grace window
    pub(crate) async fn release_transport_now<B: HostBus>(&mut self, path: &ObjectPath, bus: &B) {
        let (stream, wire) = {
            let Some(transport) = self.transports.get(path) else {
                return;
            };
            if !transport.acquired {
                return;
            }
            (transport.stream, !self.linked_holder_exists(transport))
        };
        if wire {
            if let Some(stream) = stream {
                bus.close_stream(stream).ok();
            }
            if bus.release_transport(path).await.is_err() {
                debug!("failed to release transport {}", path.as_str());
            }
        } else {
            info!("linked transport {} released", path.as_str());
        }
        if let Some(transport) = self.transports.get_mut(path) {
            transport.reset_acquisition();
        }
    }

    /// Force-release every transport owned by a device
    pub(crate) async fn release_device_transports<B: HostBus>(
        &mut self,
        device_path: &ObjectPath,
        bus: &B,
    ) {
        let paths: heapless::Vec<ObjectPath, { crate::constants::MAX_DEVICE_TRANSPORTS }> = self
            .devices
            .get(device_path)
            .map(|device| device.transports.clone())
            .unwrap_or_default();
        for path in &paths {
            self.release_transport_now(path, bus).await;
        }
    }

    /// Destroy a transport: force-release the resource, detach it from its
    /// device (updating the connected-profile mask), unlink siblings
    pub(crate) async fn destroy_transport<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        bus: &B,
        notes: &mut Notifications,
    ) {
        if self.transports.contains_key(path) {
            self.release_transport_now(path, bus).await;
        }
        let Some(transport) = self.transports.remove(path) else {
            warn!("destroy of unknown transport {}", path.as_str());
            return;
        };

        if let Some(device_path) = &transport.device {
            if let Some(device) = self.devices.get_mut(device_path) {
                if let Some(position) = device.transports.iter().position(|p| p == path) {
                    device.transports.remove(position);
                }
                let previous = device.connected_profiles;
                device.connected_profiles = previous.without(transport.profile);
                if device.connected_profiles != previous {
                    push_note(
                        notes,
                        Notification::ProfilesChanged {
                            path: device_path.clone(),
                            prev_connected: previous,
                            connected: device.connected_profiles,
                        },
                    );
                }
            }
        }

        for other in self.transports.values_mut() {
            if let Some(position) = other.links.iter().position(|p| p == path) {
                other.links.remove(position);
            }
        }

        push_note(notes, Notification::TransportRemoved(path.clone()));
    }

    /// Destroy a remote endpoint, detaching it from its device; returns the
    /// owning device so the caller can re-poke profile consumers
    pub(crate) fn destroy_endpoint(&mut self, path: &ObjectPath) -> Option<ObjectPath> {
        let endpoint = self.endpoints.remove(path)?;
        if let Some(device_path) = &endpoint.device {
            if let Some(device) = self.devices.get_mut(device_path) {
                if let Some(position) = device.endpoints.iter().position(|p| p == path) {
                    device.endpoints.remove(position);
                }
            }
        }
        endpoint.device
    }

    /// Destroy a device: pre-destroy notification, battery unexport, force
    /// release of its transports, detach of endpoints and transports still
    /// referencing it, then drop (sessions and timers go with it)
    pub(crate) async fn destroy_device<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        bus: &B,
        notes: &mut Notifications,
    ) {
        let Some(device) = self.devices.get(path) else {
            warn!("destroy of unknown device {}", path.as_str());
            return;
        };
        push_note(notes, Notification::DeviceRemoved(path.clone()));
        if device.battery_exported {
            bus.remove_battery(path).ok();
        }

        self.release_device_transports(path, bus).await;

        for endpoint in self.endpoints.values_mut() {
            if endpoint.device.as_ref() == Some(path) {
                endpoint.device = None;
            }
        }
        for transport in self.transports.values_mut() {
            if transport.device.as_ref() == Some(path) {
                transport.device = None;
            }
        }

        self.devices.remove(path);
    }

    /// Destroy an adapter, destroying every device bound to it first
    pub(crate) async fn destroy_adapter<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        bus: &B,
        notes: &mut Notifications,
    ) {
        let bound: heapless::Vec<ObjectPath, MAX_DEVICES> = self
            .devices
            .iter()
            .filter(|(_, device)| device.adapter.as_ref() == Some(path))
            .map(|(device_path, _)| device_path.clone())
            .collect();
        for device_path in &bound {
            self.destroy_device(device_path, bus, notes).await;
        }
        if self.adapters.remove(path).is_some() {
            push_note(notes, Notification::AdapterRemoved(path.clone()));
        }
    }

    /// Destroy everything in dependency order: transports, endpoints,
    /// devices, adapters. Used on daemon identity loss.
    pub(crate) async fn reset<B: HostBus>(&mut self, bus: &B, notes: &mut Notifications) {
        let transports: heapless::Vec<ObjectPath, MAX_TRANSPORTS> =
            self.transports.keys().cloned().collect();
        for path in &transports {
            self.destroy_transport(path, bus, notes).await;
        }
        let endpoints: heapless::Vec<ObjectPath, MAX_ENDPOINTS> =
            self.endpoints.keys().cloned().collect();
        for path in &endpoints {
            self.destroy_endpoint(path);
        }
        let devices: heapless::Vec<ObjectPath, MAX_DEVICES> =
            self.devices.keys().cloned().collect();
        for path in &devices {
            self.destroy_device(path, bus, notes).await;
        }
        let adapters: heapless::Vec<ObjectPath, MAX_ADAPTERS> =
            self.adapters.keys().cloned().collect();
        for path in &adapters {
            self.destroy_adapter(path, bus, notes).await;
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{BusCall, MockBus};
    use embassy_futures::block_on;

    fn path(s: &str) -> ObjectPath {
        ObjectPath::new(s).unwrap()
    }

    fn notes() -> Notifications {
        Notifications::new()
    }

    fn registry_with_pair() -> (Registry, ObjectPath, ObjectPath) {
        let mut registry = Registry::new();
        let adapter_path = path("/org/bluez/hci0");
        let device_path = path("/org/bluez/hci0/dev_11");
        registry.ensure_adapter(&adapter_path).unwrap();
        registry
            .ensure_device(&device_path, Instant::from_ticks(0))
            .unwrap();
        let device = registry.devices.get_mut(&device_path).unwrap();
        device.adapter = Some(adapter_path.clone());
        device.address = Some(BluetoothAddress::new([1, 2, 3, 4, 5, 6]));
        (registry, adapter_path, device_path)
    }

    #[test]
    fn test_adapter_destroy_cascades_to_devices() {
        let (mut registry, adapter_path, device_path) = registry_with_pair();

        // a device on another adapter survives
        let other_adapter = path("/org/bluez/hci1");
        let other_device = path("/org/bluez/hci1/dev_22");
        registry.ensure_adapter(&other_adapter).unwrap();
        registry
            .ensure_device(&other_device, Instant::from_ticks(0))
            .unwrap();
        registry.devices.get_mut(&other_device).unwrap().adapter = Some(other_adapter.clone());

        let bus = MockBus::new();
        let mut notes = notes();
        block_on(registry.destroy_adapter(&adapter_path, &bus, &mut notes));

        assert!(!registry.adapters.contains_key(&adapter_path));
        assert!(!registry.devices.contains_key(&device_path));
        assert!(registry.devices.contains_key(&other_device));
        // device removal precedes adapter removal
        let order: heapless::Vec<Notification, 16> = notes.iter().cloned().collect();
        assert_eq!(order[0], Notification::DeviceRemoved(device_path));
        assert_eq!(order[1], Notification::AdapterRemoved(adapter_path));
    }

    #[test]
    fn test_device_destroy_detaches_endpoints_and_transports() {
        let (mut registry, _, device_path) = registry_with_pair();

        let endpoint_path = path("/org/bluez/hci0/dev_11/sep1");
        registry.ensure_endpoint(&endpoint_path).unwrap();
        registry.endpoints.get_mut(&endpoint_path).unwrap().device =
            Some(device_path.clone());

        let transport_path = path("/org/bluez/hci0/dev_11/fd0");
        registry.ensure_transport(&transport_path).unwrap();
        {
            let transport = registry.transports.get_mut(&transport_path).unwrap();
            transport.device = Some(device_path.clone());
            transport.profile = Profile::A2DP_SINK;
            transport.complete_acquire(StreamHandle {
                fd: 4,
                read_mtu: 672,
                write_mtu: 672,
            });
        }

        let bus = MockBus::new();
        let mut notes = notes();
        block_on(registry.destroy_device(&device_path, &bus, &mut notes));

        // detached, not destroyed
        assert!(registry.endpoints.get(&endpoint_path).unwrap().device.is_none());
        assert!(registry.transports.get(&transport_path).unwrap().device.is_none());
        // the acquired transport was force-released and its fd closed
        assert_eq!(bus.count(|c| matches!(c, BusCall::ReleaseTransport { .. })), 1);
        assert_eq!(bus.count(|c| matches!(c, BusCall::CloseStream { fd: 4 })), 1);
        assert!(!registry.transports.get(&transport_path).unwrap().acquired);
    }

    #[test]
    fn test_transport_destroy_updates_connected_mask() {
        let (mut registry, _, device_path) = registry_with_pair();
        let transport_path = path("/org/bluez/hci0/dev_11/fd0");
        registry.ensure_transport(&transport_path).unwrap();
        {
            let transport = registry.transports.get_mut(&transport_path).unwrap();
            transport.device = Some(device_path.clone());
            transport.profile = Profile::A2DP_SINK;
        }
        {
            let device = registry.devices.get_mut(&device_path).unwrap();
            device.transports.push(transport_path.clone()).unwrap();
            device.connected_profiles = Profile::A2DP_SINK | Profile::HFP_HF;
        }

        let bus = MockBus::new();
        let mut notes = notes();
        block_on(registry.destroy_transport(&transport_path, &bus, &mut notes));

        let device = registry.devices.get(&device_path).unwrap();
        assert_eq!(device.connected_profiles, Profile::HFP_HF);
        assert!(device.transports.is_empty());
        let order: heapless::Vec<Notification, 16> = notes.iter().cloned().collect();
        assert!(matches!(
            order[0],
            Notification::ProfilesChanged { .. }
        ));
        assert_eq!(order[1], Notification::TransportRemoved(transport_path));
    }

    #[test]
    fn test_linked_release_skips_wire_call() {
        let (mut registry, _, device_path) = registry_with_pair();
        let first = path("/org/bluez/hci0/dev_11/fd0");
        let second = path("/org/bluez/hci0/dev_11/fd1");
        for p in [&first, &second] {
            registry.ensure_transport(p).unwrap();
            let transport = registry.transports.get_mut(p).unwrap();
            transport.device = Some(device_path.clone());
            transport.profile = Profile::BAP_SINK;
        }
        registry.transports.get_mut(&first).unwrap().links.push(second.clone()).unwrap();
        registry.transports.get_mut(&second).unwrap().links.push(first.clone()).unwrap();

        let stream = StreamHandle {
            fd: 5,
            read_mtu: 120,
            write_mtu: 120,
        };
        registry.transports.get_mut(&first).unwrap().complete_acquire(stream);
        assert_eq!(registry.linked_stream(&second), Some(stream));
        registry.transports.get_mut(&second).unwrap().complete_acquire(stream);

        // releasing one of two acquired linked transports must not touch
        // the wire; the sibling still owns the shared stream
        let bus = MockBus::new();
        block_on(registry.release_transport_now(&second, &bus));
        assert_eq!(bus.count(|c| matches!(c, BusCall::ReleaseTransport { .. })), 0);
        assert_eq!(bus.count(|c| matches!(c, BusCall::CloseStream { .. })), 0);

        // the last one releases for real
        block_on(registry.release_transport_now(&first, &bus));
        assert_eq!(bus.count(|c| matches!(c, BusCall::ReleaseTransport { .. })), 1);
        assert_eq!(bus.count(|c| matches!(c, BusCall::CloseStream { fd: 5 })), 1);
    }

    #[test]
    fn test_property_updates_tolerate_unknown_keys() {
        let (mut registry, _, device_path) = registry_with_pair();
        let mut props = PropertyBundle::new();
        props
            .push(Property::Unknown(
                heapless::String::try_from("Modalias").unwrap(),
            ))
            .unwrap();
        props.push(Property::Paired(true)).unwrap();
        let changes = registry.apply_device_props(&device_path, &props);
        assert!(changes.connected.is_none());
        assert!(registry.devices.get(&device_path).unwrap().paired);
    }

    #[test]
    fn test_device_ready_gate() {
        let mut registry = Registry::new();
        let device_path = path("/org/bluez/hci0/dev_33");
        registry
            .ensure_device(&device_path, Instant::from_ticks(0))
            .unwrap();
        assert!(!registry.devices.get(&device_path).unwrap().ready());

        // the adapter back-reference is recorded even before the adapter
        // itself appears, but the device is not ready until the address
        // shows up too
        let mut props = PropertyBundle::new();
        props
            .push(Property::Adapter(path("/org/bluez/hci9")))
            .unwrap();
        registry.apply_device_props(&device_path, &props);
        assert!(!registry.devices.get(&device_path).unwrap().ready());

        let mut props = PropertyBundle::new();
        props
            .push(Property::Address(
                heapless::String::try_from("11:22:33:44:55:66").unwrap(),
            ))
            .unwrap();
        registry.apply_device_props(&device_path, &props);
        assert!(registry.devices.get(&device_path).unwrap().ready());
    }

    #[test]
    fn test_endpoint_capabilities_replaced_wholesale() {
        let mut registry = Registry::new();
        let endpoint_path = path("/org/bluez/hci0/dev_11/sep1");
        registry.ensure_endpoint(&endpoint_path).unwrap();

        let mut caps = heapless::Vec::new();
        caps.extend_from_slice(&[0xFF, 0xFF, 2, 64]).unwrap();
        let mut props = PropertyBundle::new();
        props.push(Property::Capabilities(caps)).unwrap();
        registry.apply_endpoint_props(&endpoint_path, &props);

        let mut caps = heapless::Vec::new();
        caps.extend_from_slice(&[0x21, 0x15]).unwrap();
        let mut props = PropertyBundle::new();
        props.push(Property::Capabilities(caps)).unwrap();
        registry.apply_endpoint_props(&endpoint_path, &props);

        assert_eq!(
            registry
                .endpoints
                .get(&endpoint_path)
                .unwrap()
                .capabilities
                .as_deref(),
            Some(&[0x21, 0x15][..])
        );
    }

    #[test]
    fn test_capacity_exceeded_is_an_error() {
        let mut registry = Registry::new();
        for i in 0..MAX_ADAPTERS {
            let mut s: heapless::String<64> = heapless::String::new();
            s.push_str("/org/bluez/hci").unwrap();
            s.push(char::from(b'0' + i as u8)).unwrap();
            registry.ensure_adapter(&path(s.as_str())).unwrap();
        }
        assert_eq!(
            registry.ensure_adapter(&path("/org/bluez/hci9")),
            Err(MonitorError::CapacityExceeded)
        );
    }
}
