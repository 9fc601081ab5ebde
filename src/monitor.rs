//! Monitor core: discovery, event dispatch and request handling
//!
//! The monitor owns the registry, the discovery phase, the telephony
//! backend arbiter and the notification queue. Every state transition in
//! the crate funnels through the three entry points called by the
//! processor task: [`Monitor::handle_event`] for daemon signals and call
//! replies, [`Monitor::handle_request`] for API requests, and
//! [`Monitor::handle_timeouts`] for expired deadlines.
//!
//! Discovery is a three-phase machine: `Uninitialized` until the daemon
//! appears, `Enumerating` while exactly one bulk enumeration call is
//! outstanding, then `Live` for incremental signals. Losing the daemon
//! identity resets everything in dependency order and suppresses
//! incremental events until the next successful enumeration.

use embassy_time::Instant;

use crate::backend::{BackendKind, Backends};
use crate::bus::{
    BusEvent, CallToken, HostBus, InterfaceKind, ObjectRecord, Property, PropertyBundle,
    SelectedProperties, StreamHandle, TelephonyService,
};
use crate::codec_switch::{self, CodecSwitch, CodecSwitchStatus};
use crate::constants::MAX_DEVICES;
use crate::device::{self, ProfileCheck, ReconnectState};
use crate::media::{self, CodecId};
use crate::path::ObjectPath;
use crate::profile::Profile;
use crate::registry::{DeviceChanges, Registry, TransportChanges};
use crate::transport::{ReleaseStep, AcquireStep, VolumeChannel};
use crate::{
    DeviceInfo, MonitorError, MonitorOptions, Notification, Notifications, Request, Response,
    push_note,
};

/// Phase of the object-graph discovery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryPhase {
    /// No daemon, or daemon identity lost
    #[default]
    Uninitialized,
    /// One bulk enumeration call outstanding
    Enumerating,
    /// Incremental events accepted
    Live,
}

/// Shared monitor state, owned by the processor task
pub struct Monitor {
    pub(crate) registry: Registry,
    phase: DiscoveryPhase,
    backends: Backends,
    options: MonitorOptions,
    next_token: CallToken,
    notes: Notifications,
}

impl Monitor {
    /// Create a monitor with the given options
    #[must_use]
    pub fn new(options: MonitorOptions) -> Self {
        let backends = Backends::new(options.backend);
        Self {
            registry: Registry::new(),
            phase: DiscoveryPhase::Uninitialized,
            backends,
            options,
            next_token: 1,
            notes: Notifications::new(),
        }
    }

    /// Current discovery phase
    #[must_use]
    pub fn phase(&self) -> DiscoveryPhase {
        self.phase
    }

    /// Currently registered telephony backend
    #[must_use]
    pub fn telephony_backend(&self) -> Option<BackendKind> {
        self.backends.current()
    }

    /// Pop the oldest queued lifecycle notification
    pub fn take_notification(&mut self) -> Option<Notification> {
        self.notes.pop_front()
    }

    /// Earliest pending deadline across all state machines
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(deadline) = deadline {
                earliest = Some(match earliest {
                    Some(current) if current <= deadline => current,
                    _ => deadline,
                });
            }
        };
        for device in self.registry.devices.values() {
            consider(device.timer);
            for sw in &device.switches {
                consider(sw.timer);
            }
        }
        for transport in self.registry.transports.values() {
            consider(transport.release_timer);
        }
        earliest
    }

    fn take_token(&mut self) -> CallToken {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        token
    }

    fn device_ready(&self, path: &ObjectPath) -> bool {
        self.registry.devices.get(path).is_some_and(|device| {
            device.address.is_some()
                && device
                    .adapter
                    .as_ref()
                    .is_some_and(|adapter| self.registry.adapters.contains_key(adapter))
        })
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    /// Route one inbound daemon event
    pub async fn handle_event<B: HostBus>(&mut self, event: BusEvent, bus: &B, now: Instant) {
        match event {
            BusEvent::DaemonAppeared => {
                debug!("bluetooth daemon appeared");
                self.registry.reset(bus, &mut self.notes).await;
                self.start_enumeration(bus);
            }
            BusEvent::DaemonDisappeared => {
                debug!("bluetooth daemon disappeared");
                self.phase = DiscoveryPhase::Uninitialized;
                self.backends.set_available(BackendKind::Native, false);
                self.backends.reselect(bus, true).await;
                self.registry.reset(bus, &mut self.notes).await;
            }
            BusEvent::ServiceAvailability { service, available } => {
                let kind = match service {
                    TelephonyService::Ofono => BackendKind::Ofono,
                    TelephonyService::Hsphfpd => BackendKind::Hsphfpd,
                };
                if self.backends.set_available(kind, available) {
                    self.backends.reselect(bus, false).await;
                }
            }
            BusEvent::ObjectsEnumerated { result } => {
                if self.phase != DiscoveryPhase::Enumerating {
                    warn!("unexpected enumeration reply");
                    return;
                }
                match result {
                    Ok(records) => {
                        self.phase = DiscoveryPhase::Live;
                        for record in &records {
                            self.apply_object_record(record, bus, now).await;
                        }
                        self.backends.reselect(bus, false).await;
                    }
                    Err(_) => {
                        error!("object enumeration failed");
                        self.phase = DiscoveryPhase::Uninitialized;
                    }
                }
            }
            BusEvent::InterfacesAdded { record } => {
                if self.phase != DiscoveryPhase::Live {
                    debug!("ignoring interfaces-added before enumeration");
                    return;
                }
                self.apply_object_record(&record, bus, now).await;
            }
            BusEvent::InterfacesRemoved { path, interfaces } => {
                if self.phase != DiscoveryPhase::Live {
                    debug!("ignoring interfaces-removed before enumeration");
                    return;
                }
                for interface in &interfaces {
                    self.remove_interface(&path, *interface, bus).await;
                }
            }
            BusEvent::PropertiesChanged {
                path,
                interface,
                props,
            } => {
                if self.phase != DiscoveryPhase::Live {
                    debug!("ignoring property change before enumeration");
                    return;
                }
                self.apply_interface(&path, interface, &props, bus, now, false)
                    .await;
            }
            BusEvent::ConfigureReply { token, result } => {
                self.handle_configure_reply(token, result.is_ok(), bus, now).await;
            }
            BusEvent::SelectConfiguration {
                endpoint,
                capabilities,
                reply,
            } => {
                self.handle_select_configuration(&endpoint, &capabilities, reply, bus);
            }
            BusEvent::SelectProperties {
                endpoint,
                capabilities,
                reply,
            } => {
                self.handle_select_properties(&endpoint, &capabilities, reply, bus);
            }
            BusEvent::SetConfiguration {
                endpoint,
                transport,
                props,
            } => {
                self.handle_set_configuration(&endpoint, &transport, &props, bus, now)
                    .await;
            }
            BusEvent::ClearConfiguration { transport } => {
                if self.registry.transports.contains_key(&transport) {
                    self.registry
                        .destroy_transport(&transport, bus, &mut self.notes)
                        .await;
                } else {
                    warn!("clear configuration for unknown transport {}", transport.as_str());
                }
            }
            BusEvent::EndpointReleased { endpoint } => {
                debug!("local endpoint {} released", endpoint.as_str());
            }
        }
    }

    fn start_enumeration<B: HostBus>(&mut self, bus: &B) {
        if self.phase == DiscoveryPhase::Enumerating {
            debug!("enumeration already in progress");
            return;
        }
        self.phase = DiscoveryPhase::Enumerating;
        if bus.enumerate_objects().is_err() {
            error!("failed to request object enumeration");
            self.phase = DiscoveryPhase::Uninitialized;
        }
    }

    async fn apply_object_record<B: HostBus>(
        &mut self,
        record: &ObjectRecord,
        bus: &B,
        now: Instant,
    ) {
        for interface in &record.interfaces {
            self.apply_interface(&record.path, interface.interface, &interface.props, bus, now, true)
                .await;
        }
    }

    async fn apply_interface<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        interface: InterfaceKind,
        props: &PropertyBundle,
        bus: &B,
        now: Instant,
        create: bool,
    ) {
        trace!("object {}: interface update", path.as_str());
        match interface {
            InterfaceKind::Adapter | InterfaceKind::Media => {
                if create {
                    if self.registry.ensure_adapter(path).is_err() {
                        warn!("cannot create adapter {}", path.as_str());
                        return;
                    }
                } else if !self.registry.adapters.contains_key(path) {
                    warn!("property change for unknown adapter {}", path.as_str());
                    return;
                }
                self.registry.apply_adapter_props(path, props);
                if create {
                    if let Some(adapter) = self.registry.adapters.get_mut(path) {
                        match interface {
                            InterfaceKind::Adapter => adapter.has_adapter_interface = true,
                            _ => adapter.has_media_interface = true,
                        }
                        if adapter.has_adapter_interface
                            && adapter.has_media_interface
                            && !adapter.media_application_registered
                        {
                            push_note(&mut self.notes, Notification::AdapterAdded(path.clone()));
                        }
                    }
                    self.adapter_maybe_register(path, bus, now).await;
                }
            }
            InterfaceKind::ProfileManager => {
                if self.backends.set_available(BackendKind::Native, true) {
                    self.backends.reselect(bus, false).await;
                }
            }
            InterfaceKind::Device => {
                let fresh = create && !self.registry.devices.contains_key(path);
                if create {
                    if self.registry.ensure_device(path, now).is_err() {
                        warn!("cannot create device {}", path.as_str());
                        return;
                    }
                } else if !self.registry.devices.contains_key(path) {
                    warn!("property change for unknown device {}", path.as_str());
                    return;
                }
                if fresh {
                    if let Some(device) = self.registry.devices.get_mut(path) {
                        device.reconnect_profiles = self.options.reconnect_profiles;
                        device.hw_volume_profiles = self.options.hw_volume_profiles;
                    }
                }
                let changes = self.registry.apply_device_props(path, props);
                if create {
                    if let Some(device) = self.registry.devices.get_mut(path) {
                        device.reconnect_state = ReconnectState::Init;
                    }
                }
                self.device_follow_up(path, changes, bus, now).await;
            }
            InterfaceKind::MediaEndpoint => {
                if create {
                    if self.registry.ensure_endpoint(path).is_err() {
                        warn!("cannot create remote endpoint {}", path.as_str());
                        return;
                    }
                } else if !self.registry.endpoints.contains_key(path) {
                    warn!("property change for unknown endpoint {}", path.as_str());
                    return;
                }
                if let Some(owner) = self.registry.apply_endpoint_props(path, props) {
                    self.poke_profiles(&owner);
                }
            }
            InterfaceKind::MediaTransport => {
                if create {
                    if self.registry.ensure_transport(path).is_err() {
                        warn!("cannot create transport {}", path.as_str());
                        return;
                    }
                } else if !self.registry.transports.contains_key(path) {
                    warn!("property change for unknown transport {}", path.as_str());
                    return;
                }
                let changes = self.registry.apply_transport_props(path, props);
                self.transport_follow_up(path, changes);
            }
            InterfaceKind::Battery => {
                if !self.registry.devices.contains_key(path) {
                    warn!("battery report for unknown device {}", path.as_str());
                    return;
                }
                for prop in props {
                    if let Property::Percentage(percentage) = prop {
                        self.update_device_battery(path, *percentage, bus);
                    }
                }
            }
        }
    }

    async fn remove_interface<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        interface: InterfaceKind,
        bus: &B,
    ) {
        debug!("object {}: interface removed", path.as_str());
        match interface {
            InterfaceKind::Device => {
                if self.registry.devices.contains_key(path) {
                    self.registry.destroy_device(path, bus, &mut self.notes).await;
                }
            }
            InterfaceKind::Adapter | InterfaceKind::Media => {
                if self.registry.adapters.contains_key(path) {
                    self.registry.destroy_adapter(path, bus, &mut self.notes).await;
                }
            }
            InterfaceKind::MediaEndpoint => {
                if let Some(owner) = self.registry.destroy_endpoint(path) {
                    self.poke_profiles(&owner);
                }
            }
            InterfaceKind::MediaTransport => {
                if self.registry.transports.contains_key(path) {
                    self.registry.destroy_transport(path, bus, &mut self.notes).await;
                }
            }
            InterfaceKind::Battery => {
                if let Some(device) = self.registry.devices.get_mut(path) {
                    device.battery = None;
                    if device.battery_exported {
                        device.battery_exported = false;
                        bus.remove_battery(path).ok();
                    }
                }
            }
            InterfaceKind::ProfileManager => {
                if self.backends.set_available(BackendKind::Native, false) {
                    self.backends.reselect(bus, false).await;
                }
            }
        }
    }

    async fn adapter_maybe_register<B: HostBus>(&mut self, path: &ObjectPath, bus: &B, now: Instant) {
        let (ready, registered, le_audio) = match self.registry.adapters.get(path) {
            Some(adapter) => (
                adapter.ready(),
                adapter.media_application_registered,
                adapter.le_audio_supported,
            ),
            None => return,
        };
        if !ready || registered {
            return;
        }

        match bus.register_media_application(path, false).await {
            Ok(()) => {
                if let Some(adapter) = self.registry.adapters.get_mut(path) {
                    adapter.media_application_registered = true;
                }
            }
            Err(_) => warn!("media application registration failed on {}", path.as_str()),
        }
        if le_audio {
            match bus.register_media_application(path, true).await {
                Ok(()) => {
                    if let Some(adapter) = self.registry.adapters.get_mut(path) {
                        adapter.bap_application_registered = true;
                    }
                }
                Err(_) => warn!("le-audio application registration failed on {}", path.as_str()),
            }
        }
        match bus.register_battery_provider(path).await {
            Ok(()) => {
                if let Some(adapter) = self.registry.adapters.get_mut(path) {
                    adapter.battery_provider_available = true;
                }
            }
            Err(_) => info!("battery provider not supported on {}", path.as_str()),
        }

        // adopt devices that referenced this adapter before it appeared
        let adopted: heapless::Vec<ObjectPath, MAX_DEVICES> = self
            .registry
            .devices
            .iter()
            .filter(|(_, d)| d.adapter.as_ref() == Some(path) && d.address.is_some() && !d.added)
            .map(|(p, _)| p.clone())
            .collect();
        for device_path in &adopted {
            self.device_add_profile(device_path, Profile::NONE, now).await;
        }
    }

    // ------------------------------------------------------------------
    // Device connection state machine driving
    // ------------------------------------------------------------------

    async fn device_follow_up<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        changes: DeviceChanges,
        bus: &B,
        now: Instant,
    ) {
        if let Some(connected) = changes.connected {
            self.device_set_connected(path, connected, bus, now).await;
        }
        if self.device_ready(path) {
            self.device_add_profile(path, Profile::NONE, now).await;
        }
    }

    /// Record a profile on the device and announce it to consumers once it
    /// has any profile at all
    async fn device_add_profile(&mut self, path: &ObjectPath, profile: Profile, now: Instant) {
        let Some(device) = self.registry.devices.get_mut(path) else {
            return;
        };
        if !profile.is_empty() && !device.profiles.contains(profile) {
            info!("device {}: new profile", path.as_str());
            device.profiles |= profile;
        }
        if !device.added && !device.profiles.is_empty() {
            device.added = true;
            device.connected = false;
            push_note(&mut self.notes, Notification::DeviceAdded(path.clone()));
            if device.reconnect_state == ReconnectState::Init {
                device.timer = Some(now + device.reconnect_timeout());
            }
        }
    }

    /// Apply the daemon-side aggregate `Connected` flag
    async fn device_set_connected<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        connected: bool,
        bus: &B,
        now: Instant,
    ) {
        {
            let Some(device) = self.registry.devices.get_mut(path) else {
                return;
            };
            if device.connected && !connected {
                device.connected_profiles = Profile::NONE;
            }
        }
        if connected {
            self.check_profiles(path, false, bus, now).await;
        } else {
            let Some(device) = self.registry.devices.get_mut(path) else {
                return;
            };
            // abandon negotiation on disconnect
            device.switches.clear();
            if device.reconnect_state != ReconnectState::Init {
                device.stop_timer();
            }
            self.device_connected_update(path, false, bus).await;
        }
    }

    /// Flip the aggregate connected state and notify, tearing down the
    /// battery export and stream resources first on disconnect
    async fn device_connected_update<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        connected: bool,
        bus: &B,
    ) {
        let teardown = {
            let Some(device) = self.registry.devices.get_mut(path) else {
                return;
            };
            if !device.added || device.connected == connected {
                return;
            }
            device.connected = connected;
            if !connected && device.battery_exported {
                device.battery_exported = false;
                bus.remove_battery(path).ok();
            }
            !connected
        };
        if teardown {
            self.registry.release_device_transports(path, bus).await;
        }
        push_note(
            &mut self.notes,
            Notification::DeviceConnected {
                path: path.clone(),
                connected,
            },
        );
    }

    /// Re-evaluate the aggregate connection policy for a device
    pub(crate) async fn check_profiles<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        force: bool,
        bus: &B,
        now: Instant,
    ) {
        let connectable = self
            .registry
            .devices
            .get(path)
            .and_then(|device| device.adapter.clone())
            .and_then(|adapter| self.registry.adapters.get(&adapter))
            .map(|adapter| adapter.connectable_profiles())
            .unwrap_or(Profile::NONE);
        let action = match self.registry.devices.get(path) {
            Some(device) => device::evaluate_profiles(device, connectable, force),
            None => return,
        };
        match action {
            ProfileCheck::Disconnect => {
                if let Some(device) = self.registry.devices.get_mut(path) {
                    device.stop_timer();
                }
                self.device_connected_update(path, false, bus).await;
            }
            ProfileCheck::Connect => {
                if let Some(device) = self.registry.devices.get_mut(path) {
                    device.stop_timer();
                }
                self.device_connected_update(path, true, bus).await;
            }
            ProfileCheck::Arm => {
                if let Some(device) = self.registry.devices.get_mut(path) {
                    if device.reconnect_state == ReconnectState::Init {
                        device.reconnect_state = ReconnectState::Profile;
                    }
                    device.timer = Some(now + device.reconnect_timeout());
                }
            }
        }
    }

    /// Mark one profile live and re-run the connection policy
    async fn device_connect_profile<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        profile: Profile,
        bus: &B,
        now: Instant,
    ) {
        let previous = {
            let Some(device) = self.registry.devices.get_mut(path) else {
                return;
            };
            let previous = device.connected_profiles;
            device.connected_profiles |= profile;
            previous
        };
        self.check_profiles(path, false, bus, now).await;
        if let Some(device) = self.registry.devices.get(path) {
            if device.connected_profiles != previous {
                push_note(
                    &mut self.notes,
                    Notification::ProfilesChanged {
                        path: path.clone(),
                        prev_connected: previous,
                        connected: device.connected_profiles,
                    },
                );
            }
        }
    }

    fn poke_profiles(&mut self, path: &ObjectPath) {
        if let Some(device) = self.registry.devices.get(path) {
            push_note(
                &mut self.notes,
                Notification::ProfilesChanged {
                    path: path.clone(),
                    prev_connected: device.connected_profiles,
                    connected: device.connected_profiles,
                },
            );
        }
    }

    fn update_device_battery<B: HostBus>(&mut self, path: &ObjectPath, percentage: u8, bus: &B) {
        let provider = self
            .registry
            .devices
            .get(path)
            .and_then(|device| device.adapter.clone())
            .and_then(|adapter| self.registry.adapters.get(&adapter))
            .is_some_and(|adapter| adapter.battery_provider_available);
        let Some(device) = self.registry.devices.get_mut(path) else {
            return;
        };
        if device.battery == Some(percentage) {
            return;
        }
        device.battery = Some(percentage);
        if provider {
            if device.battery_exported {
                bus.update_battery(path, percentage).ok();
            } else if bus.export_battery(path, percentage).is_ok() {
                device.battery_exported = true;
            }
        }
        push_note(
            &mut self.notes,
            Notification::BatteryChanged {
                path: path.clone(),
                percentage,
            },
        );
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fire every deadline at or before `now`
    pub async fn handle_timeouts<B: HostBus>(&mut self, bus: &B, now: Instant) {
        let due_devices: heapless::Vec<ObjectPath, MAX_DEVICES> = self
            .registry
            .devices
            .iter()
            .filter(|(_, d)| d.timer.is_some_and(|deadline| deadline <= now))
            .map(|(p, _)| p.clone())
            .collect();
        for path in &due_devices {
            self.handle_device_timeout(path, bus, now).await;
        }

        let due_switches: heapless::Vec<ObjectPath, MAX_DEVICES> = self
            .registry
            .devices
            .iter()
            .filter(|(_, d)| {
                d.switches
                    .first()
                    .is_some_and(|sw| sw.timer.is_some_and(|deadline| deadline <= now))
            })
            .map(|(p, _)| p.clone())
            .collect();
        for path in &due_switches {
            if let Some(device) = self.registry.devices.get_mut(path) {
                if let Some(sw) = device.switches.first_mut() {
                    debug!("codec switch rate-limit timer fired for {}", path.as_str());
                    sw.timer = None;
                }
            }
            self.process_codec_switch(path, bus, now).await;
        }

        let due_transports: heapless::Vec<ObjectPath, { crate::constants::MAX_TRANSPORTS }> =
            self.registry
                .transports
                .iter()
                .filter(|(_, t)| t.release_timer_due(now))
                .map(|(p, _)| p.clone())
                .collect();
        for path in &due_transports {
            self.handle_release_timeout(path, bus).await;
        }
    }

    async fn handle_device_timeout<B: HostBus>(&mut self, path: &ObjectPath, bus: &B, now: Instant) {
        let run_reconnect = {
            let Some(device) = self.registry.devices.get_mut(path) else {
                return;
            };
            debug!("device {}: profile timeout", path.as_str());
            device.stop_timer();
            if device.reconnect_state == ReconnectState::Stop {
                false
            } else {
                device.reconnect_state = ReconnectState::Stop;
                device.paired
                    && device.trusted
                    && !device.blocked
                    && !device.reconnect_profiles.is_empty()
            }
        };

        if run_reconnect {
            let mask = device::reconnect_mask(&self.registry, path);
            if !mask.is_empty() {
                for profile in device::RECONNECT_ORDER {
                    if mask.intersects(profile) {
                        if let Some(uuid) = profile.to_uuid() {
                            info!(
                                "device {}: profile not connected, requesting connect",
                                path.as_str()
                            );
                            bus.connect_profile(path, uuid).ok();
                        }
                    }
                }
                if let Some(device) = self.registry.devices.get_mut(path) {
                    device.timer = Some(now + device.reconnect_timeout());
                }
                return;
            }
        }

        let has_live_profiles = self
            .registry
            .devices
            .get(path)
            .is_some_and(|device| !device.connected_profiles.is_empty());
        if has_live_profiles {
            self.device_connected_update(path, true, bus).await;
        }
    }

    async fn handle_release_timeout<B: HostBus>(&mut self, path: &ObjectPath, bus: &B) {
        let due = {
            let Some(transport) = self.registry.transports.get_mut(path) else {
                return;
            };
            transport.release_timer = None;
            transport.acquired && transport.acquire_refcount == 0 && !transport.keepalive
        };
        if due {
            debug!("deferred release of transport {}", path.as_str());
            self.registry.release_transport_now(path, bus).await;
        }
    }

    // ------------------------------------------------------------------
    // Codec switching
    // ------------------------------------------------------------------

    /// Start (or queue) a codec negotiation for a device
    ///
    /// # Errors
    ///
    /// `NotSupported` when the adapter has no media application registered
    /// or the requested codec is unknown/disabled; `DeviceNotFound` /
    /// `AdapterNotFound` when the object graph lacks the entities.
    pub(crate) async fn ensure_media_codec<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        preferred: Option<CodecId>,
        bus: &B,
        now: Instant,
    ) -> Result<(), MonitorError> {
        let adapter_path = self
            .registry
            .devices
            .get(path)
            .ok_or(MonitorError::DeviceNotFound)?
            .adapter
            .clone()
            .ok_or(MonitorError::AdapterNotFound)?;
        let adapter = self
            .registry
            .adapters
            .get(&adapter_path)
            .ok_or(MonitorError::AdapterNotFound)?;
        if !adapter.media_application_registered && !adapter.bap_application_registered {
            return Err(MonitorError::NotSupported);
        }

        let mut codecs: heapless::Vec<CodecId, { crate::constants::MAX_CODECS }> =
            heapless::Vec::new();
        match preferred {
            Some(id) => {
                if media::codec_by_id(id).is_none() || !self.options.codec_enabled(id) {
                    return Err(MonitorError::NotSupported);
                }
                codecs.push(id).ok();
            }
            None => {
                for codec in media::ALL_CODECS {
                    if self.options.codec_enabled(codec.id()) {
                        codecs.push(codec.id()).ok();
                    }
                }
            }
        }

        let device = self
            .registry
            .devices
            .get(path)
            .ok_or(MonitorError::DeviceNotFound)?;
        let top_supported = codecs
            .iter()
            .copied()
            .find(|id| self.device_supports_codec(device, *id));

        // fast path: the top-priority supported codec already has a fully
        // connected transport
        if device.switches.is_empty() {
            if let Some(top) = top_supported {
                for transport_path in &device.transports {
                    let Some(transport) = self.registry.transports.get(transport_path) else {
                        continue;
                    };
                    if transport.codec_id == Some(top)
                        && device.connected_profiles.contains(transport.profile)
                    {
                        push_note(
                            &mut self.notes,
                            Notification::CodecSwitched {
                                path: path.clone(),
                                status: CodecSwitchStatus::Success,
                            },
                        );
                        return Ok(());
                    }
                }
            }
        }

        let profile = device.connected_profiles;
        let paths = device.endpoints.clone();
        let session = CodecSwitch::new(profile, codecs, paths);

        let had_pending = {
            let Some(device) = self.registry.devices.get_mut(path) else {
                return Err(MonitorError::DeviceNotFound);
            };
            let had_pending = device.switches.iter().any(|sw| sw.pending.is_some());
            if !device.switches.is_empty() {
                debug!(
                    "codec switch already in progress for {}, superseding",
                    path.as_str()
                );
            }
            // drop superseded sessions that have nothing in flight; the
            // in-flight one is kept so its reply can be drained
            let mut index = 0;
            while index < device.switches.len() {
                if device.switches[index].pending.is_none() {
                    device.switches.remove(index);
                } else {
                    index += 1;
                }
            }
            if device.switches.insert(0, session).is_err() {
                return Err(MonitorError::CapacityExceeded);
            }
            had_pending
        };

        if !had_pending {
            self.process_codec_switch(path, bus, now).await;
        }
        Ok(())
    }

    fn device_supports_codec(&self, device: &crate::device::Device, id: CodecId) -> bool {
        device.endpoints.iter().any(|endpoint_path| {
            self.registry.endpoints.get(endpoint_path).is_some_and(|ep| {
                ep.codec_id == Some(id)
                    && ep.uuid.as_ref().is_some_and(|uuid| {
                        Profile::from_uuid(uuid.as_str())
                            .intersects(Profile::MEDIA_SINK | Profile::MEDIA_SOURCE)
                    })
            })
        })
    }

    /// Drive the authoritative session until it dispatches, waits or ends
    async fn process_codec_switch<B: HostBus>(&mut self, path: &ObjectPath, bus: &B, now: Instant) {
        loop {
            let step = codec_switch::plan(&self.registry, path, now, &self.options);
            match step {
                codec_switch::Plan::Idle => return,
                codec_switch::Plan::Wait(deadline) => {
                    debug!("codec switch rate-limited for {}", path.as_str());
                    if let Some(device) = self.registry.devices.get_mut(path) {
                        if let Some(sw) = device.switches.first_mut() {
                            sw.timer = Some(deadline);
                        }
                    }
                    return;
                }
                codec_switch::Plan::Sort => {
                    let Registry {
                        devices, endpoints, ..
                    } = &mut self.registry;
                    if let Some(device) = devices.get_mut(path) {
                        if let Some(sw) = device.switches.first_mut() {
                            codec_switch::sort_endpoints(sw, endpoints);
                        }
                    }
                }
                codec_switch::Plan::Advance => {
                    if let Some(device) = self.registry.devices.get_mut(path) {
                        if let Some(sw) = device.switches.first_mut() {
                            sw.advance();
                        }
                    }
                }
                codec_switch::Plan::Dispatch(dispatch) => {
                    let token = self.take_token();
                    if let Some(device) = self.registry.devices.get_mut(path) {
                        device.preferred_codec = Some(dispatch.codec);
                        device.last_daemon_action = now;
                        if let Some(sw) = device.switches.first_mut() {
                            sw.pending = Some(token);
                            sw.timer = None;
                        }
                    }
                    info!(
                        "codec switch: trying endpoint {} via {}",
                        dispatch.endpoint.as_str(),
                        dispatch.local_endpoint.as_str()
                    );
                    if bus
                        .set_endpoint_configuration(
                            &dispatch.endpoint,
                            &dispatch.local_endpoint,
                            &dispatch.config,
                            token,
                        )
                        .is_err()
                    {
                        error!("codec switch: configuration call failed to send");
                        if let Some(device) = self.registry.devices.get_mut(path) {
                            if let Some(sw) = device.switches.first_mut() {
                                sw.pending = None;
                                sw.advance();
                            }
                        }
                        continue;
                    }
                    return;
                }
                codec_switch::Plan::Exhausted => {
                    info!("codec switch: no usable endpoint for {}", path.as_str());
                    if let Some(device) = self.registry.devices.get_mut(path) {
                        if !device.switches.is_empty() {
                            device.switches.remove(0);
                        }
                    }
                    push_note(
                        &mut self.notes,
                        Notification::CodecSwitched {
                            path: path.clone(),
                            status: CodecSwitchStatus::NoEndpointFound,
                        },
                    );
                    self.check_profiles(path, false, bus, now).await;
                    return;
                }
            }
        }
    }

    async fn handle_configure_reply<B: HostBus>(
        &mut self,
        token: CallToken,
        accepted: bool,
        bus: &B,
        now: Instant,
    ) {
        let mut found: Option<(ObjectPath, usize)> = None;
        for (device_path, device) in &self.registry.devices {
            if let Some(position) = device
                .switches
                .iter()
                .position(|sw| sw.pending == Some(token))
            {
                found = Some((device_path.clone(), position));
                break;
            }
        }
        let Some((path, position)) = found else {
            debug!("configure reply for a finished session, dropping");
            return;
        };

        {
            let Some(device) = self.registry.devices.get_mut(&path) else {
                return;
            };
            device.last_daemon_action = now;
            if position != 0 {
                // superseded mid-flight: drain the reply, run the newest
                debug!("codec switch superseded, resuming newest session");
                device.switches.remove(position);
            }
        }
        if position != 0 {
            self.process_codec_switch(&path, bus, now).await;
            return;
        }

        if accepted {
            info!("codec switch succeeded for {}", path.as_str());
            if let Some(device) = self.registry.devices.get_mut(&path) {
                device.switches.remove(0);
            }
            push_note(
                &mut self.notes,
                Notification::CodecSwitched {
                    path: path.clone(),
                    status: CodecSwitchStatus::Success,
                },
            );
            self.check_profiles(&path, false, bus, now).await;
        } else {
            debug!("codec switch candidate rejected for {}", path.as_str());
            if let Some(device) = self.registry.devices.get_mut(&path) {
                if let Some(sw) = device.switches.first_mut() {
                    sw.pending = None;
                    if sw.retries > 0 {
                        sw.retries -= 1;
                    } else {
                        sw.advance();
                    }
                }
            }
            self.process_codec_switch(&path, bus, now).await;
        }
    }

    // ------------------------------------------------------------------
    // Local endpoint callbacks
    // ------------------------------------------------------------------

    fn handle_select_configuration<B: HostBus>(
        &mut self,
        endpoint: &ObjectPath,
        capabilities: &[u8],
        reply: CallToken,
        bus: &B,
    ) {
        let Some((codec, _)) = media::endpoint_info(endpoint) else {
            warn!("select-configuration for unknown endpoint {}", endpoint.as_str());
            bus.reply_select_configuration(reply, Err(crate::bus::BusError::Rejected))
                .ok();
            return;
        };
        match codec.select_configuration(capabilities, &self.options.audio, &self.options.media) {
            Ok(config) => {
                bus.reply_select_configuration(reply, Ok(config.as_slice())).ok();
            }
            Err(_) => {
                info!("select-configuration: unsupported capabilities");
                bus.reply_select_configuration(reply, Err(crate::bus::BusError::Rejected))
                    .ok();
            }
        }
    }

    fn handle_select_properties<B: HostBus>(
        &mut self,
        endpoint: &ObjectPath,
        capabilities: &[u8],
        reply: CallToken,
        bus: &B,
    ) {
        let Some((codec, _)) = media::endpoint_info(endpoint) else {
            warn!("select-properties for unknown endpoint {}", endpoint.as_str());
            bus.reply_select_properties(reply, Err(crate::bus::BusError::Rejected))
                .ok();
            return;
        };
        match codec.select_configuration(capabilities, &self.options.audio, &self.options.media) {
            Ok(configuration) => {
                let qos = codec.qos(&configuration);
                let selected = SelectedProperties { configuration, qos };
                bus.reply_select_properties(reply, Ok(&selected)).ok();
            }
            Err(_) => {
                info!("select-properties: unsupported capabilities");
                bus.reply_select_properties(reply, Err(crate::bus::BusError::Rejected))
                    .ok();
            }
        }
    }

    async fn handle_set_configuration<B: HostBus>(
        &mut self,
        endpoint: &ObjectPath,
        transport_path: &ObjectPath,
        props: &PropertyBundle,
        bus: &B,
        now: Instant,
    ) {
        let Some((codec, direction)) = media::endpoint_info(endpoint) else {
            warn!("set-configuration for unknown endpoint {}", endpoint.as_str());
            return;
        };
        let profile = media::endpoint_profile(endpoint);

        let created = !self.registry.transports.contains_key(transport_path);
        if created && self.registry.ensure_transport(transport_path).is_err() {
            warn!("cannot create transport {}", transport_path.as_str());
            return;
        }
        let changes = self.registry.apply_transport_props(transport_path, props);

        let owner = {
            let Some(transport) = self.registry.transports.get_mut(transport_path) else {
                return;
            };
            transport.local_endpoint = Some(endpoint.clone());
            if transport.profile.is_empty() {
                transport.profile = profile;
            }
            transport.device.clone()
        };

        let Some(device_path) = owner else {
            warn!(
                "set-configuration without a device, dropping transport {}",
                transport_path.as_str()
            );
            self.registry
                .destroy_transport(transport_path, bus, &mut self.notes)
                .await;
            return;
        };

        // codecs may share one local endpoint; the codec recorded at
        // dispatch time disambiguates
        let resolved = self
            .registry
            .devices
            .get(&device_path)
            .and_then(|device| device.preferred_codec)
            .and_then(media::codec_by_id)
            .filter(|preferred| media::endpoint_path(*preferred, direction) == *endpoint)
            .unwrap_or(codec);
        {
            let Some(transport) = self.registry.transports.get_mut(transport_path) else {
                return;
            };
            if transport.codec_id.is_none() {
                transport.codec_id = Some(resolved.id());
            }
            transport.channels = resolved.configured_channels(&transport.configuration);
        }

        if created {
            push_note(
                &mut self.notes,
                Notification::TransportAdded(transport_path.clone()),
            );
        }
        self.transport_follow_up(transport_path, changes);
        self.device_connect_profile(&device_path, profile, bus, now).await;
    }

    fn transport_follow_up(&mut self, path: &ObjectPath, changes: TransportChanges) {
        if let Some(state) = changes.state {
            push_note(
                &mut self.notes,
                Notification::TransportStateChanged {
                    path: path.clone(),
                    state,
                },
            );
        }
        if let Some((channel, volume)) = changes.volume {
            let enabled = self.transport_volume_enabled(path);
            if enabled {
                if let Some(device_path) = self
                    .registry
                    .transports
                    .get(path)
                    .and_then(|t| t.device.clone())
                {
                    if let Some(device) = self.registry.devices.get_mut(&device_path) {
                        device.volume_active[channel as usize] = true;
                    }
                }
                push_note(
                    &mut self.notes,
                    Notification::TransportVolumeChanged {
                        path: path.clone(),
                        channel,
                        volume,
                    },
                );
            }
        }
    }

    fn transport_volume_enabled(&self, path: &ObjectPath) -> bool {
        let Some(transport) = self.registry.transports.get(path) else {
            return false;
        };
        transport
            .device
            .as_ref()
            .and_then(|device_path| self.registry.devices.get(device_path))
            .is_some_and(|device| device.hw_volume_profiles.intersects(transport.profile))
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Handle one API request
    pub(crate) async fn handle_request<B: HostBus>(
        &mut self,
        request: Request,
        bus: &B,
        now: Instant,
    ) -> Response {
        match request {
            Request::GetDevices => {
                let mut devices: heapless::Vec<DeviceInfo, MAX_DEVICES> = heapless::Vec::new();
                for device in self.registry.devices.values() {
                    devices
                        .push(DeviceInfo {
                            path: device.path.clone(),
                            address: device.address,
                            name: device.name.clone(),
                            alias: device.alias.clone(),
                            connected: device.connected,
                            profiles: device.profiles,
                            connected_profiles: device.connected_profiles,
                            battery: device.battery,
                        })
                        .ok();
                }
                Response::Devices(devices)
            }
            Request::EnsureMediaCodec { device, codec } => {
                match self.ensure_media_codec(&device, codec, bus, now).await {
                    Ok(()) => Response::Accepted,
                    Err(e) => Response::Error(e),
                }
            }
            Request::AcquireTransport {
                transport,
                optional,
            } => match self.acquire_transport(&transport, optional, bus).await {
                Ok(stream) => Response::Stream(stream),
                Err(e) => Response::Error(e),
            },
            Request::ReleaseTransport { transport } => {
                match self.release_transport(&transport, bus, now).await {
                    Ok(()) => Response::Done,
                    Err(e) => Response::Error(e),
                }
            }
            Request::SetTransportKeepalive {
                transport,
                keepalive,
            } => match self.set_transport_keepalive(&transport, keepalive, bus, now).await {
                Ok(()) => Response::Done,
                Err(e) => Response::Error(e),
            },
            Request::SetTransportVolume {
                transport,
                channel,
                volume,
            } => match self.set_transport_volume(&transport, channel, volume, bus) {
                Ok(()) => Response::Done,
                Err(e) => Response::Error(e),
            },
        }
    }

    async fn acquire_transport<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        optional: bool,
        bus: &B,
    ) -> Result<StreamHandle, MonitorError> {
        // a transport whose device has lost its adapter cannot be acquired
        let adapter_ok = self
            .registry
            .transports
            .get(path)
            .ok_or(MonitorError::TransportNotFound)?
            .device
            .as_ref()
            .and_then(|device_path| self.registry.devices.get(device_path))
            .is_some_and(|device| device.adapter.is_some());
        if !adapter_ok {
            warn!("acquire on transport {} without adapter", path.as_str());
            return Err(MonitorError::InvalidState);
        }

        let linked = self.registry.linked_stream(path);
        let step = {
            let Some(transport) = self.registry.transports.get_mut(path) else {
                return Err(MonitorError::TransportNotFound);
            };
            transport.begin_acquire(linked)
        };
        match step {
            AcquireStep::Held(stream) => Ok(stream),
            AcquireStep::Linked(stream) => {
                debug!("transport {} reusing linked stream", path.as_str());
                Ok(stream)
            }
            AcquireStep::Wire => match bus.acquire_transport(path, optional).await {
                Ok(stream) => {
                    if let Some(transport) = self.registry.transports.get_mut(path) {
                        transport.complete_acquire(stream);
                    }
                    Ok(stream)
                }
                Err(e) => {
                    if optional && e == crate::bus::BusError::NotAvailable {
                        info!("optional acquire of unavailable transport {}", path.as_str());
                    } else {
                        error!("failed to acquire transport {}", path.as_str());
                    }
                    Err(MonitorError::BusFailure)
                }
            },
        }
    }

    async fn release_transport<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        bus: &B,
        now: Instant,
    ) -> Result<(), MonitorError> {
        let step = {
            let Some(transport) = self.registry.transports.get_mut(path) else {
                return Err(MonitorError::TransportNotFound);
            };
            transport.begin_release(now)
        };
        match step {
            ReleaseStep::Decref | ReleaseStep::Deferred(_) => Ok(()),
            ReleaseStep::NotAcquired => {
                info!("transport {} already released", path.as_str());
                Ok(())
            }
            ReleaseStep::Keepalive => {
                debug!("transport {} kept alive on release", path.as_str());
                Ok(())
            }
            ReleaseStep::Wire => {
                self.registry.release_transport_now(path, bus).await;
                Ok(())
            }
        }
    }

    async fn set_transport_keepalive<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        keepalive: bool,
        bus: &B,
        now: Instant,
    ) -> Result<(), MonitorError> {
        let release_now = {
            let Some(transport) = self.registry.transports.get_mut(path) else {
                return Err(MonitorError::TransportNotFound);
            };
            transport.keepalive = keepalive;
            !keepalive && transport.acquired && transport.acquire_refcount == 0
        };
        if release_now {
            // the keepalive hold ends through the regular release path, so
            // SCO transports still get their grace window
            if let Some(transport) = self.registry.transports.get_mut(path) {
                transport.acquire_refcount = 1;
            }
            return self.release_transport(path, bus, now).await;
        }
        Ok(())
    }

    fn set_transport_volume<B: HostBus>(
        &mut self,
        path: &ObjectPath,
        channel: VolumeChannel,
        volume: u16,
        bus: &B,
    ) -> Result<(), MonitorError> {
        let enabled = self.transport_volume_enabled(path);
        let Some(transport) = self.registry.transports.get_mut(path) else {
            return Err(MonitorError::TransportNotFound);
        };
        let record = &mut transport.volumes[channel as usize];
        let volume = volume.min(record.hw_volume_max);
        record.hw_volume = volume;
        if enabled {
            bus.set_transport_volume(path, volume).ok();
        }
        Ok(())
    }
}
