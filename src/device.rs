//! Remote device entity and its connection state machine
//!
//! A device tracks two profile masks: the profiles the peer advertises and
//! the profiles currently live. The aggregate connected state is a policy
//! over the two, evaluated whenever either mask changes or the reconnection
//! timer fires. The timer runs a short window while initial profiles are
//! still connecting and a longer one once at least one profile is live, so
//! slow secondary-profile connects do not flap the aggregate state.

use embassy_time::{Duration, Instant};

use crate::address::BluetoothAddress;
use crate::codec_switch::CodecSwitch;
use crate::constants::{
    DEVICE_PROFILE_TIMEOUT, DEVICE_RECONNECT_TIMEOUT, MAX_CODEC_SWITCHES, MAX_DEVICE_ENDPOINTS,
    MAX_DEVICE_TRANSPORTS, MAX_NAME_LENGTH,
};
use crate::media::CodecId;
use crate::path::ObjectPath;
use crate::profile::Profile;

/// Reconnection phase of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReconnectState {
    /// Device just appeared; the daemon drives the initial connects
    #[default]
    Init,
    /// Waiting for the advertised profiles to come up
    Profile,
    /// Our own reconnect attempt has run; no further attempts
    Stop,
}

/// One paired or visible remote Bluetooth peer
#[derive(Debug, Clone)]
pub struct Device {
    /// Daemon-assigned path
    pub path: ObjectPath,
    /// Owning adapter (back-reference, resolved through the registry)
    pub adapter: Option<ObjectPath>,
    /// Peer address, once reported
    pub address: Option<BluetoothAddress>,
    /// Remote-provided name
    pub name: Option<heapless::String<MAX_NAME_LENGTH>>,
    /// User-set alias
    pub alias: Option<heapless::String<MAX_NAME_LENGTH>>,
    /// Icon name
    pub icon: Option<heapless::String<MAX_NAME_LENGTH>>,
    /// Bonded flag
    pub paired: bool,
    /// Trusted flag
    pub trusted: bool,
    /// Blocked flag
    pub blocked: bool,
    /// Service discovery finished
    pub services_resolved: bool,
    /// Aggregate connection state reported to consumers
    pub connected: bool,
    /// Whether consumers have been told about this device
    pub added: bool,
    /// Profiles the peer advertises
    pub profiles: Profile,
    /// Profiles currently live
    pub connected_profiles: Profile,
    /// Profiles we actively reconnect
    pub reconnect_profiles: Profile,
    /// Reconnection phase
    pub reconnect_state: ReconnectState,
    /// Monotonic time of the last negotiation-affecting daemon call
    pub last_daemon_action: Instant,
    /// Reconnection timer deadline, when armed
    pub timer: Option<Instant>,
    /// Codec recorded at dispatch time to disambiguate codecs sharing one
    /// local endpoint when the peer configures us back
    pub preferred_codec: Option<CodecId>,
    /// Profiles allowed to drive hardware volume
    pub hw_volume_profiles: Profile,
    /// Per-direction hardware-volume activation flags
    pub volume_active: [bool; 2],
    /// Battery percentage reported by the peer
    pub battery: Option<u8>,
    /// Whether a virtual battery object is currently exported
    pub battery_exported: bool,
    /// Remote endpoints advertised by the peer, in discovery order
    pub endpoints: heapless::Vec<ObjectPath, MAX_DEVICE_ENDPOINTS>,
    /// Transports negotiated with the peer
    pub transports: heapless::Vec<ObjectPath, MAX_DEVICE_TRANSPORTS>,
    /// Codec-switch sessions, newest first
    pub(crate) switches: heapless::Vec<CodecSwitch, MAX_CODEC_SWITCHES>,
}

impl Device {
    /// Create a device shell for `path`; properties arrive separately
    #[must_use]
    pub fn new(path: ObjectPath, now: Instant) -> Self {
        Self {
            path,
            adapter: None,
            address: None,
            name: None,
            alias: None,
            icon: None,
            paired: false,
            trusted: false,
            blocked: false,
            services_resolved: false,
            connected: false,
            added: false,
            profiles: Profile::NONE,
            connected_profiles: Profile::NONE,
            reconnect_profiles: Profile::NONE,
            reconnect_state: ReconnectState::Init,
            last_daemon_action: now,
            timer: None,
            preferred_codec: None,
            hw_volume_profiles: Profile::NONE,
            volume_active: [false; 2],
            battery: None,
            battery_exported: false,
            endpoints: heapless::Vec::new(),
            transports: heapless::Vec::new(),
            switches: heapless::Vec::new(),
        }
    }

    /// Profile logic only activates once the daemon has reported the
    /// address and the adapter back-reference; early property bundles may
    /// lack either.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.address.is_some() && self.adapter.is_some()
    }

    /// Whether a codec-switch session is active for this device
    #[must_use]
    pub fn codec_switch_active(&self) -> bool {
        !self.switches.is_empty()
    }

    /// Stop the reconnection timer (a no-op if it is not running)
    pub fn stop_timer(&mut self) {
        self.timer = None;
    }

    /// Window length for the next reconnection timer arm
    #[must_use]
    pub fn reconnect_timeout(&self) -> Duration {
        if self.reconnect_state == ReconnectState::Stop {
            DEVICE_PROFILE_TIMEOUT
        } else {
            DEVICE_RECONNECT_TIMEOUT
        }
    }
}

/// Outcome of evaluating the aggregate connection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProfileCheck {
    /// No profile is live and no negotiation is pending: disconnect now
    Disconnect,
    /// The policy is satisfied: report connected
    Connect,
    /// Not satisfied yet: (re)arm the reconnection timer
    Arm,
}

/// Evaluate the aggregate connection policy.
///
/// A device counts as connected if any direction mask (media sink plus
/// head-unit, media source, audio gateway) restricted to the advertised and
/// adapter-connectable profiles is fully live, if every advertised profile
/// is live, or if `force` is set. Either headset profile satisfies the
/// whole headset role of its direction.
pub(crate) fn evaluate_profiles(device: &Device, connectable: Profile, force: bool) -> ProfileCheck {
    let mut connected = device.connected_profiles;
    if connected.intersects(Profile::HEADSET_HEAD_UNIT) {
        connected |= Profile::HEADSET_HEAD_UNIT;
    }
    if connected.intersects(Profile::HEADSET_AUDIO_GATEWAY) {
        connected |= Profile::HEADSET_AUDIO_GATEWAY;
    }

    let direction_masks = [
        Profile::MEDIA_SINK | Profile::HEADSET_HEAD_UNIT,
        Profile::MEDIA_SOURCE,
        Profile::HEADSET_AUDIO_GATEWAY,
    ];
    let direction_connected = direction_masks.into_iter().any(|direction| {
        let mask = direction & device.profiles & connectable;
        !mask.is_empty() && connected.contains(mask)
    });

    let all_connected = connected.contains(device.profiles);

    if device.connected_profiles.is_empty() && device.switches.is_empty() {
        ProfileCheck::Disconnect
    } else if force || direction_connected || all_connected {
        ProfileCheck::Connect
    } else {
        ProfileCheck::Arm
    }
}

/// Profiles to actively reconnect for `path`, with sibling suppression.
///
/// A same-address device on another adapter suppresses profiles it will
/// reconnect itself, and suppresses everything once it has live profiles
/// (first connected wins). Only profiles the local adapter has a
/// counterpart for are attempted, and a satisfied headset role skips its
/// redundant sibling profile.
pub(crate) fn reconnect_mask(
    registry: &crate::registry::Registry,
    path: &ObjectPath,
) -> Profile {
    let Some(device) = registry.devices.get(path) else {
        return Profile::NONE;
    };

    let mut reconnect = device.profiles
        & device.reconnect_profiles
        & (device.connected_profiles ^ device.profiles);

    if device.address.is_some() {
        for (other_path, other) in &registry.devices {
            if other_path == path || other.address != device.address {
                continue;
            }
            if other.paired
                && other.trusted
                && !other.blocked
                && other.reconnect_state == ReconnectState::Stop
            {
                reconnect = reconnect.without(other.reconnect_profiles);
            }
            if !other.connected_profiles.is_empty() {
                reconnect = Profile::NONE;
            }
        }
    }

    if let Some(adapter_path) = &device.adapter {
        if let Some(adapter) = registry.adapters.get(adapter_path) {
            reconnect &= adapter.connectable_profiles();
        }
    }

    if !device.connected_profiles.intersects(Profile::HEADSET_HEAD_UNIT) {
        if reconnect.intersects(Profile::HFP_HF) {
            reconnect = reconnect.without(Profile::HSP_HS);
        } else if reconnect.intersects(Profile::HSP_HS) {
            reconnect = reconnect.without(Profile::HFP_HF);
        }
    } else {
        reconnect = reconnect.without(Profile::HEADSET_HEAD_UNIT);
    }

    if !device
        .connected_profiles
        .intersects(Profile::HEADSET_AUDIO_GATEWAY)
    {
        if reconnect.intersects(Profile::HFP_AG) {
            reconnect = reconnect.without(Profile::HSP_AG);
        } else if reconnect.intersects(Profile::HSP_AG) {
            reconnect = reconnect.without(Profile::HFP_AG);
        }
    } else {
        reconnect = reconnect.without(Profile::HEADSET_AUDIO_GATEWAY);
    }

    reconnect
}

/// Profile order used when issuing reconnect requests
pub(crate) const RECONNECT_ORDER: [Profile; 8] = [
    Profile::HFP_HF,
    Profile::HSP_HS,
    Profile::HFP_AG,
    Profile::HSP_AG,
    Profile::A2DP_SINK,
    Profile::A2DP_SOURCE,
    Profile::BAP_SINK,
    Profile::BAP_SOURCE,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn device(path: &str) -> Device {
        let mut d = Device::new(ObjectPath::new(path).unwrap(), Instant::from_ticks(0));
        d.address = Some(BluetoothAddress::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]));
        d.adapter = Some(ObjectPath::new("/org/bluez/hci0").unwrap());
        d
    }

    #[test]
    fn test_disconnect_when_nothing_live_and_no_session() {
        let mut d = device("/org/bluez/hci0/dev_11");
        d.profiles = Profile::A2DP_SINK | Profile::HFP_HF;
        assert_eq!(
            evaluate_profiles(&d, Profile::ALL, false),
            ProfileCheck::Disconnect
        );
    }

    #[test]
    fn test_direction_mask_satisfied_by_headset_sibling() {
        let mut d = device("/org/bluez/hci0/dev_11");
        d.profiles = Profile::A2DP_SINK | Profile::HSP_HS | Profile::HFP_HF;
        // only HFP live: the head-unit role is satisfied, but the sink
        // direction still misses A2DP
        d.connected_profiles = Profile::HFP_HF;
        assert_eq!(evaluate_profiles(&d, Profile::ALL, false), ProfileCheck::Arm);

        d.connected_profiles = Profile::HFP_HF | Profile::A2DP_SINK;
        assert_eq!(
            evaluate_profiles(&d, Profile::ALL, false),
            ProfileCheck::Connect
        );
    }

    #[test]
    fn test_all_advertised_profiles_connected() {
        let mut d = device("/org/bluez/hci0/dev_11");
        d.profiles = Profile::A2DP_SOURCE;
        d.connected_profiles = Profile::A2DP_SOURCE;
        assert_eq!(
            evaluate_profiles(&d, Profile::ALL, false),
            ProfileCheck::Connect
        );
    }

    #[test]
    fn test_force_overrides_policy() {
        let mut d = device("/org/bluez/hci0/dev_11");
        d.profiles = Profile::A2DP_SINK | Profile::HFP_HF;
        d.connected_profiles = Profile::HFP_HF;
        // connectable mask empty: no direction can be satisfied
        assert_eq!(evaluate_profiles(&d, Profile::NONE, false), ProfileCheck::Arm);
        assert_eq!(
            evaluate_profiles(&d, Profile::NONE, true),
            ProfileCheck::Connect
        );
    }

    #[test]
    fn test_pending_codec_switch_defers_disconnect() {
        let mut d = device("/org/bluez/hci0/dev_11");
        d.profiles = Profile::A2DP_SINK;
        d.switches
            .push(CodecSwitch::new(
                Profile::A2DP_SINK,
                heapless::Vec::new(),
                heapless::Vec::new(),
            ))
            .ok();
        assert_eq!(evaluate_profiles(&d, Profile::ALL, false), ProfileCheck::Arm);
    }

    #[test]
    fn test_reconnect_timeout_depends_on_state() {
        let mut d = device("/org/bluez/hci0/dev_11");
        d.reconnect_state = ReconnectState::Profile;
        assert_eq!(d.reconnect_timeout(), DEVICE_RECONNECT_TIMEOUT);
        d.reconnect_state = ReconnectState::Stop;
        assert_eq!(d.reconnect_timeout(), DEVICE_PROFILE_TIMEOUT);
    }

    fn registry_with_adapter() -> Registry {
        let mut registry = Registry::new();
        let adapter_path = ObjectPath::new("/org/bluez/hci0").unwrap();
        let mut adapter = crate::registry::Adapter::new(adapter_path.clone());
        adapter.profiles = Profile::A2DP_SOURCE | Profile::HFP_AG | Profile::HSP_AG;
        registry.adapters.insert(adapter_path, adapter).ok();
        registry
    }

    #[test]
    fn test_reconnect_mask_missing_counterpart_profiles() {
        let mut registry = registry_with_adapter();
        let mut d = device("/org/bluez/hci0/dev_11");
        d.profiles = Profile::A2DP_SINK | Profile::HFP_HF | Profile::HSP_HS;
        d.reconnect_profiles = Profile::ALL;
        let path = d.path.clone();
        registry.devices.insert(path.clone(), d).ok();

        let mask = reconnect_mask(&registry, &path);
        // the HSP sibling is skipped in favour of HFP
        assert_eq!(mask, Profile::A2DP_SINK | Profile::HFP_HF);
    }

    #[test]
    fn test_reconnect_mask_skips_connected_headset_role() {
        let mut registry = registry_with_adapter();
        let mut d = device("/org/bluez/hci0/dev_11");
        d.profiles = Profile::A2DP_SINK | Profile::HFP_HF;
        d.reconnect_profiles = Profile::ALL;
        d.connected_profiles = Profile::HFP_HF;
        let path = d.path.clone();
        registry.devices.insert(path.clone(), d).ok();

        assert_eq!(reconnect_mask(&registry, &path), Profile::A2DP_SINK);
    }

    #[test]
    fn test_reconnect_suppressed_by_sibling() {
        let mut registry = registry_with_adapter();
        let mut d = device("/org/bluez/hci0/dev_11");
        d.profiles = Profile::A2DP_SINK;
        d.reconnect_profiles = Profile::ALL;
        let path = d.path.clone();
        registry.devices.insert(path.clone(), d).ok();

        // same address on another adapter, already connected: first wins
        let mut sibling = device("/org/bluez/hci1/dev_11");
        sibling.profiles = Profile::A2DP_SINK;
        sibling.connected_profiles = Profile::A2DP_SINK;
        registry
            .devices
            .insert(sibling.path.clone(), sibling)
            .ok();

        assert_eq!(reconnect_mask(&registry, &path), Profile::NONE);
    }

    #[test]
    fn test_reconnect_subtracts_stopped_sibling_profiles() {
        let mut registry = registry_with_adapter();
        let mut d = device("/org/bluez/hci0/dev_11");
        d.profiles = Profile::A2DP_SINK | Profile::HFP_HF;
        d.reconnect_profiles = Profile::ALL;
        let path = d.path.clone();
        registry.devices.insert(path.clone(), d).ok();

        // a paired+trusted sibling that finished its own reconnect pass
        // subtracts the profiles it owns
        let mut sibling = device("/org/bluez/hci1/dev_11");
        sibling.paired = true;
        sibling.trusted = true;
        sibling.reconnect_state = ReconnectState::Stop;
        sibling.reconnect_profiles = Profile::A2DP_SINK;
        registry
            .devices
            .insert(sibling.path.clone(), sibling)
            .ok();

        assert_eq!(reconnect_mask(&registry, &path), Profile::HFP_HF);
    }

    #[test]
    fn test_three_adapter_tie_break_no_connect_storm() {
        // three same-address devices; one already connected suppresses the
        // other two completely regardless of iteration order
        let mut registry = registry_with_adapter();
        for (idx, base) in ["/org/bluez/hci0", "/org/bluez/hci1", "/org/bluez/hci2"]
            .iter()
            .enumerate()
        {
            let mut path_str: heapless::String<64> = heapless::String::new();
            path_str.push_str(base).unwrap();
            path_str.push_str("/dev_11").unwrap();
            let mut d = device(path_str.as_str());
            d.profiles = Profile::A2DP_SINK;
            d.reconnect_profiles = Profile::ALL;
            if idx == 1 {
                d.connected_profiles = Profile::A2DP_SINK;
            }
            registry.devices.insert(d.path.clone(), d).ok();
        }
        for base in ["/org/bluez/hci0", "/org/bluez/hci2"] {
            let mut path_str: heapless::String<64> = heapless::String::new();
            path_str.push_str(base).unwrap();
            path_str.push_str("/dev_11").unwrap();
            let path = ObjectPath::new(path_str.as_str()).unwrap();
            assert_eq!(reconnect_mask(&registry, &path), Profile::NONE);
        }
    }
}
