//! Codec negotiation engine
//!
//! A codec switch walks the cartesian product of candidate codecs (outer
//! cursor, in preference order) and remote endpoint paths (inner cursor,
//! sorted per codec) and offers one configuration at a time to the daemon.
//! Outbound calls are rate limited per device, every candidate has a small
//! retry budget, and a newer request supersedes a running one without
//! cancelling its in-flight call: the stale reply is detected by its token
//! and drained, then the authoritative session resumes.
//!
//! [`plan`] is the pure step function: it inspects the registry and returns
//! what the engine should do next. The monitor applies the returned action
//! and owns the wire traffic.

use core::cmp::Ordering;

use embassy_time::Instant;

use crate::MonitorOptions;
use crate::bus::CallToken;
use crate::constants::{
    CODEC_SWITCH_RETRIES, DAEMON_ACTION_RATE, MAX_CODECS, MAX_DEVICE_ENDPOINTS, MAX_ENDPOINTS,
};
use crate::media::{self, CodecId, ConfigBlob, Direction};
use crate::path::ObjectPath;
use crate::profile::Profile;
use crate::registry::{Registry, RemoteEndpoint};

/// Completion status of a codec switch, reported upwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodecSwitchStatus {
    /// A codec/endpoint pair was accepted by the peer
    Success,
    /// Every candidate was tried and rejected
    NoEndpointFound,
}

/// One per-device negotiation session
#[derive(Debug, Clone)]
pub(crate) struct CodecSwitch {
    /// Candidate codecs in priority order (enabled codecs only)
    pub codecs: heapless::Vec<CodecId, MAX_CODECS>,
    /// Snapshot of the device's remote endpoint paths
    pub paths: heapless::Vec<ObjectPath, MAX_DEVICE_ENDPOINTS>,
    /// Outer cursor into `codecs`
    pub codec_idx: usize,
    /// Inner cursor into `paths`
    pub path_idx: usize,
    /// Retries left for the current candidate
    pub retries: u8,
    /// Device profile mask the session negotiates for
    pub profile: Profile,
    /// Token of the in-flight configuration call, if any
    pub pending: Option<CallToken>,
    /// Rate-limit deadline, if the engine is waiting
    pub timer: Option<Instant>,
    /// Whether `paths` has been preference-sorted for the current codec
    pub sorted: bool,
}

impl CodecSwitch {
    pub(crate) fn new(
        profile: Profile,
        codecs: heapless::Vec<CodecId, MAX_CODECS>,
        paths: heapless::Vec<ObjectPath, MAX_DEVICE_ENDPOINTS>,
    ) -> Self {
        Self {
            codecs,
            paths,
            codec_idx: 0,
            path_idx: 0,
            retries: CODEC_SWITCH_RETRIES,
            profile,
            pending: None,
            timer: None,
            sorted: false,
        }
    }

    /// Both cursors ran off the end without a successful dispatch
    pub(crate) fn exhausted(&self) -> bool {
        self.codec_idx >= self.codecs.len() || self.paths.is_empty()
    }

    /// Advance to the next endpoint, rolling over to the next codec, and
    /// reset the retry budget
    pub(crate) fn advance(&mut self) {
        self.path_idx += 1;
        if self.path_idx >= self.paths.len() {
            self.codec_idx += 1;
            self.path_idx = 0;
            self.sorted = false;
        }
        self.retries = CODEC_SWITCH_RETRIES;
    }
}

/// What the engine should do next for a device
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Plan {
    /// No session, or a call is already in flight
    Idle,
    /// Rate limited until the given monotonic deadline
    Wait(Instant),
    /// Sort the endpoint candidates for the current codec first
    Sort,
    /// Offer this configuration to the peer
    Dispatch(DispatchPlan),
    /// Current candidate is invalid; advance the cursors
    Advance,
    /// All candidates tried; report failure and end the session
    Exhausted,
}

/// A validated candidate ready for dispatch
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DispatchPlan {
    /// Remote endpoint to configure
    pub endpoint: ObjectPath,
    /// Local endpoint offered in the call
    pub local_endpoint: ObjectPath,
    /// Selected configuration blob
    pub config: ConfigBlob,
    /// Codec being offered
    pub codec: CodecId,
}

/// Compute the next step for the authoritative session of `device_path`.
///
/// Pure with respect to the registry; applying the action is the caller's
/// job. The rate limit compares monotonic instants, so wall-clock jumps
/// cannot produce garbage delays.
pub(crate) fn plan(
    registry: &Registry,
    device_path: &ObjectPath,
    now: Instant,
    options: &MonitorOptions,
) -> Plan {
    let Some(device) = registry.devices.get(device_path) else {
        return Plan::Idle;
    };
    let Some(sw) = device.switches.first() else {
        return Plan::Idle;
    };
    // one in-flight call per device: a superseded session still draining
    // its reply also blocks the authoritative one
    if device.switches.iter().any(|s| s.pending.is_some()) {
        return Plan::Idle;
    }
    if sw.exhausted() {
        return Plan::Exhausted;
    }

    let threshold = device.last_daemon_action + DAEMON_ACTION_RATE;
    if now < threshold {
        return Plan::Wait(threshold);
    }

    let Some(codec) = media::codec_by_id(sw.codecs[sw.codec_idx]) else {
        return Plan::Advance;
    };

    if sw.path_idx == 0 && !sw.sorted && codec.has_preference() && sw.paths.len() > 1 {
        return Plan::Sort;
    }

    let endpoint_path = &sw.paths[sw.path_idx];
    let Some(endpoint) = registry.endpoints.get(endpoint_path) else {
        return Plan::Advance;
    };
    let (Some(caps), Some(uuid), Some(endpoint_codec)) =
        (&endpoint.capabilities, &endpoint.uuid, endpoint.codec_id)
    else {
        return Plan::Advance;
    };
    if endpoint_codec != codec.id() {
        return Plan::Advance;
    }
    if !sw.profile.intersects(Profile::from_uuid(uuid.as_str())) {
        return Plan::Advance;
    }

    let direction = if sw.profile.intersects(Profile::MEDIA_SINK) {
        Direction::Source
    } else if sw.profile.intersects(Profile::MEDIA_SOURCE) {
        Direction::Sink
    } else {
        return Plan::Advance;
    };
    if !codec.supports_direction(direction) {
        return Plan::Advance;
    }

    let local_endpoint = media::endpoint_path(codec, direction);

    // Each local endpoint serves one device at a time per adapter
    for transport in registry.transports.values() {
        let Some(owner_path) = &transport.device else {
            continue;
        };
        if owner_path == device_path {
            continue;
        }
        let Some(owner) = registry.devices.get(owner_path) else {
            continue;
        };
        if owner.adapter != device.adapter {
            continue;
        }
        if transport.local_endpoint.as_ref() == Some(&local_endpoint) {
            return Plan::Advance;
        }
    }

    match codec.select_configuration(caps, &options.audio, &options.media) {
        Ok(config) => Plan::Dispatch(DispatchPlan {
            endpoint: endpoint_path.clone(),
            local_endpoint,
            config,
            codec: codec.id(),
        }),
        Err(_) => Plan::Advance,
    }
}

/// Preference-sort the session's endpoint paths for its current codec.
///
/// The comparator captures the endpoint map explicitly; endpoints without a
/// cached capability record sort last.
pub(crate) fn sort_endpoints(
    sw: &mut CodecSwitch,
    endpoints: &heapless::FnvIndexMap<ObjectPath, RemoteEndpoint, MAX_ENDPOINTS>,
) {
    if let Some(codec) = sw.codecs.get(sw.codec_idx).and_then(|id| media::codec_by_id(*id)) {
        let caps_of = |path: &ObjectPath| {
            endpoints
                .get(path)
                .and_then(|endpoint| endpoint.capabilities.as_ref())
        };
        sw.paths.sort_unstable_by(|a, b| match (caps_of(a), caps_of(b)) {
            (Some(caps_a), Some(caps_b)) => codec.compare_capabilities(caps_a, caps_b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
    }
    sw.sorted = true;
}
