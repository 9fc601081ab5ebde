//! Media transport entities and acquisition bookkeeping
//!
//! A transport is one negotiated, potentially hardware-backed stream
//! endpoint. The kernel resource behind it is acquired at most once and
//! shared through a reference count; telephony (SCO) transports defer the
//! real release for a grace window because reopening the socket is
//! expensive, and transports marked keepalive hold the resource until the
//! flag is cleared. Linked LE audio transports of one device share a single
//! stream handle, so only the first acquire and the last release touch the
//! wire.
//!
//! The methods here are the pure half of the state machine; the monitor
//! performs the wire calls and the cross-transport scans.

use embassy_time::Instant;

use crate::bus::StreamHandle;
use crate::constants::{
    HW_VOLUME_MAX, MAX_CAPS_SIZE, MAX_LINKED_TRANSPORTS, SCO_RELEASE_TIMEOUT,
};
use crate::media::CodecId;
use crate::path::ObjectPath;
use crate::profile::Profile;

/// Daemon-side stream state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportState {
    /// Not streaming
    #[default]
    Idle,
    /// Stream setup in progress
    Pending,
    /// Stream active
    Active,
}

/// Stream direction a volume record applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VolumeChannel {
    /// Audio received from the peer
    Rx = 0,
    /// Audio sent to the peer
    Tx = 1,
}

/// Hardware volume record for one stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportVolume {
    /// Current hardware volume step
    pub hw_volume: u16,
    /// Highest hardware volume step the profile allows
    pub hw_volume_max: u16,
    /// Whether the peer actually drives this volume
    pub active: bool,
}

impl Default for TransportVolume {
    fn default() -> Self {
        Self {
            hw_volume: HW_VOLUME_MAX,
            hw_volume_max: HW_VOLUME_MAX,
            active: false,
        }
    }
}

/// Next step of a local acquire decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireStep {
    /// Already held; the refcount was bumped and `stream` is valid
    Held(StreamHandle),
    /// Reused a linked sibling's stream without wire traffic
    Linked(StreamHandle),
    /// The real acquire call must be issued
    Wire,
}

/// Next step of a local release decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseStep {
    /// Other holders remain; nothing to do
    Decref,
    /// Transport was not acquired; warn and ignore
    NotAcquired,
    /// SCO grace window armed; the resource stays open for now
    Deferred(Instant),
    /// Keepalive holds the resource open indefinitely
    Keepalive,
    /// The real release must be issued now
    Wire,
}

/// One negotiated media transport
#[derive(Debug, Clone)]
pub struct Transport {
    /// Daemon-assigned path
    pub path: ObjectPath,
    /// Owning device, if still alive
    pub device: Option<ObjectPath>,
    /// Profile this transport belongs to
    pub profile: Profile,
    /// Negotiated codec
    pub codec_id: Option<CodecId>,
    /// Raw configuration blob
    pub configuration: heapless::Vec<u8, MAX_CAPS_SIZE>,
    /// Channel count of the negotiated stream
    pub channels: u8,
    /// Daemon-side stream state
    pub state: TransportState,
    /// Local endpoint that produced this transport
    pub local_endpoint: Option<ObjectPath>,
    /// Whether the kernel resource is currently open
    pub acquired: bool,
    /// Balanced acquire/release count
    pub acquire_refcount: u8,
    /// Hold the resource open until explicitly cleared
    pub keepalive: bool,
    /// The open stream resource
    pub stream: Option<StreamHandle>,
    /// Deferred-release deadline for SCO transports
    pub release_timer: Option<Instant>,
    /// Presentation delay in 1/10 ms units, when reported
    pub delay: Option<u16>,
    /// Per-direction hardware volume records
    pub volumes: [TransportVolume; 2],
    /// Transports sharing this transport's physical stream group
    pub links: heapless::Vec<ObjectPath, MAX_LINKED_TRANSPORTS>,
}

impl Transport {
    /// Create a transport shell for `path`; properties arrive separately
    #[must_use]
    pub fn new(path: ObjectPath) -> Self {
        Self {
            path,
            device: None,
            profile: Profile::NONE,
            codec_id: None,
            configuration: heapless::Vec::new(),
            channels: 0,
            state: TransportState::Idle,
            local_endpoint: None,
            acquired: false,
            acquire_refcount: 0,
            keepalive: false,
            stream: None,
            release_timer: None,
            delay: None,
            volumes: [TransportVolume::default(); 2],
            links: heapless::Vec::new(),
        }
    }

    /// Whether this transport runs over a synchronous telephony link
    #[must_use]
    pub fn is_sco(&self) -> bool {
        self.profile
            .intersects(Profile::HEADSET_HEAD_UNIT | Profile::HEADSET_AUDIO_GATEWAY)
    }

    /// Volume record direction the daemon's `Volume` property addresses
    #[must_use]
    pub fn volume_channel(&self) -> Option<VolumeChannel> {
        if self.profile.intersects(Profile::MEDIA_SINK) {
            Some(VolumeChannel::Tx)
        } else if self.profile.intersects(Profile::MEDIA_SOURCE) {
            Some(VolumeChannel::Rx)
        } else {
            None
        }
    }

    /// Decide how to satisfy an acquire request.
    ///
    /// `linked` carries the stream of an already-acquired linked sibling on
    /// the same device, if any. Updates the refcount for the non-wire
    /// outcomes; a `Wire` outcome leaves the transport unacquired until
    /// [`Transport::complete_acquire`].
    pub(crate) fn begin_acquire(&mut self, linked: Option<StreamHandle>) -> AcquireStep {
        if self.acquire_refcount > 0 {
            self.acquire_refcount += 1;
            if let Some(stream) = self.stream {
                return AcquireStep::Held(stream);
            }
        }
        if self.acquired {
            // re-acquire inside the deferred-release grace window
            self.acquire_refcount = 1;
            self.release_timer = None;
            if let Some(stream) = self.stream {
                return AcquireStep::Held(stream);
            }
        }
        if let Some(stream) = linked {
            self.stream = Some(stream);
            self.acquired = true;
            self.acquire_refcount = 1;
            return AcquireStep::Linked(stream);
        }
        AcquireStep::Wire
    }

    /// Record a successful wire acquire
    pub(crate) fn complete_acquire(&mut self, stream: StreamHandle) {
        self.stream = Some(stream);
        self.acquired = true;
        self.acquire_refcount = 1;
    }

    /// Decide how to satisfy a release request
    pub(crate) fn begin_release(&mut self, now: Instant) -> ReleaseStep {
        if self.acquire_refcount > 1 {
            self.acquire_refcount -= 1;
            return ReleaseStep::Decref;
        }
        if self.acquire_refcount == 0 || !self.acquired {
            return ReleaseStep::NotAcquired;
        }
        self.acquire_refcount = 0;
        if self.is_sco() {
            let deadline = now + SCO_RELEASE_TIMEOUT;
            self.release_timer = Some(deadline);
            return ReleaseStep::Deferred(deadline);
        }
        if self.keepalive {
            return ReleaseStep::Keepalive;
        }
        ReleaseStep::Wire
    }

    /// Whether an expired release timer should tear the resource down
    pub(crate) fn release_timer_due(&self, now: Instant) -> bool {
        match self.release_timer {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Drop all acquisition state after the wire release completed
    pub(crate) fn reset_acquisition(&mut self) {
        self.acquire_refcount = 0;
        self.acquired = false;
        self.stream = None;
        self.release_timer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::Duration;

    fn media_transport() -> Transport {
        let mut t = Transport::new(ObjectPath::new("/org/bluez/hci0/dev_11/fd0").unwrap());
        t.profile = Profile::A2DP_SINK;
        t
    }

    fn sco_transport() -> Transport {
        let mut t = Transport::new(ObjectPath::new("/org/bluez/hci0/dev_11/sco").unwrap());
        t.profile = Profile::HFP_HF;
        t
    }

    fn stream() -> StreamHandle {
        StreamHandle {
            fd: 9,
            read_mtu: 672,
            write_mtu: 672,
        }
    }

    #[test]
    fn test_acquire_is_refcounted() {
        let mut t = media_transport();
        let now = Instant::from_ticks(0);

        assert_eq!(t.begin_acquire(None), AcquireStep::Wire);
        t.complete_acquire(stream());
        assert_eq!(t.acquire_refcount, 1);

        // second acquire stays local
        assert_eq!(t.begin_acquire(None), AcquireStep::Held(stream()));
        assert_eq!(t.acquire_refcount, 2);

        // balanced releases: only the last one reaches the wire
        assert_eq!(t.begin_release(now), ReleaseStep::Decref);
        assert_eq!(t.begin_release(now), ReleaseStep::Wire);
        t.reset_acquisition();
        assert!(!t.acquired);
        assert_eq!(t.begin_release(now), ReleaseStep::NotAcquired);
    }

    #[test]
    fn test_keepalive_blocks_release() {
        let mut t = media_transport();
        t.keepalive = true;
        let now = Instant::from_ticks(0);

        assert_eq!(t.begin_acquire(None), AcquireStep::Wire);
        t.complete_acquire(stream());
        assert_eq!(t.begin_release(now), ReleaseStep::Keepalive);
        assert!(t.acquired);
        assert_eq!(t.acquire_refcount, 0);

        // the resource is reused without wire traffic afterwards
        assert_eq!(t.begin_acquire(None), AcquireStep::Held(stream()));
    }

    #[test]
    fn test_sco_release_is_deferred() {
        let mut t = sco_transport();
        let now = Instant::from_ticks(0);
        assert!(t.is_sco());

        assert_eq!(t.begin_acquire(None), AcquireStep::Wire);
        t.complete_acquire(stream());
        let deadline = match t.begin_release(now) {
            ReleaseStep::Deferred(deadline) => deadline,
            other => panic!("expected deferred release, got {other:?}"),
        };
        assert_eq!(deadline, now + SCO_RELEASE_TIMEOUT);
        assert!(t.acquired);

        assert!(!t.release_timer_due(now));
        assert!(!t.release_timer_due(now + Duration::from_millis(999)));
        assert!(t.release_timer_due(deadline));
    }

    #[test]
    fn test_reacquire_cancels_deferred_release() {
        let mut t = sco_transport();
        let now = Instant::from_ticks(0);

        t.begin_acquire(None);
        t.complete_acquire(stream());
        t.begin_release(now);
        assert!(t.release_timer.is_some());

        assert_eq!(t.begin_acquire(None), AcquireStep::Held(stream()));
        assert!(t.release_timer.is_none());
        assert_eq!(t.acquire_refcount, 1);
    }

    #[test]
    fn test_linked_acquire_reuses_stream() {
        let mut t = media_transport();
        assert_eq!(t.begin_acquire(Some(stream())), AcquireStep::Linked(stream()));
        assert!(t.acquired);
        assert_eq!(t.stream, Some(stream()));
    }

    #[test]
    fn test_volume_channel_by_profile() {
        assert_eq!(
            media_transport().volume_channel(),
            Some(VolumeChannel::Tx)
        );
        let mut source = media_transport();
        source.profile = Profile::A2DP_SOURCE;
        assert_eq!(source.volume_channel(), Some(VolumeChannel::Rx));
        assert_eq!(sco_transport().volume_channel(), None);
    }
}
