//! Telephony backend arbitration
//!
//! Telephony signaling (HSP/HFP) can be served by one of several mutually
//! exclusive backends: the daemon-native profile implementation, oFono, or
//! hsphfpd. Exactly one may hold the profile registrations at a time. The
//! arbiter re-runs on every availability change: it unregisters the current
//! backend, picks a candidate per policy, and attempts registration,
//! falling back to none (non-fatal) when that fails.

use crate::MonitorError;
use crate::bus::HostBus;

/// The mutually exclusive telephony backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BackendKind {
    /// The daemon's own HSP/HFP profile implementation
    Native,
    /// The oFono telephony daemon
    Ofono,
    /// The hsphfpd daemon
    Hsphfpd,
}

impl BackendKind {
    const ALL: [BackendKind; 3] = [BackendKind::Native, BackendKind::Ofono, BackendKind::Hsphfpd];

    fn index(self) -> usize {
        match self {
            BackendKind::Native => 0,
            BackendKind::Ofono => 1,
            BackendKind::Hsphfpd => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            BackendKind::Native => "native",
            BackendKind::Ofono => "ofono",
            BackendKind::Hsphfpd => "hsphfpd",
        }
    }
}

/// Which backend the arbiter should prefer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BackendSelection {
    /// Telephony disabled; keep every backend unregistered
    None,
    /// First available backend wins
    Any,
    /// Exactly this backend, or nothing
    Specific(BackendKind),
    /// The daemon-native backend (the default)
    #[default]
    Native,
}

impl BackendSelection {
    fn target(self) -> Option<BackendKind> {
        match self {
            BackendSelection::None | BackendSelection::Any => None,
            BackendSelection::Specific(kind) => Some(kind),
            BackendSelection::Native => Some(BackendKind::Native),
        }
    }
}

/// Arbitration state over the telephony backends
#[derive(Debug)]
pub(crate) struct Backends {
    available: [bool; 3],
    current: Option<BackendKind>,
    selection: BackendSelection,
}

impl Backends {
    pub(crate) fn new(selection: BackendSelection) -> Self {
        Self {
            available: [false; 3],
            current: None,
            selection,
        }
    }

    /// The backend currently holding the profile registrations
    pub(crate) fn current(&self) -> Option<BackendKind> {
        self.current
    }

    /// Record an availability change; returns whether anything changed
    pub(crate) fn set_available(&mut self, kind: BackendKind, available: bool) -> bool {
        let slot = &mut self.available[kind.index()];
        if *slot == available {
            return false;
        }
        *slot = available;
        true
    }

    pub(crate) fn is_available(&self, kind: BackendKind) -> bool {
        self.available[kind.index()]
    }

    async fn unregister_current<B: HostBus>(&mut self, bus: &B) {
        if let Some(current) = self.current.take() {
            bus.unregister_telephony_profiles(current).await.ok();
        }
    }

    async fn try_switch<B: HostBus>(&mut self, bus: &B, kind: BackendKind) -> Result<(), MonitorError> {
        if !self.available[kind.index()] {
            return Err(MonitorError::NotSupported);
        }
        if self.current == Some(kind) {
            return Ok(());
        }
        for other in BackendKind::ALL {
            if other != kind && self.available[other.index()] {
                warn!(
                    "{} running, but not the selected telephony backend; it may interfere",
                    other.name()
                );
            }
        }
        self.unregister_current(bus).await;
        if bus.register_telephony_profiles(kind).await.is_err() {
            return Err(MonitorError::BusFailure);
        }
        info!("switched to telephony backend {}", kind.name());
        self.current = Some(kind);
        Ok(())
    }

    /// Re-run backend selection after an availability change
    pub(crate) async fn reselect<B: HostBus>(&mut self, bus: &B, silent: bool) {
        match self.selection {
            BackendSelection::None => {
                self.unregister_current(bus).await;
            }
            BackendSelection::Any => {
                for kind in BackendKind::ALL {
                    if self.try_switch(bus, kind).await.is_ok() {
                        return;
                    }
                }
                self.unregister_current(bus).await;
                if !silent {
                    error!("no telephony backend could be started");
                }
            }
            BackendSelection::Specific(_) | BackendSelection::Native => {
                let target = self.selection.target();
                if let Some(kind) = target {
                    if self.try_switch(bus, kind).await.is_ok() {
                        return;
                    }
                }
                self.unregister_current(bus).await;
                if !silent {
                    error!("failed to start the selected telephony backend");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{BusCall, MockBus};
    use embassy_futures::block_on;

    #[test]
    fn test_any_selects_first_available() {
        let bus = MockBus::new();
        let mut backends = Backends::new(BackendSelection::Any);
        backends.set_available(BackendKind::Ofono, true);
        block_on(backends.reselect(&bus, false));
        assert_eq!(backends.current(), Some(BackendKind::Ofono));
        assert_eq!(
            bus.count(|c| matches!(
                c,
                BusCall::RegisterTelephonyProfiles {
                    backend: BackendKind::Ofono
                }
            )),
            1
        );
    }

    #[test]
    fn test_specific_ignores_other_backends() {
        let bus = MockBus::new();
        let mut backends = Backends::new(BackendSelection::Specific(BackendKind::Hsphfpd));
        backends.set_available(BackendKind::Native, true);
        block_on(backends.reselect(&bus, true));
        assert_eq!(backends.current(), None);

        backends.set_available(BackendKind::Hsphfpd, true);
        block_on(backends.reselect(&bus, false));
        assert_eq!(backends.current(), Some(BackendKind::Hsphfpd));
    }

    #[test]
    fn test_registration_failure_falls_back_to_none() {
        let bus = MockBus::new();
        bus.fail_telephony.set(Some(BackendKind::Native));
        let mut backends = Backends::new(BackendSelection::Native);
        backends.set_available(BackendKind::Native, true);
        block_on(backends.reselect(&bus, false));
        assert_eq!(backends.current(), None);
    }

    #[test]
    fn test_availability_loss_switches_backend() {
        let bus = MockBus::new();
        let mut backends = Backends::new(BackendSelection::Any);
        backends.set_available(BackendKind::Native, true);
        block_on(backends.reselect(&bus, false));
        assert_eq!(backends.current(), Some(BackendKind::Native));

        // native goes away, ofono is up: the arbiter unregisters the old
        // backend and registers the new one
        backends.set_available(BackendKind::Native, false);
        backends.set_available(BackendKind::Ofono, true);
        block_on(backends.reselect(&bus, false));
        assert_eq!(backends.current(), Some(BackendKind::Ofono));
        assert_eq!(
            bus.count(|c| matches!(
                c,
                BusCall::UnregisterTelephonyProfiles {
                    backend: BackendKind::Native
                }
            )),
            1
        );
    }

    #[test]
    fn test_none_selection_unregisters() {
        let bus = MockBus::new();
        let mut backends = Backends::new(BackendSelection::Any);
        backends.set_available(BackendKind::Native, true);
        block_on(backends.reselect(&bus, false));
        assert_eq!(backends.current(), Some(BackendKind::Native));

        backends.selection = BackendSelection::None;
        block_on(backends.reselect(&bus, false));
        assert_eq!(backends.current(), None);
    }

    #[test]
    fn test_set_available_reports_changes() {
        let mut backends = Backends::new(BackendSelection::Any);
        assert!(backends.set_available(BackendKind::Ofono, true));
        assert!(!backends.set_available(BackendKind::Ofono, true));
        assert!(backends.is_available(BackendKind::Ofono));
    }
}
