// Per-node visibility bookkeeping and the dwell-time state machine.
// Pure: no timers or observers here, the detector turns transitions into effects.

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Lifecycle of a single binding's detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorPhase {
    /// Torn down (or never bound). Inert.
    Unbound,
    /// Observing, no intersection report yet.
    Watching,
    /// Intersecting; dwell timer running.
    Pending,
    /// Observed and currently off screen.
    NotIntersecting,
    /// `on_visible` has run. Inert for the rest of the binding.
    Fired,
}

/// Whether the node is on screen and since when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VisibilityState {
    pub is_intersecting: bool,
    pub became_visible_at: Option<Timestamp>,
}

/// Effect the detector must apply after feeding the ledger an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Nothing,
    /// Start the dwell timer; it is due at the given time.
    StartTimer { due: Timestamp },
    /// Node left before the threshold; drop the running timer.
    CancelTimer,
    /// Zero threshold: fire right away, no timer.
    FireNow,
}

/// Visibility bookkeeping for one tracked node.
#[derive(Debug, Clone)]
pub struct VisibilityLedger {
    visible_after_ms: u64,
    phase: DetectorPhase,
    state: VisibilityState,
}

impl VisibilityLedger {
    pub fn new(visible_after_ms: u64) -> Self {
        VisibilityLedger {
            visible_after_ms,
            phase: DetectorPhase::Watching,
            state: VisibilityState::default(),
        }
    }

    pub fn phase(&self) -> DetectorPhase {
        self.phase
    }

    pub fn state(&self) -> VisibilityState {
        self.state
    }

    pub fn visible_after_ms(&self) -> u64 {
        self.visible_after_ms
    }

    /// Continuous on-screen time so far, if the node is intersecting.
    pub fn visible_for(&self, now: Timestamp) -> Option<u64> {
        self.state.became_visible_at.map(|since| now.since(since))
    }

    /// Feed one intersection report.
    pub fn observe(&mut self, intersecting: bool, now: Timestamp) -> Transition {
        if matches!(self.phase, DetectorPhase::Fired | DetectorPhase::Unbound) {
            return Transition::Nothing;
        }

        match (intersecting, self.state.is_intersecting) {
            (true, false) => {
                self.state = VisibilityState {
                    is_intersecting: true,
                    became_visible_at: Some(now),
                };
                if self.visible_after_ms == 0 {
                    self.phase = DetectorPhase::Fired;
                    Transition::FireNow
                } else {
                    self.phase = DetectorPhase::Pending;
                    Transition::StartTimer {
                        due: now.after(self.visible_after_ms),
                    }
                }
            }
            (false, true) => {
                self.state = VisibilityState::default();
                self.phase = DetectorPhase::NotIntersecting;
                Transition::CancelTimer
            }
            (false, false) => {
                self.phase = DetectorPhase::NotIntersecting;
                Transition::Nothing
            }
            // Repeated "still intersecting" reports never restart the dwell timer.
            (true, true) => Transition::Nothing,
        }
    }

    /// Dwell timer elapsed. Returns true when the binding should fire now.
    pub fn timer_elapsed(&mut self, now: Timestamp) -> bool {
        if self.phase != DetectorPhase::Pending {
            return false;
        }
        match self.visible_for(now) {
            Some(elapsed) if elapsed >= self.visible_after_ms => {
                self.phase = DetectorPhase::Fired;
                true
            }
            _ => false,
        }
    }

    pub fn unbind(&mut self) {
        self.phase = DetectorPhase::Unbound;
        self.state = VisibilityState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn entering_starts_timer_and_records_time() {
        let mut ledger = VisibilityLedger::new(500);
        assert_eq!(ledger.phase(), DetectorPhase::Watching);
        assert_eq!(
            ledger.observe(true, at(100)),
            Transition::StartTimer { due: at(600) }
        );
        assert_eq!(ledger.state().became_visible_at, Some(at(100)));
        assert_eq!(ledger.visible_for(at(350)), Some(250));
    }

    #[test]
    fn leaving_early_clears_state() {
        let mut ledger = VisibilityLedger::new(500);
        ledger.observe(true, at(0));
        assert_eq!(ledger.observe(false, at(400)), Transition::CancelTimer);
        assert_eq!(ledger.state(), VisibilityState::default());
        assert_eq!(ledger.phase(), DetectorPhase::NotIntersecting);
        assert!(!ledger.timer_elapsed(at(500)));
    }

    #[test]
    fn repeated_intersecting_reports_do_not_restart() {
        let mut ledger = VisibilityLedger::new(500);
        ledger.observe(true, at(0));
        assert_eq!(ledger.observe(true, at(300)), Transition::Nothing);
        assert!(ledger.timer_elapsed(at(500)));
        assert_eq!(ledger.phase(), DetectorPhase::Fired);
    }

    #[test]
    fn zero_threshold_fires_without_timer() {
        let mut ledger = VisibilityLedger::new(0);
        assert_eq!(ledger.observe(true, at(10)), Transition::FireNow);
        assert_eq!(ledger.observe(false, at(20)), Transition::Nothing);
        assert_eq!(ledger.observe(true, at(30)), Transition::Nothing);
    }

    #[test]
    fn unbound_ledger_ignores_everything() {
        let mut ledger = VisibilityLedger::new(100);
        ledger.observe(true, at(0));
        ledger.unbind();
        assert_eq!(ledger.observe(true, at(10)), Transition::Nothing);
        assert!(!ledger.timer_elapsed(at(1_000)));
    }
}
