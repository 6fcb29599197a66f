//! Decides what the UI should show from listener presence and registry size.
//!
//! State-driven transitions are debounced: a transition is scheduled with a deadline and only
//! published when the deadline passes without a contradicting observation. The coordinating
//! task sleeps until [`LifecycleCoordinator::deadline`] and then calls
//! [`LifecycleCoordinator::poll`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::events::Screen;

/// Host application lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEvent {
    Backgrounded,
    Foregrounded,
    ScreenUnmounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppDirective {
    Stop,
    Reevaluate,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    screen: Screen,
    due: Instant,
    reason: &'static str,
}

/// What the core must do right away after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Directive {
    pub teardown_sessions: bool,
}

#[derive(Debug)]
pub struct LifecycleCoordinator {
    debounce: Duration,
    shown: Screen,
    pending: Option<Pending>,
}

impl LifecycleCoordinator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            shown: Screen::Setup,
            pending: None,
        }
    }

    /// Screen most recently published.
    pub fn screen(&self) -> Screen {
        self.shown
    }

    pub fn pending_screen(&self) -> Option<Screen> {
        self.pending.map(|p| p.screen)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.due)
    }

    pub fn observe(&mut self, server_present: bool, sessions: usize, now: Instant) -> Directive {
        let (target, reason) = match (server_present, sessions) {
            (false, _) => (Screen::Setup, "server stopped unexpectedly"),
            (true, 0) => (Screen::Waiting, "waiting for a device"),
            (true, _) => (Screen::Control, "device connected"),
        };
        self.schedule(target, reason, now);
        Directive {
            // Sessions cannot outlive the listener that accepted them.
            teardown_sessions: !server_present && sessions > 0,
        }
    }

    fn schedule(&mut self, target: Screen, reason: &'static str, now: Instant) {
        if let Some(pending) = self.pending {
            if pending.screen == target {
                return;
            }
            crate::logging::info_kv(
                "navigation cancelled",
                &[("screen", pending.screen.as_str()), ("by", target.as_str())],
            );
            self.pending = None;
        }
        if target == self.shown {
            return;
        }
        self.pending = Some(Pending {
            screen: target,
            due: now + self.debounce,
            reason,
        });
    }

    /// Publish the pending transition once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<(Screen, &'static str)> {
        let pending = self.pending?;
        if now < pending.due {
            return None;
        }
        self.pending = None;
        self.shown = pending.screen;
        Some((pending.screen, pending.reason))
    }

    /// An explicit stop completed: drop any pending transition and show setup immediately.
    pub fn stopped(&mut self) -> Screen {
        self.pending = None;
        self.shown = Screen::Setup;
        Screen::Setup
    }

    pub fn on_app_event(
        &self,
        event: AppEvent,
        server_present: bool,
        stop_on_background: bool,
    ) -> AppDirective {
        match event {
            AppEvent::ScreenUnmounted if server_present => AppDirective::Stop,
            AppEvent::Backgrounded if server_present && stop_on_background => AppDirective::Stop,
            AppEvent::Foregrounded => AppDirective::Reevaluate,
            _ => AppDirective::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_millis(500);

    #[test]
    fn transitions_fire_only_after_debounce() {
        let mut lc = LifecycleCoordinator::new(DEBOUNCE);
        let t0 = Instant::now();
        lc.observe(true, 0, t0);
        assert_eq!(lc.pending_screen(), Some(Screen::Waiting));
        assert_eq!(lc.poll(t0 + Duration::from_millis(499)), None);
        assert_eq!(
            lc.poll(t0 + DEBOUNCE),
            Some((Screen::Waiting, "waiting for a device"))
        );
        assert_eq!(lc.screen(), Screen::Waiting);
        assert_eq!(lc.deadline(), None);
    }

    #[test]
    fn contradicting_state_cancels_pending() {
        let mut lc = LifecycleCoordinator::new(DEBOUNCE);
        let t0 = Instant::now();
        lc.observe(true, 1, t0);
        lc.poll(t0 + DEBOUNCE);
        assert_eq!(lc.screen(), Screen::Control);

        // Device drops and reconnects within the window.
        lc.observe(true, 0, t0 + Duration::from_secs(1));
        assert_eq!(lc.pending_screen(), Some(Screen::Waiting));
        lc.observe(true, 1, t0 + Duration::from_millis(1200));
        assert_eq!(lc.pending_screen(), None);
        assert_eq!(lc.poll(t0 + Duration::from_secs(3)), None);
        assert_eq!(lc.screen(), Screen::Control);
    }

    #[test]
    fn repeated_observation_keeps_original_deadline() {
        let mut lc = LifecycleCoordinator::new(DEBOUNCE);
        let t0 = Instant::now();
        lc.observe(true, 1, t0);
        lc.observe(true, 2, t0 + Duration::from_millis(300));
        assert_eq!(lc.deadline(), Some(t0 + DEBOUNCE));
    }

    #[test]
    fn listener_loss_tears_down_and_returns_to_setup() {
        let mut lc = LifecycleCoordinator::new(DEBOUNCE);
        let t0 = Instant::now();
        lc.observe(true, 2, t0);
        lc.poll(t0 + DEBOUNCE);

        let directive = lc.observe(false, 2, t0 + Duration::from_secs(1));
        assert!(directive.teardown_sessions);
        let directive = lc.observe(false, 0, t0 + Duration::from_secs(1));
        assert!(!directive.teardown_sessions);
        assert_eq!(
            lc.poll(t0 + Duration::from_secs(2)),
            Some((Screen::Setup, "server stopped unexpectedly"))
        );
    }

    #[test]
    fn explicit_stop_is_immediate() {
        let mut lc = LifecycleCoordinator::new(DEBOUNCE);
        let t0 = Instant::now();
        lc.observe(true, 1, t0);
        lc.poll(t0 + DEBOUNCE);
        lc.observe(true, 0, t0 + Duration::from_secs(1));
        assert!(lc.deadline().is_some());

        assert_eq!(lc.stopped(), Screen::Setup);
        assert_eq!(lc.screen(), Screen::Setup);
        assert_eq!(lc.deadline(), None);
        assert_eq!(lc.poll(t0 + Duration::from_secs(5)), None);
    }

    #[test]
    fn app_events_map_to_directives() {
        let lc = LifecycleCoordinator::new(DEBOUNCE);
        assert_eq!(
            lc.on_app_event(AppEvent::ScreenUnmounted, true, false),
            AppDirective::Stop
        );
        assert_eq!(
            lc.on_app_event(AppEvent::Backgrounded, true, false),
            AppDirective::Ignore
        );
        assert_eq!(
            lc.on_app_event(AppEvent::Backgrounded, true, true),
            AppDirective::Stop
        );
        assert_eq!(
            lc.on_app_event(AppEvent::ScreenUnmounted, false, true),
            AppDirective::Ignore
        );
        assert_eq!(
            lc.on_app_event(AppEvent::Foregrounded, false, true),
            AppDirective::Reevaluate
        );
    }
}
