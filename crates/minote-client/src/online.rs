//! Aggregate online state.
//!
//! `online = reachable ∧ authenticated ∧ cookie_valid`. Inputs arrive
//! from the OS reachability probe and from auth events; the aggregate is
//! edge-triggered: consumers only hear about flips, never levels.

use std::sync::Arc;
use std::sync::Mutex;

use minote_core::event::OnlineEvent;
use tracing::debug;

use crate::bus::EventBus;

const LOG_TARGET: &str = "minote::online";

#[derive(Debug, Clone, Copy, Default)]
struct Inputs {
    reachable: bool,
    authenticated: bool,
    cookie_valid: bool,
}

impl Inputs {
    fn aggregate(self) -> bool {
        self.reachable && self.authenticated && self.cookie_valid
    }
}

pub struct OnlineState {
    bus: Arc<EventBus>,
    state: Mutex<(Inputs, bool)>,
}

impl OnlineState {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state: Mutex::new((Inputs::default(), false)),
        })
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().expect("Locking failed").1
    }

    /// Input from the OS reachability probe.
    pub fn set_reachable(&self, reachable: bool) {
        self.update(|inputs| inputs.reachable = reachable);
    }

    /// Input from the session: a non-empty service token exists.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.update(|inputs| inputs.authenticated = authenticated);
    }

    /// Input from auth events: refreshed sets it, expired clears it.
    pub fn set_cookie_valid(&self, cookie_valid: bool) {
        self.update(|inputs| inputs.cookie_valid = cookie_valid);
    }

    fn update(&self, f: impl FnOnce(&mut Inputs)) {
        let flipped_to = {
            let mut state = self.state.lock().expect("Locking failed");
            f(&mut state.0);
            let now_online = state.0.aggregate();
            if now_online == state.1 {
                None
            } else {
                state.1 = now_online;
                Some(now_online)
            }
        };

        if let Some(online) = flipped_to {
            debug!(target: LOG_TARGET, online, "Online state flipped");
            self.bus.publish_online(OnlineEvent::StatusChanged(online));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn edge_triggered_publication() {
        let bus = Arc::new(EventBus::new());
        let mut online_rx = bus.online_subscribe();
        let online = OnlineState::new(bus.clone());

        assert!(!online.is_online());

        online.set_reachable(true);
        online.set_authenticated(true);
        assert!(online_rx.try_recv().is_none());

        online.set_cookie_valid(true);
        assert!(online.is_online());
        assert!(matches!(
            online_rx.try_recv(),
            Some(OnlineEvent::StatusChanged(true))
        ));

        // Re-asserting an input is not an edge.
        online.set_reachable(true);
        assert!(online_rx.try_recv().is_none());

        online.set_cookie_valid(false);
        assert!(!online.is_online());
        assert!(matches!(
            online_rx.try_recv(),
            Some(OnlineEvent::StatusChanged(false))
        ));
    }
}
