//! Feeds auth events into the aggregate online state and forwards
//! online edges to the request manager's retry queue.

use minote_core::event::{AuthEvent, OnlineEvent};
use minote_util_bus::Receiver;
use tracing::{debug, instrument};

use crate::LOG_TARGET;
use crate::client::{Client, ClientHandle};

pub struct OnlineWatcher {
    client: ClientHandle,
    auth_rx: Receiver<AuthEvent>,
    online_rx: Receiver<OnlineEvent>,
}

impl OnlineWatcher {
    pub fn new(client: &Client) -> Self {
        debug!(target: LOG_TARGET, "Starting online watcher");
        Self {
            client: client.handle(),
            auth_rx: client.bus().auth_subscribe(),
            online_rx: client.bus().online_subscribe(),
        }
    }

    #[instrument(name = "online-watcher", skip(self))]
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.auth_rx.recv() => {
                    let Ok(event) = event else { break };
                    let Ok(client) = self.client.client_ref() else { break };
                    match event {
                        AuthEvent::CookieRefreshed => {
                            client.online().set_authenticated(true);
                            client.online().set_cookie_valid(true);
                        }
                        AuthEvent::CookieExpired => {
                            client.online().set_cookie_valid(false);
                        }
                        AuthEvent::TokenRefreshFailed { .. } => {
                            // Only the bounded-failure threshold (which
                            // publishes CookieExpired) flips the state.
                        }
                    }
                }
                event = self.online_rx.recv() => {
                    let Ok(OnlineEvent::StatusChanged(online)) = event else { break };
                    let Ok(client) = self.client.client_ref() else { break };
                    client.net().notify_online(online);
                }
            }
        }
        debug!(target: LOG_TARGET, "Online watcher stopped");
    }
}
