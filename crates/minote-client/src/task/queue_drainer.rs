//! Periodic queue drain.
//!
//! Wakes on a timer and on online edges; while online, asks the
//! processor to drain whatever is eligible (including rows whose
//! backoff window just closed).

use std::time::Duration;

use minote_core::event::OnlineEvent;
use minote_util_bus::Receiver;
use minote_util_error::FmtCompact as _;
use tracing::{debug, instrument, trace, warn};

use crate::LOG_TARGET;
use crate::client::{Client, ClientHandle};

pub struct QueueDrainer {
    client: ClientHandle,
    online_rx: Receiver<OnlineEvent>,
}

impl QueueDrainer {
    pub fn new(client: &Client) -> Self {
        debug!(target: LOG_TARGET, "Starting queue drainer");
        Self {
            client: client.handle(),
            online_rx: client.bus().online_subscribe(),
        }
    }

    #[instrument(name = "queue-drainer", skip(self))]
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(if minote_util::is_minote_dev_mode_set() {
            Duration::from_secs(2)
        } else {
            Duration::from_secs(60)
        });
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => (),
                event = self.online_rx.recv() => {
                    match event {
                        Ok(OnlineEvent::StatusChanged(true)) => (),
                        Ok(OnlineEvent::StatusChanged(false)) => continue,
                        Err(_) => break,
                    }
                }
            }
            trace!(target: LOG_TARGET, "Woke up");

            let Ok(client) = self.client.client_ref() else {
                break;
            };
            if !client.online().is_online() {
                continue;
            }

            if let Err(err) = client.processor().process_queue().await {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Queue drain failed");
            }
        }
        debug!(target: LOG_TARGET, "Queue drainer stopped");
    }
}
