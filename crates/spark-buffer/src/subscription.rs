//! Per-chat pub/sub subscription.
//!
//! A backend hands raw channel payloads to [`Subscription::spawn`]; a
//! forwarding task decodes them into [`EventEnvelope`]s and feeds a bounded
//! queue the subscriber reads with [`Subscription::recv`]. Delivery is best
//! effort: there is no acknowledgement and no replay.

use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use spark_shared::constants::{SUBSCRIPTION_HEALTH_CHECK_SECS, SUBSCRIPTION_SEND_TIMEOUT_SECS};
use spark_shared::EventEnvelope;

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionOptions {
    /// How often an idle forwarder checks that its subscriber still exists.
    pub health_check_interval: Duration,
    /// How long a decoded event may wait for queue space before it is
    /// dropped.
    pub send_timeout: Duration,
    /// Queue capacity between the forwarder and the subscriber.
    pub capacity: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(SUBSCRIPTION_HEALTH_CHECK_SECS),
            send_timeout: Duration::from_secs(SUBSCRIPTION_SEND_TIMEOUT_SECS),
            capacity: 256,
        }
    }
}

pub struct Subscription {
    chat_id: String,
    rx: mpsc::Receiver<EventEnvelope>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    /// Start forwarding `payloads` to a new subscription. The subscription
    /// closes when the payload stream ends.
    pub fn spawn(
        chat_id: impl Into<String>,
        payloads: BoxStream<'static, String>,
        options: SubscriptionOptions,
    ) -> Self {
        let chat_id = chat_id.into();
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let forwarder = tokio::spawn(forward(chat_id.clone(), payloads, tx, options));
        Self {
            chat_id,
            rx,
            forwarder,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Wait for the next event. `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }

}

/// Dropping a subscription stops its forwarder.
impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn forward(
    chat_id: String,
    mut payloads: BoxStream<'static, String>,
    tx: mpsc::Sender<EventEnvelope>,
    options: SubscriptionOptions,
) {
    loop {
        let payload = match tokio::time::timeout(options.health_check_interval, payloads.next()).await
        {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(chat_id = %chat_id, "subscription source ended");
                return;
            }
            Err(_) => {
                if tx.is_closed() {
                    debug!(chat_id = %chat_id, "subscriber gone, stopping forwarder");
                    return;
                }
                continue;
            }
        };

        let event = match EventEnvelope::from_json(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "failed to parse event");
                continue;
            }
        };

        match tx.send_timeout(event, options.send_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(chat_id = %chat_id, "subscriber too slow, dropping event");
            }
            Err(SendTimeoutError::Closed(_)) => return,
        }
    }
}
