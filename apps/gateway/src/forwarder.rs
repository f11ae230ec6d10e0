//! Webhook forwarder: pushes normalized inbound messages to the
//! application webhook and hands failures to the delivery queue.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{info, warn};

use courier_core::NormalizedInbound;
use courier_queue::DeliveryQueue;

/// Spacing between requests while draining the queue.
const DRAIN_SPACING: Duration = Duration::from_millis(500);

struct ForwarderInner {
    http: reqwest::Client,
    url: Option<String>,
    timeout: Duration,
    queue: DeliveryQueue,
    drain_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct Forwarder {
    inner: Arc<ForwarderInner>,
}

impl Forwarder {
    pub fn new(
        http: reqwest::Client,
        url: Option<String>,
        timeout: Duration,
        queue: DeliveryQueue,
    ) -> Self {
        Self {
            inner: Arc::new(ForwarderInner {
                http,
                url,
                timeout,
                queue,
                drain_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.inner.queue
    }

    /// Delivers one message. A 2xx settles it; a 400 is a permanent reject;
    /// anything else either enqueues it (direct path) or bumps its attempt
    /// count (queue path).
    pub async fn forward(&self, message: &NormalizedInbound, from_queue: bool) {
        let Some(url) = self.inner.url.as_deref() else {
            warn!(
                tenant = %message.tenant,
                msg_id = %message.message_id,
                "webhook url not configured; dropping inbound message"
            );
            return;
        };

        let payload = message.webhook_payload();
        let result = self
            .inner
            .http
            .post(url)
            .timeout(self.inner.timeout)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                counter!("courier_webhook_delivered_total").increment(1);
                if from_queue {
                    self.inner.queue.dequeue(&message.message_id);
                }
            }
            Ok(response) if response.status().as_u16() == 400 => {
                warn!(
                    tenant = %message.tenant,
                    msg_id = %message.message_id,
                    "webhook rejected message permanently"
                );
                counter!("courier_webhook_rejected_total").increment(1);
                if from_queue {
                    self.inner.queue.dequeue(&message.message_id);
                }
            }
            Ok(response) => {
                self.handle_failure(message, from_queue, format!("status={}", response.status()));
            }
            Err(err) => {
                self.handle_failure(message, from_queue, err.to_string());
            }
        }
    }

    fn handle_failure(&self, message: &NormalizedInbound, from_queue: bool, reason: String) {
        warn!(
            tenant = %message.tenant,
            msg_id = %message.message_id,
            reason = %reason,
            from_queue,
            "webhook delivery failed"
        );
        counter!("courier_webhook_failed_total").increment(1);
        if from_queue {
            self.inner.queue.increment_attempts(&message.message_id);
        } else {
            self.inner.queue.enqueue(message.clone());
        }
    }

    /// One drain pass over a snapshot of the queue, then cleanup. Passes
    /// never overlap.
    pub async fn process_queue(&self) {
        let _guard = self.inner.drain_lock.lock().await;
        let snapshot = self.inner.queue.list();
        if !snapshot.is_empty() {
            info!(count = snapshot.len(), "draining delivery queue");
            for entry in &snapshot {
                self.forward(&entry.payload, true).await;
                tokio::time::sleep(DRAIN_SPACING).await;
            }
        }
        self.inner.queue.cleanup();
    }
}
