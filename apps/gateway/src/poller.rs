//! Outbound poller: turns the backend's pull queue into sends.
//!
//! One task per connected session. Each tick runs to completion before the
//! next is scheduled, so ticks never overlap; the schedule carries
//! additive jitter so a fleet of gateways does not hit the backend in
//! lockstep.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use courier_core::{PollingSettings, SendContent};

use crate::backend::{BackendClient, BackendError, PendingMessage};
use crate::router::SendRouter;

pub async fn run(
    tenant: String,
    backend: BackendClient,
    router: SendRouter,
    settings: PollingSettings,
) {
    loop {
        let jitter_cap = (settings.interval.as_millis() as u64) / 5;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_cap));
        tokio::time::sleep(settings.interval + jitter).await;
        tick(&tenant, &backend, &router).await;
    }
}

async fn tick(tenant: &str, backend: &BackendClient, router: &SendRouter) {
    let pending = match backend.pending_messages(tenant).await {
        Ok(pending) => pending,
        Err(BackendError::Unreachable) => return,
        Err(err) => {
            warn!(tenant, error = %err, "pending-messages fetch failed");
            return;
        }
    };

    if pending.is_empty() {
        return;
    }
    debug!(tenant, count = pending.len(), "dispatching pending outbound messages");

    for message in pending {
        dispatch_one(tenant, backend, router, message).await;
    }
}

async fn dispatch_one(
    tenant: &str,
    backend: &BackendClient,
    router: &SendRouter,
    message: PendingMessage,
) {
    let to = if message.is_lid {
        message
            .lid_id
            .clone()
            .unwrap_or_else(|| message.phone_number.clone())
    } else {
        message.phone_number.clone()
    };

    let content = SendContent::Text {
        body: message.content.clone(),
    };
    let ids = [message.id.clone()];

    match router.send(tenant, &to, &content).await {
        Ok(receipt) => {
            if let Err(err) = backend
                .mark_sent(&ids, "sent", Some(&receipt.message_id), None)
                .await
            {
                warn!(tenant, message_id = %message.id, error = %err, "mark-sent (sent) failed");
            }
        }
        Err(err) => {
            warn!(tenant, message_id = %message.id, error = %err, "outbound send failed");
            let reason = err.to_string();
            if let Err(ack_err) = backend
                .mark_sent(&ids, "failed", None, Some(&reason))
                .await
            {
                warn!(tenant, message_id = %message.id, error = %ack_err, "mark-sent (failed) failed");
            }
        }
    }
}
