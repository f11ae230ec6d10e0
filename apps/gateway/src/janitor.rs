//! Periodic sweep of dead-end sessions: `failed` sessions are torn down,
//! and sessions stuck in `initializing` past the deadline are torn down.

use std::time::Duration;

use tracing::info;

use courier_core::{now_epoch_ms, SessionStatus};

use crate::session::Supervisor;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const STUCK_INITIALIZING_MS: i64 = 30 * 60 * 1000;

pub async fn run(supervisor: Supervisor) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        sweep(&supervisor).await;
    }
}

pub async fn sweep(supervisor: &Supervisor) {
    let now = now_epoch_ms();
    for snapshot in supervisor.all_snapshots().await {
        let stuck = snapshot.status == SessionStatus::Initializing
            && now - snapshot.created_at > STUCK_INITIALIZING_MS;
        if snapshot.status == SessionStatus::Failed || stuck {
            info!(
                tenant = %snapshot.tenant,
                status = %snapshot.status,
                "janitor disconnecting dead-end session"
            );
            supervisor.disconnect_session(&snapshot.tenant).await;
        }
    }
}
