//! Session lifecycle: reconnect backoff, logout teardown, bad-session
//! credential wipes, and idempotent creation.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_core::{ProviderKind, SessionStatus};
use courier_providers::{CloseCause, ProviderEvent};

fn status_recorder(
    gw: &support::TestGateway,
    tenant: &str,
) -> Arc<Mutex<Vec<SessionStatus>>> {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    gw.supervisor.on_status_change(
        tenant,
        Arc::new(move |change| sink.lock().unwrap().push(change.status)),
    );
    statuses
}

#[tokio::test(start_paused = true)]
async fn failed_connects_are_retried_with_backoff_until_success() {
    let gw = support::gateway(vec![ProviderKind::Socket], None).await;
    let provider = gw.factory.provider("t1", ProviderKind::Socket);
    provider.push_connect(Err(courier_core::ErrorClass::Other));
    provider.push_connect(Err(courier_core::ErrorClass::Other));

    let statuses = status_recorder(&gw, "t1");
    let snapshot = gw.supervisor.create_session("t1").await;
    // The initial sequence failed; the session stays initializing while
    // the reconnect loop runs behind it.
    assert_eq!(snapshot.status, SessionStatus::Initializing);

    let connected = support::wait_until(Duration::from_secs(60), || async {
        matches!(
            gw.supervisor.snapshot("t1").await,
            Some(snap) if snap.status == SessionStatus::Connected
        )
    })
    .await;
    assert!(connected, "session never reconnected");

    let snapshot = gw.supervisor.snapshot("t1").await.unwrap();
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert_eq!(snapshot.active_provider, Some(ProviderKind::Socket));
    assert!(snapshot.phone_identity.is_some());
    // Three connect calls: the failing two plus the one that stuck.
    assert_eq!(provider.connect_calls(), 3);
    assert!(statuses.lock().unwrap().contains(&SessionStatus::Connected));
}

#[tokio::test(start_paused = true)]
async fn reconnect_budget_exhaustion_ends_in_failed() {
    let gw = support::gateway(vec![ProviderKind::Socket], None).await;
    let provider = gw.factory.provider("t1", ProviderKind::Socket);
    provider.fail_connects_forever();

    gw.supervisor.create_session("t1").await;

    // Backoff delays sum to a few virtual minutes before the budget runs
    // out.
    let failed = support::wait_until(Duration::from_secs(900), || async {
        matches!(
            gw.supervisor.snapshot("t1").await,
            Some(snap) if snap.status == SessionStatus::Failed
        )
    })
    .await;
    assert!(failed, "session never reached failed");

    let snapshot = gw.supervisor.snapshot("t1").await.unwrap();
    assert_eq!(snapshot.reconnect_attempts, 8);
    assert_eq!(snapshot.active_provider, None);
}

#[tokio::test(start_paused = true)]
async fn observed_reconnect_delays_grow_exponentially_within_bounds() {
    let gw = support::gateway(vec![ProviderKind::Socket], None).await;
    let provider = gw.factory.provider("t1", ProviderKind::Socket);
    provider.fail_connects_forever();

    // Wait on a channel rather than polling: the paused clock then only
    // ever advances to the reconnect timers, so the gap between one
    // connect attempt and the next is exactly the scheduled delay.
    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel();
    gw.supervisor.on_status_change(
        "t1",
        Arc::new(move |change| {
            let _ = status_tx.send(change.status);
        }),
    );

    gw.supervisor.create_session("t1").await;
    tokio::time::timeout(Duration::from_secs(1800), async {
        while let Some(status) = status_rx.recv().await {
            if status == SessionStatus::Failed {
                break;
            }
        }
    })
    .await
    .expect("session never reached failed");

    let instants = provider.connect_instants();
    // The initial attempt plus eight reconnects.
    assert_eq!(instants.len(), 9);

    let mut previous_delay = 0u64;
    for n in 1..=8usize {
        let delay = (instants[n] - instants[n - 1]).as_millis() as u64;
        let base = (1000u64 * (1u64 << n)).min(60_000);
        assert!(delay >= base, "reconnect {n}: {delay}ms < {base}ms");
        assert!(
            delay <= base * 13 / 10,
            "reconnect {n}: {delay}ms > {}ms",
            base * 13 / 10
        );
        // Jitter may reorder delays once the base is capped, not before.
        if base < 60_000 {
            assert!(
                delay >= previous_delay,
                "reconnect {n}: {delay}ms shrank below {previous_delay}ms before the cap"
            );
        }
        previous_delay = delay;
    }
}

#[tokio::test(start_paused = true)]
async fn connection_close_schedules_reconnect_and_recovers() {
    let gw = support::gateway(vec![ProviderKind::Socket], None).await;
    let provider = gw.factory.provider("t1", ProviderKind::Socket);

    let statuses = status_recorder(&gw, "t1");
    let snapshot = gw.supervisor.create_session("t1").await;
    assert_eq!(snapshot.status, SessionStatus::Connected);

    provider
        .emit(ProviderEvent::Closed {
            cause: CloseCause::Other("stream error".into()),
        })
        .await;

    let recovered = support::wait_until(Duration::from_secs(60), || async {
        provider.connect_calls() >= 2
            && matches!(
                gw.supervisor.snapshot("t1").await,
                Some(snap) if snap.status == SessionStatus::Connected
            )
    })
    .await;
    assert!(recovered, "session never recovered from close");

    let seen = statuses.lock().unwrap().clone();
    assert!(seen.contains(&SessionStatus::Reconnecting));
    let snapshot = gw.supervisor.snapshot("t1").await.unwrap();
    assert_eq!(snapshot.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn bad_session_wipes_credentials_and_reconnects() {
    let gw = support::gateway(vec![ProviderKind::Socket], None).await;
    let provider = gw.factory.provider("t1", ProviderKind::Socket);

    let creds_dir = gw.auth_root.join("t1");
    tokio::fs::create_dir_all(&creds_dir).await.unwrap();
    tokio::fs::write(creds_dir.join("creds.json"), "{}").await.unwrap();

    gw.supervisor.create_session("t1").await;
    provider
        .emit(ProviderEvent::Closed {
            cause: CloseCause::BadSession,
        })
        .await;

    let recovered = support::wait_until(Duration::from_secs(60), || async {
        provider.connect_calls() >= 2
            && matches!(
                gw.supervisor.snapshot("t1").await,
                Some(snap) if snap.status == SessionStatus::Connected
            )
    })
    .await;
    assert!(recovered);
    assert!(!creds_dir.exists(), "bad session must wipe credentials");
}

#[tokio::test]
async fn logout_purges_credentials_and_removes_the_session() {
    let gw = support::gateway(vec![ProviderKind::Socket], None).await;
    let provider = gw.factory.provider("t1", ProviderKind::Socket);

    let creds_dir = gw.auth_root.join("t1");
    tokio::fs::create_dir_all(&creds_dir).await.unwrap();
    tokio::fs::write(creds_dir.join("creds.json"), "{}").await.unwrap();

    gw.supervisor.create_session("t1").await;
    provider
        .emit(ProviderEvent::Closed {
            cause: CloseCause::LoggedOut,
        })
        .await;

    let removed = support::wait_until(Duration::from_secs(3), || async {
        gw.supervisor.snapshot("t1").await.is_none()
    })
    .await;
    assert!(removed, "logged-out session must be dropped");
    assert!(!creds_dir.exists(), "logout must purge credentials");
}

#[tokio::test]
async fn create_session_returns_connected_session_unmodified() {
    let gw = support::gateway(vec![ProviderKind::Socket], None).await;
    let provider = gw.factory.provider("t1", ProviderKind::Socket);

    let first = gw.supervisor.create_session("t1").await;
    assert_eq!(first.status, SessionStatus::Connected);
    let second = gw.supervisor.create_session("t1").await;

    assert_eq!(second.status, SessionStatus::Connected);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(provider.connect_calls(), 1);
}

#[tokio::test]
async fn disconnect_session_tears_down_and_forgets() {
    let gw = support::gateway(vec![ProviderKind::Socket], None).await;
    gw.supervisor.create_session("t1").await;

    assert!(gw.supervisor.disconnect_session("t1").await);
    assert!(gw.supervisor.snapshot("t1").await.is_none());
    assert!(!gw.supervisor.disconnect_session("t1").await);
}

#[tokio::test(start_paused = true)]
async fn qr_flow_transitions_to_connected_on_scan() {
    let gw = support::gateway(vec![ProviderKind::Socket], None).await;
    let provider = gw.factory.provider("t1", ProviderKind::Socket);
    provider.push_connect(Ok(courier_providers::ConnectOutcome::QrReady {
        qr: "qr-blob".into(),
    }));

    let snapshot = gw.supervisor.create_session("t1").await;
    assert_eq!(snapshot.status, SessionStatus::QrReady);
    assert_eq!(snapshot.qr_payload.as_deref(), Some("qr-blob"));
    assert_eq!(snapshot.active_provider, None);

    provider
        .emit(ProviderEvent::Connected {
            phone_identity: "+5511999990000".into(),
        })
        .await;

    let connected = support::wait_until(Duration::from_secs(5), || async {
        matches!(
            gw.supervisor.snapshot("t1").await,
            Some(snap) if snap.status == SessionStatus::Connected
        )
    })
    .await;
    assert!(connected);

    let snapshot = gw.supervisor.snapshot("t1").await.unwrap();
    // QR payload clears once connected; active provider appears.
    assert_eq!(snapshot.qr_payload, None);
    assert_eq!(snapshot.active_provider, Some(ProviderKind::Socket));
    assert_eq!(snapshot.phone_identity.as_deref(), Some("+5511999990000"));
}
