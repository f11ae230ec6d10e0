//! Per-tenant session supervision.
//!
//! Each session is an actor: an owning task with a command inbox. Provider
//! callbacks, connect results and reconnect timers all arrive as commands,
//! so every mutation of session state is serialized without locks, and
//! work for one tenant never blocks another. Spawned helpers (connect
//! attempts, timers) stamp their messages with the epoch current at spawn
//! time; the actor drops anything stamped with an older epoch, which is
//! how late callbacks from superseded attempts are detected and ignored.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::{
    now_epoch_ms, FallbackSettings, NormalizedInbound, PollingSettings, ProviderError,
    ProviderKind, SessionStatus,
};
use courier_providers::{
    socket::purge_auth_dir, CloseCause, ConnectOutcome, HealthSnapshot, Provider, ProviderEvent,
    ProviderFactory,
};

use crate::backend::BackendClient;
use crate::forwarder::Forwarder;
use crate::poller;
use crate::router::SendRouter;

pub const MAX_RECONNECT_ATTEMPTS: u32 = 8;

const CONNECT_GUARD: Duration = Duration::from_secs(65);
const INBOX_CAPACITY: usize = 64;
const QUEUE_DRAIN_DELAY: Duration = Duration::from_secs(2);
const RESTORE_SPACING: Duration = Duration::from_secs(2);

/// Delay before the n-th reconnect attempt (1-based):
/// `min(60 s, 2^n x 1 s)` plus additive jitter in [0, 30%].
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 1000u64.saturating_mul(1u64 << attempt.min(16));
    let capped = base_ms.min(60_000);
    let jitter = rand::rng().random_range(0..=capped * 3 / 10);
    Duration::from_millis(capped + jitter)
}

/// Status change pushed to subscribers.
#[derive(Clone, Debug)]
pub struct StatusChange {
    pub tenant: String,
    pub status: SessionStatus,
    pub phone_identity: Option<String>,
    pub qr: Option<String>,
}

pub type StatusCallback = Arc<dyn Fn(&StatusChange) + Send + Sync>;

/// Health view of one installed provider.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderHealth {
    pub kind: ProviderKind,
    pub healthy: bool,
    #[serde(flatten)]
    pub metrics: HealthSnapshot,
}

/// Point-in-time view of a session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    #[serde(rename = "tenantId")]
    pub tenant: String,
    pub status: SessionStatus,
    #[serde(rename = "activeProvider")]
    pub active_provider: Option<ProviderKind>,
    #[serde(rename = "phoneIdentity")]
    pub phone_identity: Option<String>,
    #[serde(rename = "qrPayload")]
    pub qr_payload: Option<String>,
    #[serde(rename = "reconnectAttempts")]
    pub reconnect_attempts: u32,
    #[serde(rename = "connectedAt")]
    pub connected_at: Option<i64>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    pub providers: Vec<ProviderHealth>,
}

/// Send candidates for the router: `[active, priority \ active]`, limited
/// to providers actually installed on the session.
pub struct CandidateSet {
    pub candidates: Vec<Arc<dyn Provider>>,
}

enum Command {
    ConnectResolved {
        epoch: u64,
        kind: ProviderKind,
        outcome: Result<ConnectOutcome, ProviderError>,
    },
    Event {
        kind: ProviderKind,
        event: ProviderEvent,
    },
    ReconnectDue {
        epoch: u64,
    },
    InjectInbound {
        messages: Vec<NormalizedInbound>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Candidates {
        reply: oneshot::Sender<CandidateSet>,
    },
    Disconnect {
        reply: Option<oneshot::Sender<()>>,
    },
}

struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

pub struct SupervisorDeps {
    pub factory: Arc<dyn ProviderFactory>,
    pub forwarder: Forwarder,
    pub backend: Option<BackendClient>,
    pub fallback: FallbackSettings,
    pub polling: PollingSettings,
    pub auth_root: PathBuf,
}

pub struct SupervisorInner {
    factory: Arc<dyn ProviderFactory>,
    forwarder: Forwarder,
    backend: Option<BackendClient>,
    fallback: FallbackSettings,
    polling: PollingSettings,
    auth_root: PathBuf,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    subscribers: Mutex<HashMap<String, Vec<(u64, StatusCallback)>>>,
    next_subscriber_id: AtomicU64,
    // Serializes create/disconnect so concurrent creates for one tenant
    // cannot race past the existing-session check.
    lifecycle: tokio::sync::Mutex<()>,
}

/// Owns every session; cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(deps: SupervisorDeps) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                factory: deps.factory,
                forwarder: deps.forwarder,
                backend: deps.backend,
                fallback: deps.fallback,
                polling: deps.polling,
                auth_root: deps.auth_root,
                sessions: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Creates (or returns) the session for a tenant. An existing
    /// `connected` session is returned unmodified; any other existing
    /// session is torn down and replaced. Resolves once the fresh session
    /// reaches a decisive state (connected, qr_ready, or out of
    /// candidates).
    pub async fn create_session(&self, tenant: &str) -> SessionSnapshot {
        // The lock covers the check-and-replace only; waiting for the new
        // session's first decisive state happens outside it so one slow
        // connect cannot stall other tenants.
        let done_rx = {
            let _guard = self.inner.lifecycle.lock().await;

            if let Some(tx) = self.session_tx(tenant) {
                if let Some(snapshot) = query_snapshot(&tx).await {
                    if snapshot.status == SessionStatus::Connected {
                        return snapshot;
                    }
                }
                self.disconnect_inner(tenant).await;
            }

            let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
            let (done_tx, done_rx) = oneshot::channel();
            self.inner
                .sessions
                .lock()
                .unwrap()
                .insert(tenant.to_string(), SessionHandle { tx: tx.clone() });

            let actor =
                SessionActor::new(tenant.to_string(), Arc::clone(&self.inner), tx, done_tx);
            tokio::spawn(actor.run(rx));
            done_rx
        };

        match done_rx.await {
            Ok(snapshot) => snapshot,
            // The session was torn down before reaching a decisive state.
            Err(_) => self.snapshot(tenant).await.unwrap_or(SessionSnapshot {
                tenant: tenant.to_string(),
                status: SessionStatus::Disconnected,
                active_provider: None,
                phone_identity: None,
                qr_payload: None,
                reconnect_attempts: 0,
                connected_at: None,
                created_at: now_epoch_ms(),
                providers: Vec::new(),
            }),
        }
    }

    /// Tears the session down: stops its poller and timers, disconnects
    /// its providers, drops its subscribers. Returns whether a session
    /// existed.
    pub async fn disconnect_session(&self, tenant: &str) -> bool {
        let _guard = self.inner.lifecycle.lock().await;
        self.disconnect_inner(tenant).await
    }

    async fn disconnect_inner(&self, tenant: &str) -> bool {
        let handle = self.inner.sessions.lock().unwrap().remove(tenant);
        let Some(handle) = handle else {
            return false;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle
            .tx
            .send(Command::Disconnect {
                reply: Some(reply_tx),
            })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        true
    }

    pub async fn snapshot(&self, tenant: &str) -> Option<SessionSnapshot> {
        let tx = self.session_tx(tenant)?;
        query_snapshot(&tx).await
    }

    pub async fn candidates(&self, tenant: &str) -> Option<CandidateSet> {
        let tx = self.session_tx(tenant)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Candidates { reply: reply_tx }).await.ok()?;
        reply_rx.await.ok()
    }

    pub async fn all_snapshots(&self) -> Vec<SessionSnapshot> {
        let txs: Vec<mpsc::Sender<Command>> = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|handle| handle.tx.clone())
            .collect();
        let mut out = Vec::with_capacity(txs.len());
        for tx in txs {
            if let Some(snapshot) = query_snapshot(&tx).await {
                out.push(snapshot);
            }
        }
        out
    }

    /// Subscribes to status changes for a tenant. Callbacks fire
    /// synchronously, in registration order; a panicking callback does not
    /// stop the rest.
    pub fn on_status_change(&self, tenant: &str, callback: StatusCallback) -> u64 {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(tenant.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    pub fn unsubscribe(&self, tenant: &str, id: u64) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get_mut(tenant) {
            list.retain(|(entry_id, _)| *entry_id != id);
            if list.is_empty() {
                subscribers.remove(tenant);
            }
        }
    }

    /// Routes an inbound platform-webhook payload to the session whose
    /// cloud provider reports the given phone identity. Returns whether a
    /// session matched.
    pub async fn route_platform_inbound(
        &self,
        phone_identity: &str,
        messages: Vec<NormalizedInbound>,
    ) -> bool {
        let entries: Vec<(String, mpsc::Sender<Command>)> = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(tenant, handle)| (tenant.clone(), handle.tx.clone()))
            .collect();

        for (tenant, tx) in entries {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Command::Candidates { reply: reply_tx }).await.is_err() {
                continue;
            }
            let Ok(set) = reply_rx.await else { continue };
            let owns = set.candidates.iter().any(|provider| {
                provider.kind() == ProviderKind::Cloud
                    && provider.phone_identity().as_deref() == Some(phone_identity)
            });
            if owns {
                debug!(tenant = %tenant, phone_identity, "routing platform inbound");
                let _ = tx.send(Command::InjectInbound { messages }).await;
                return true;
            }
        }
        warn!(phone_identity, "no session owns inbound platform payload");
        false
    }

    /// Restores sessions for every tenant with a persisted credential
    /// directory, spacing the attempts out.
    pub async fn reconnect_existing_sessions(&self) {
        let mut dir = match tokio::fs::read_dir(&self.inner.auth_root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                warn!(error = %err, root = %self.inner.auth_root.display(), "cannot scan auth root");
                return;
            }
        };

        let mut tenants = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                if let Some(name) = entry.file_name().to_str() {
                    tenants.push(name.to_string());
                }
            }
        }
        tenants.sort();

        info!(count = tenants.len(), "restoring persisted sessions");
        for tenant in tenants {
            self.create_session(&tenant).await;
            tokio::time::sleep(RESTORE_SPACING).await;
        }
    }

    /// Disconnects everything; part of process shutdown.
    pub async fn shutdown(&self) {
        let tenants: Vec<String> = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for tenant in tenants {
            self.disconnect_session(&tenant).await;
        }
    }

    fn session_tx(&self, tenant: &str) -> Option<mpsc::Sender<Command>> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(tenant)
            .map(|handle| handle.tx.clone())
    }

    fn from_inner(inner: Arc<SupervisorInner>) -> Self {
        Self { inner }
    }
}

impl SupervisorInner {
    fn notify(&self, change: &StatusChange) {
        let callbacks: Vec<StatusCallback> = self
            .subscribers
            .lock()
            .unwrap()
            .get(&change.tenant)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for callback in callbacks {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(change)));
            if result.is_err() {
                error!(tenant = %change.tenant, "status subscriber panicked");
            }
        }
    }

    fn drop_subscribers(&self, tenant: &str) {
        self.subscribers.lock().unwrap().remove(tenant);
    }

    fn remove_session(&self, tenant: &str) {
        self.sessions.lock().unwrap().remove(tenant);
    }
}

async fn query_snapshot(tx: &mpsc::Sender<Command>) -> Option<SessionSnapshot> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(Command::Snapshot { reply: reply_tx }).await.ok()?;
    reply_rx.await.ok()
}

// ---------------------------------------------------------------------------
// The per-session actor.

struct SessionActor {
    tenant: String,
    inner: Arc<SupervisorInner>,
    self_tx: mpsc::Sender<Command>,
    epoch: u64,
    status: SessionStatus,
    active: Option<ProviderKind>,
    phone_identity: Option<String>,
    qr_payload: Option<String>,
    reconnect_attempts: u32,
    connected_at: Option<i64>,
    created_at: i64,
    providers: Vec<(ProviderKind, Arc<dyn Provider>)>,
    pumps: Vec<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    forward_tx: mpsc::UnboundedSender<NormalizedInbound>,
    forward_task: JoinHandle<()>,
    connect_cursor: Option<usize>,
    init_done: Option<oneshot::Sender<SessionSnapshot>>,
}

enum Flow {
    Continue,
    Stop,
}

impl SessionActor {
    fn new(
        tenant: String,
        inner: Arc<SupervisorInner>,
        self_tx: mpsc::Sender<Command>,
        init_done: oneshot::Sender<SessionSnapshot>,
    ) -> Self {
        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<NormalizedInbound>();
        let forwarder = inner.forwarder.clone();
        // One consumer per session keeps per-tenant forward order equal to
        // provider emit order without blocking the actor on webhook I/O.
        let forward_task = tokio::spawn(async move {
            while let Some(message) = forward_rx.recv().await {
                forwarder.forward(&message, false).await;
            }
        });

        Self {
            tenant,
            inner,
            self_tx,
            epoch: 0,
            status: SessionStatus::Initializing,
            active: None,
            phone_identity: None,
            qr_payload: None,
            reconnect_attempts: 0,
            connected_at: None,
            created_at: now_epoch_ms(),
            providers: Vec::new(),
            pumps: Vec::new(),
            reconnect_timer: None,
            poller: None,
            forward_tx,
            forward_task,
            connect_cursor: None,
            init_done: Some(init_done),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.emit_status();
        self.install_providers();
        self.begin_connect_sequence();

        while let Some(command) = rx.recv().await {
            match self.handle(command).await {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::ConnectResolved {
                epoch,
                kind,
                outcome,
            } => {
                if epoch != self.epoch {
                    debug!(tenant = %self.tenant, provider = %kind, "dropping stale connect result");
                    return Flow::Continue;
                }
                self.handle_connect_resolved(kind, outcome);
                Flow::Continue
            }
            Command::Event { kind, event } => self.handle_event(kind, event).await,
            Command::ReconnectDue { epoch } => {
                if epoch != self.epoch {
                    return Flow::Continue;
                }
                self.reconnect_timer = None;
                if matches!(
                    self.status,
                    SessionStatus::Reconnecting | SessionStatus::Initializing
                ) {
                    counter!("courier_session_reconnects_total").increment(1);
                    self.begin_connect_sequence();
                }
                Flow::Continue
            }
            Command::InjectInbound { messages } => {
                for mut message in messages {
                    message.tenant = self.tenant.clone();
                    let _ = self.forward_tx.send(message);
                }
                Flow::Continue
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
            Command::Candidates { reply } => {
                let _ = reply.send(self.candidates());
                Flow::Continue
            }
            Command::Disconnect { reply } => {
                self.teardown(SessionStatus::Disconnected).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                Flow::Stop
            }
        }
    }

    /// Builds every provider in priority order. Construction failures are
    /// logged and skipped; connect failures are handled later, per
    /// attempt.
    fn install_providers(&mut self) {
        for kind in self.inner.factory.priority() {
            let (event_tx, event_rx) = mpsc::channel::<ProviderEvent>(INBOX_CAPACITY);
            match self.inner.factory.build(&self.tenant, kind, event_tx) {
                Ok(provider) => {
                    self.providers.push((kind, provider));
                    self.pumps.push(spawn_event_pump(
                        kind,
                        event_rx,
                        self.self_tx.clone(),
                    ));
                }
                Err(err) => {
                    warn!(tenant = %self.tenant, provider = %kind, error = %err, "provider construction failed");
                }
            }
        }
    }

    fn begin_connect_sequence(&mut self) {
        self.epoch += 1;
        self.connect_cursor = Some(0);
        self.connect_current();
    }

    fn connect_current(&mut self) {
        let Some(cursor) = self.connect_cursor else {
            return;
        };
        let Some((kind, provider)) = self.providers.get(cursor).cloned() else {
            self.on_connect_exhausted();
            return;
        };

        debug!(tenant = %self.tenant, provider = %kind, attempt = self.reconnect_attempts, "connecting provider");
        let tx = self.self_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(CONNECT_GUARD, provider.connect()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::timeout("provider connect timed out")),
            };
            let _ = tx
                .send(Command::ConnectResolved {
                    epoch,
                    kind,
                    outcome,
                })
                .await;
        });
    }

    fn handle_connect_resolved(
        &mut self,
        kind: ProviderKind,
        outcome: Result<ConnectOutcome, ProviderError>,
    ) {
        if self.status == SessionStatus::Connected {
            return;
        }
        match outcome {
            Ok(ConnectOutcome::Connected { phone_identity }) => {
                self.enter_connected(kind, phone_identity);
            }
            Ok(ConnectOutcome::QrReady { qr }) => {
                self.connect_cursor = None;
                self.qr_payload = Some(qr);
                self.set_status(SessionStatus::QrReady);
                self.resolve_init();
            }
            Err(err) => {
                warn!(tenant = %self.tenant, provider = %kind, error = %err, "provider connect failed");
                match self.connect_cursor {
                    Some(cursor) => {
                        self.connect_cursor = Some(cursor + 1);
                        self.connect_current();
                    }
                    None => self.on_connect_exhausted(),
                }
            }
        }
    }

    fn on_connect_exhausted(&mut self) {
        self.connect_cursor = None;
        if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
            info!(tenant = %self.tenant, "reconnect budget exhausted");
            self.stop_poller();
            self.set_status(SessionStatus::Failed);
            self.resolve_init();
            return;
        }
        // The very first sequence keeps `initializing` visible to callers;
        // later ones show `reconnecting`.
        if self.status != SessionStatus::Initializing {
            self.set_status(SessionStatus::Reconnecting);
        }
        self.schedule_reconnect();
        self.resolve_init();
    }

    fn schedule_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        // The counter advances when the attempt is scheduled, so the n-th
        // reconnect sleeps `min(60 s, 2^n x 1 s)` plus jitter.
        self.reconnect_attempts += 1;
        let delay = backoff_delay(self.reconnect_attempts);
        debug!(tenant = %self.tenant, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        let tx = self.self_tx.clone();
        let epoch = self.epoch;
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::ReconnectDue { epoch }).await;
        }));
    }

    fn enter_connected(&mut self, kind: ProviderKind, phone_identity: String) {
        self.epoch += 1;
        self.connect_cursor = None;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.reconnect_attempts = 0;
        self.active = Some(kind);
        self.phone_identity = Some(phone_identity);
        self.connected_at = Some(now_epoch_ms());
        self.set_status(SessionStatus::Connected);
        info!(tenant = %self.tenant, provider = %kind, "session connected");

        self.start_poller();
        let forwarder = self.inner.forwarder.clone();
        tokio::spawn(async move {
            tokio::time::sleep(QUEUE_DRAIN_DELAY).await;
            forwarder.process_queue().await;
        });
        self.resolve_init();
    }

    async fn handle_event(&mut self, kind: ProviderKind, event: ProviderEvent) -> Flow {
        match event {
            ProviderEvent::Qr { payload } => {
                if self.status != SessionStatus::Connected {
                    self.qr_payload = Some(payload);
                    self.set_status(SessionStatus::QrReady);
                    self.resolve_init();
                }
                Flow::Continue
            }
            ProviderEvent::Connected { phone_identity } => {
                if self.status != SessionStatus::Connected {
                    self.enter_connected(kind, phone_identity);
                }
                Flow::Continue
            }
            ProviderEvent::Closed { cause } => self.handle_closed(kind, cause).await,
            ProviderEvent::Inbound(message) => {
                let _ = self.forward_tx.send(message);
                Flow::Continue
            }
        }
    }

    async fn handle_closed(&mut self, kind: ProviderKind, cause: CloseCause) -> Flow {
        // A non-active provider closing is not a session event.
        if self.status == SessionStatus::Connected && self.active != Some(kind) {
            return Flow::Continue;
        }

        match cause {
            CloseCause::LoggedOut => {
                info!(tenant = %self.tenant, provider = %kind, "logged out; purging credentials");
                purge_auth_dir(&self.inner.auth_root.join(&self.tenant)).await;
                self.teardown(SessionStatus::LoggedOut).await;
                self.inner.remove_session(&self.tenant);
                Flow::Stop
            }
            CloseCause::BadSession => {
                warn!(tenant = %self.tenant, provider = %kind, "bad session; wiping credentials and reconnecting");
                purge_auth_dir(&self.inner.auth_root.join(&self.tenant)).await;
                self.reconnect_attempts = 0;
                self.leave_connected();
                self.set_status(SessionStatus::Reconnecting);
                self.schedule_reconnect();
                Flow::Continue
            }
            CloseCause::Other(reason) => {
                warn!(tenant = %self.tenant, provider = %kind, reason = %reason, "connection closed");
                self.leave_connected();
                if self.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                    self.set_status(SessionStatus::Failed);
                } else {
                    self.set_status(SessionStatus::Reconnecting);
                    self.schedule_reconnect();
                }
                Flow::Continue
            }
        }
    }

    fn leave_connected(&mut self) {
        self.stop_poller();
        self.active = None;
        self.connected_at = None;
    }

    fn start_poller(&mut self) {
        if self.poller.is_some() {
            return;
        }
        let Some(backend) = self.inner.backend.clone() else {
            return;
        };
        let router = SendRouter::new(
            Supervisor::from_inner(Arc::clone(&self.inner)),
            self.inner.fallback.clone(),
        );
        self.poller = Some(tokio::spawn(poller::run(
            self.tenant.clone(),
            backend,
            router,
            self.inner.polling.clone(),
        )));
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }

    /// Applies a status transition, maintaining the field invariants
    /// (active provider iff connected, qr payload iff qr_ready), and
    /// notifies subscribers synchronously.
    fn set_status(&mut self, status: SessionStatus) {
        if status != SessionStatus::Connected {
            self.active = None;
            self.connected_at = None;
        }
        if status != SessionStatus::QrReady {
            self.qr_payload = None;
        }
        self.status = status;
        self.emit_status();
    }

    fn emit_status(&self) {
        self.inner.notify(&StatusChange {
            tenant: self.tenant.clone(),
            status: self.status,
            phone_identity: self.phone_identity.clone(),
            qr: self.qr_payload.clone(),
        });
    }

    fn resolve_init(&mut self) {
        if let Some(done) = self.init_done.take() {
            let _ = done.send(self.snapshot());
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            tenant: self.tenant.clone(),
            status: self.status,
            active_provider: self.active,
            phone_identity: self.phone_identity.clone(),
            qr_payload: self.qr_payload.clone(),
            reconnect_attempts: self.reconnect_attempts,
            connected_at: self.connected_at,
            created_at: self.created_at,
            providers: self
                .providers
                .iter()
                .map(|(kind, provider)| ProviderHealth {
                    kind: *kind,
                    healthy: provider.is_healthy(),
                    metrics: provider.health(),
                })
                .collect(),
        }
    }

    fn candidates(&self) -> CandidateSet {
        let mut order: Vec<ProviderKind> = Vec::with_capacity(2);
        if let Some(active) = self.active {
            order.push(active);
        }
        for kind in self.inner.factory.priority() {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        let candidates = order
            .into_iter()
            .filter_map(|kind| {
                self.providers
                    .iter()
                    .find(|(installed, _)| *installed == kind)
                    .map(|(_, provider)| Arc::clone(provider))
            })
            .collect();
        CandidateSet { candidates }
    }

    async fn teardown(&mut self, final_status: SessionStatus) {
        self.epoch += 1;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.stop_poller();
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        for (kind, provider) in &self.providers {
            debug!(tenant = %self.tenant, provider = %kind, "disconnecting provider");
            provider.disconnect().await;
        }
        self.forward_task.abort();
        self.set_status(final_status);
        self.resolve_init();
        self.inner.drop_subscribers(&self.tenant);
    }
}

fn spawn_event_pump(
    kind: ProviderKind,
    mut events: mpsc::Receiver<ProviderEvent>,
    tx: mpsc::Sender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(Command::Event { kind, event }).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        for attempt in 1..=5u32 {
            let base = 1000u64 * (1 << attempt);
            for _ in 0..50 {
                let delay = backoff_delay(attempt).as_millis() as u64;
                assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
                assert!(
                    delay <= base * 13 / 10,
                    "attempt {attempt}: {delay} > {}",
                    base * 13 / 10
                );
            }
        }
    }

    #[test]
    fn backoff_is_capped_at_sixty_seconds() {
        for attempt in [6u32, 8, 12, 32] {
            for _ in 0..50 {
                let delay = backoff_delay(attempt).as_millis() as u64;
                assert!(delay >= 60_000);
                assert!(delay <= 78_000);
            }
        }
    }

    #[test]
    fn backoff_base_is_monotonic_until_the_cap() {
        let mut previous = 0u64;
        for attempt in 1..=10u32 {
            let base = (1000u64 * (1u64 << attempt)).min(60_000);
            assert!(base >= previous);
            previous = base;
        }
    }
}
