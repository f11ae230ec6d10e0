//! QR-authenticated socket provider.
//!
//! The upstream wire protocol terminates in a [`SocketLink`]; this module
//! owns everything above it: the QR exchange, credential persistence,
//! status/inbound event plumbing toward the owning session, and send
//! health bookkeeping. The default link talks to a local bridge process
//! over HTTP long-polling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use courier_core::{
    now_epoch_ms, Address, ErrorClass, MediaContent, MessageKind, NormalizedInbound, ProviderError,
    ProviderKind, SendReceipt,
};

use crate::health::{HealthMetrics, HealthSnapshot};
use crate::traits::{
    Capabilities, CloseCause, ConnectOutcome, EventSender, Provider, ProviderEvent, ProviderStatus,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const CREDS_FILE: &str = "creds.json";

/// Inbound message as the link delivers it, before address resolution.
#[derive(Clone, Debug, Deserialize)]
pub struct InboundFrame {
    pub id: String,
    pub from: String,
    pub timestamp: i64,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub voice_transcript: Option<String>,
    #[serde(default)]
    pub voice_duration_seconds: Option<u32>,
}

/// Events surfaced by a socket link.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    Qr { payload: String },
    Open { identity: String },
    Closed { cause: CloseCause },
    Message(InboundFrame),
}

/// Factory for upstream socket connections. The wire protocol behind it is
/// out of this crate's hands.
#[async_trait]
pub trait SocketLink: Send + Sync {
    async fn open(
        &self,
        tenant: &str,
        auth_dir: &Path,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn LinkHandle>, ProviderError>;
}

/// An open upstream connection.
#[async_trait]
pub trait LinkHandle: Send + Sync {
    async fn deliver_text(&self, to: &str, body: &str) -> Result<String, ProviderError>;
    async fn deliver_media(&self, to: &str, media: &MediaContent)
        -> Result<String, ProviderError>;
    async fn close(&self);
}

enum Delivery<'a> {
    Text { to: &'a str, body: &'a str },
    Media { to: &'a str, media: &'a MediaContent },
}

struct Shared {
    tenant: String,
    auth_dir: PathBuf,
    status: Mutex<ProviderStatus>,
    identity: Mutex<Option<String>>,
    metrics: HealthMetrics,
    events: EventSender,
}

impl Shared {
    fn set_status(&self, status: ProviderStatus) {
        *self.status.lock().unwrap() = status;
    }
}

pub struct SocketProvider {
    shared: Arc<Shared>,
    link: Arc<dyn SocketLink>,
    handle: tokio::sync::Mutex<Option<Box<dyn LinkHandle>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SocketProvider {
    pub fn new(
        tenant: impl Into<String>,
        auth_dir: PathBuf,
        link: Arc<dyn SocketLink>,
        events: EventSender,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tenant: tenant.into(),
                auth_dir,
                status: Mutex::new(ProviderStatus::Disconnected),
                identity: Mutex::new(None),
                metrics: HealthMetrics::new(),
                events,
            }),
            link,
            handle: tokio::sync::Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    fn spawn_pump(&self, rx: mpsc::Receiver<LinkEvent>) {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(pump_events(shared, rx));
        if let Some(previous) = self.pump.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    async fn teardown(&self) {
        if let Some(task) = self.pump.lock().unwrap().take() {
            task.abort();
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle.close().await;
        }
        self.shared.set_status(ProviderStatus::Disconnected);
        *self.shared.identity.lock().unwrap() = None;
    }

    async fn deliver(&self, op: Delivery<'_>) -> Result<SendReceipt, ProviderError> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| ProviderError::other("socket not connected"))?;
        let start = Instant::now();
        let sent = match op {
            Delivery::Text { to, body } => handle.deliver_text(to, body).await,
            Delivery::Media { to, media } => handle.deliver_media(to, media).await,
        };
        match sent {
            Ok(message_id) => {
                self.shared
                    .metrics
                    .record_success(start.elapsed().as_secs_f64() * 1000.0);
                Ok(SendReceipt {
                    message_id,
                    provider: ProviderKind::Socket,
                })
            }
            Err(err) => {
                self.shared.metrics.record_failure();
                Err(err)
            }
        }
    }
}

async fn pump_events(shared: Arc<Shared>, mut rx: mpsc::Receiver<LinkEvent>) {
    while let Some(event) = rx.recv().await {
        let forwarded = match event {
            LinkEvent::Qr { payload } => {
                shared.set_status(ProviderStatus::Connecting);
                shared.events.send(ProviderEvent::Qr { payload }).await
            }
            LinkEvent::Open { identity } => {
                shared.set_status(ProviderStatus::Connected);
                *shared.identity.lock().unwrap() = Some(identity.clone());
                persist_creds_marker(&shared.auth_dir, &identity).await;
                shared
                    .events
                    .send(ProviderEvent::Connected {
                        phone_identity: identity,
                    })
                    .await
            }
            LinkEvent::Closed { cause } => {
                shared.set_status(ProviderStatus::Disconnected);
                *shared.identity.lock().unwrap() = None;
                let _ = shared.events.send(ProviderEvent::Closed { cause }).await;
                break;
            }
            LinkEvent::Message(frame) => {
                let inbound = normalize_frame(&shared.tenant, frame);
                shared.events.send(ProviderEvent::Inbound(inbound)).await
            }
        };
        // The owning session is gone; stop pumping.
        if forwarded.is_err() {
            break;
        }
    }
}

fn normalize_frame(tenant: &str, frame: InboundFrame) -> NormalizedInbound {
    let address = if frame.from.contains('@') {
        Address::Opaque(frame.from.clone())
    } else {
        Address::Phone(format!("+{}", frame.from))
    };
    let is_voice = frame.kind == MessageKind::Voice;
    NormalizedInbound {
        provider: ProviderKind::Socket,
        tenant: tenant.to_string(),
        message_id: frame.id,
        address,
        from: frame.from,
        timestamp: frame.timestamp,
        kind: frame.kind,
        content: frame.content,
        push_name: frame.push_name,
        is_voice,
        voice_transcript: frame.voice_transcript,
        voice_duration_seconds: frame.voice_duration_seconds,
    }
}

async fn persist_creds_marker(auth_dir: &Path, identity: &str) {
    let write = async {
        tokio::fs::create_dir_all(auth_dir).await?;
        let marker = serde_json::json!({
            "identity": identity,
            "updated_at": now_epoch_ms(),
        });
        tokio::fs::write(auth_dir.join(CREDS_FILE), marker.to_string()).await
    };
    if let Err(err) = write.await {
        warn!(error = %err, dir = %auth_dir.display(), "failed to persist socket credentials");
    }
}

/// Removes a tenant's persisted socket credentials. Missing directories
/// are fine.
pub async fn purge_auth_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "purged socket credentials"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(error = %err, dir = %dir.display(), "failed to purge socket credentials"),
    }
}

#[async_trait]
impl Provider for SocketProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Socket
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::for_kind(ProviderKind::Socket)
    }

    async fn connect(&self) -> Result<ConnectOutcome, ProviderError> {
        self.teardown().await;
        self.shared.set_status(ProviderStatus::Connecting);

        let (link_tx, mut link_rx) = mpsc::channel(64);
        let handle = self
            .link
            .open(&self.shared.tenant, &self.shared.auth_dir, link_tx)
            .await
            .inspect_err(|_| self.shared.set_status(ProviderStatus::Disconnected))?;
        *self.handle.lock().await = Some(handle);

        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            let next = tokio::time::timeout_at(deadline, link_rx.recv()).await;
            match next {
                Ok(Some(LinkEvent::Qr { payload })) => {
                    self.spawn_pump(link_rx);
                    return Ok(ConnectOutcome::QrReady { qr: payload });
                }
                Ok(Some(LinkEvent::Open { identity })) => {
                    self.shared.set_status(ProviderStatus::Connected);
                    *self.shared.identity.lock().unwrap() = Some(identity.clone());
                    persist_creds_marker(&self.shared.auth_dir, &identity).await;
                    self.spawn_pump(link_rx);
                    return Ok(ConnectOutcome::Connected {
                        phone_identity: identity,
                    });
                }
                Ok(Some(LinkEvent::Closed { cause })) => {
                    self.teardown().await;
                    let err = match cause {
                        CloseCause::LoggedOut | CloseCause::BadSession => {
                            ProviderError::auth("socket closed during connect")
                        }
                        CloseCause::Other(reason) => ProviderError::other(reason),
                    };
                    return Err(err);
                }
                // Inbound traffic before the session is open is dropped.
                Ok(Some(LinkEvent::Message(_))) => continue,
                Ok(None) => {
                    self.teardown().await;
                    return Err(ProviderError::other("socket link ended during connect"));
                }
                Err(_) => {
                    self.teardown().await;
                    return Err(ProviderError::timeout("socket connect timed out"));
                }
            }
        }
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt, ProviderError> {
        self.deliver(Delivery::Text { to, body }).await
    }

    async fn send_template(
        &self,
        _to: &str,
        name: &str,
        _params: &[String],
        _language: &str,
    ) -> Result<SendReceipt, ProviderError> {
        Err(ProviderError::template_not_supported(format!(
            "socket provider cannot send template {name}"
        )))
    }

    async fn send_media(
        &self,
        to: &str,
        media: &MediaContent,
    ) -> Result<SendReceipt, ProviderError> {
        self.deliver(Delivery::Media { to, media }).await
    }

    fn status(&self) -> ProviderStatus {
        *self.shared.status.lock().unwrap()
    }

    fn phone_identity(&self) -> Option<String> {
        self.shared.identity.lock().unwrap().clone()
    }

    fn health(&self) -> HealthSnapshot {
        self.shared.metrics.snapshot()
    }
}

// ---------------------------------------------------------------------------
// Default link: HTTP long-polling against a local bridge process.

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Qr {
        payload: String,
    },
    Open {
        identity: String,
    },
    Closed {
        #[serde(default)]
        cause: String,
    },
    Message {
        #[serde(flatten)]
        frame: InboundFrame,
    },
}

impl From<BridgeEvent> for LinkEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Qr { payload } => LinkEvent::Qr { payload },
            BridgeEvent::Open { identity } => LinkEvent::Open { identity },
            BridgeEvent::Closed { cause } => LinkEvent::Closed {
                cause: match cause.as_str() {
                    "logged_out" => CloseCause::LoggedOut,
                    "bad_session" => CloseCause::BadSession,
                    other => CloseCause::Other(other.to_string()),
                },
            },
            BridgeEvent::Message { frame } => LinkEvent::Message(frame),
        }
    }
}

/// Socket transport backed by a bridge sidecar that owns the real upstream
/// socket. Events are long-polled; sends are plain POSTs.
pub struct HttpBridgeLink {
    http: reqwest::Client,
    base: String,
}

impl HttpBridgeLink {
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SocketLink for HttpBridgeLink {
    async fn open(
        &self,
        tenant: &str,
        auth_dir: &Path,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn LinkHandle>, ProviderError> {
        let session_url = format!("{}/sessions/{}", self.base, tenant);
        let response = self
            .http
            .post(&session_url)
            .json(&serde_json::json!({ "auth_dir": auth_dir.display().to_string() }))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|err| ProviderError::other(err.to_string()).with_source(err))?;
        if !response.status().is_success() {
            return Err(ProviderError::other(format!(
                "bridge refused session: status={}",
                response.status()
            )));
        }

        let poll_http = self.http.clone();
        let events_url = format!("{session_url}/events");
        let poll = tokio::spawn(async move {
            loop {
                let response = poll_http
                    .get(&events_url)
                    .timeout(Duration::from_secs(75))
                    .send()
                    .await;
                let batch: Vec<BridgeEvent> = match response {
                    Ok(response) if response.status().is_success() => {
                        response.json().await.unwrap_or_default()
                    }
                    Ok(response) if response.status().as_u16() == 404 => {
                        let _ = events
                            .send(LinkEvent::Closed {
                                cause: CloseCause::Other("bridge session gone".into()),
                            })
                            .await;
                        return;
                    }
                    Ok(_) | Err(_) => {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                for event in batch {
                    if events.send(event.into()).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::new(BridgeHandle {
            http: self.http.clone(),
            session_url,
            poll: Mutex::new(Some(poll)),
        }))
    }
}

struct BridgeHandle {
    http: reqwest::Client,
    session_url: String,
    poll: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeHandle {
    async fn post_send(&self, payload: serde_json::Value) -> Result<String, ProviderError> {
        let response = self
            .http
            .post(format!("{}/messages", self.session_url))
            .json(&payload)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|err| {
                let class = if err.is_timeout() {
                    ErrorClass::Timeout
                } else {
                    ErrorClass::Other
                };
                ProviderError::new(class, err.to_string()).with_source(err)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let class = match status.as_u16() {
                429 => ErrorClass::RateLimit,
                code if code >= 500 => ErrorClass::ServerError,
                400 => ErrorClass::InvalidPhone,
                _ => ErrorClass::Other,
            };
            return Err(ProviderError::new(
                class,
                format!("bridge send failed: status={} body={}", status, body),
            ));
        }

        let raw: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
        Ok(raw
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }
}

#[async_trait]
impl LinkHandle for BridgeHandle {
    async fn deliver_text(&self, to: &str, body: &str) -> Result<String, ProviderError> {
        self.post_send(serde_json::json!({ "to": to, "body": body }))
            .await
    }

    async fn deliver_media(
        &self,
        to: &str,
        media: &MediaContent,
    ) -> Result<String, ProviderError> {
        self.post_send(serde_json::json!({
            "to": to,
            "media": media,
        }))
        .await
    }

    async fn close(&self) {
        if let Some(poll) = self.poll.lock().unwrap().take() {
            poll.abort();
        }
        let _ = self
            .http
            .delete(&self.session_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
    }
}
