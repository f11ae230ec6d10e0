#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use courier_core::{
    Address, ErrorClass, FallbackSettings, MediaContent, MessageKind, NormalizedInbound,
    PollingSettings, ProviderError, ProviderKind, SendReceipt,
};
use courier_gateway::forwarder::Forwarder;
use courier_gateway::session::{Supervisor, SupervisorDeps};
use courier_providers::{
    Capabilities, ConnectOutcome, EventSender, HealthMetrics, HealthSnapshot, Provider,
    ProviderEvent, ProviderFactory, ProviderStatus,
};
use courier_queue::DeliveryQueue;

/// Scripted connect step: either an outcome or a failure class.
pub type ConnectStep = Result<ConnectOutcome, ErrorClass>;
/// Scripted send step: either a message id or a failure class.
pub type SendStep = Result<String, ErrorClass>;

/// Provider double driven entirely by scripts. Unscripted calls succeed.
pub struct ScriptedProvider {
    kind: ProviderKind,
    connect_script: Mutex<VecDeque<ConnectStep>>,
    send_script: Mutex<VecDeque<SendStep>>,
    fail_connects: AtomicBool,
    connect_calls: AtomicU32,
    connect_instants: Mutex<Vec<tokio::time::Instant>>,
    pub sent: Mutex<Vec<(String, String)>>,
    status: Mutex<ProviderStatus>,
    identity: Mutex<Option<String>>,
    metrics: HealthMetrics,
    events: Mutex<Option<EventSender>>,
}

impl ScriptedProvider {
    fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            connect_script: Mutex::new(VecDeque::new()),
            send_script: Mutex::new(VecDeque::new()),
            fail_connects: AtomicBool::new(false),
            connect_calls: AtomicU32::new(0),
            connect_instants: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            status: Mutex::new(ProviderStatus::Disconnected),
            identity: Mutex::new(None),
            metrics: HealthMetrics::new(),
            events: Mutex::new(None),
        }
    }

    pub fn push_connect(&self, step: ConnectStep) {
        self.connect_script.lock().unwrap().push_back(step);
    }

    pub fn push_send(&self, step: SendStep) {
        self.send_script.lock().unwrap().push_back(step);
    }

    /// Every connect fails until further notice.
    pub fn fail_connects_forever(&self) {
        self.fail_connects.store(true, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// When each connect attempt started, on the runtime clock. Under a
    /// paused clock the gaps between entries are exactly the scheduled
    /// reconnect delays.
    pub fn connect_instants(&self) -> Vec<tokio::time::Instant> {
        self.connect_instants.lock().unwrap().clone()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.metrics.snapshot()
    }

    /// Pushes an event toward the owning session.
    pub async fn emit(&self, event: ProviderEvent) {
        let sender = self.events.lock().unwrap().clone();
        if let Some(sender) = sender {
            sender.send(event).await.expect("session inbox closed");
        }
    }

    fn next_send(&self) -> SendStep {
        self.send_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("{}-msg", self.kind)))
    }

    fn record(&self, step: SendStep, to: &str, body: &str) -> Result<SendReceipt, ProviderError> {
        match step {
            Ok(message_id) => {
                self.metrics.record_success(5.0);
                self.sent
                    .lock()
                    .unwrap()
                    .push((to.to_string(), body.to_string()));
                Ok(SendReceipt {
                    message_id,
                    provider: self.kind,
                })
            }
            Err(class) => {
                self.metrics.record_failure();
                Err(ProviderError::new(class, "scripted failure"))
            }
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::for_kind(self.kind)
    }

    async fn connect(&self) -> Result<ConnectOutcome, ProviderError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.connect_instants
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        let step = if self.fail_connects.load(Ordering::SeqCst) {
            Err(ErrorClass::Other)
        } else {
            self.connect_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(ConnectOutcome::Connected {
                        phone_identity: format!("{}-identity", self.kind),
                    })
                })
        };
        match step {
            Ok(outcome) => {
                match &outcome {
                    ConnectOutcome::Connected { phone_identity } => {
                        *self.status.lock().unwrap() = ProviderStatus::Connected;
                        *self.identity.lock().unwrap() = Some(phone_identity.clone());
                    }
                    ConnectOutcome::QrReady { .. } => {
                        *self.status.lock().unwrap() = ProviderStatus::Connecting;
                    }
                }
                Ok(outcome)
            }
            Err(class) => {
                *self.status.lock().unwrap() = ProviderStatus::Disconnected;
                Err(ProviderError::new(class, "scripted connect failure"))
            }
        }
    }

    async fn disconnect(&self) {
        *self.status.lock().unwrap() = ProviderStatus::Disconnected;
        *self.identity.lock().unwrap() = None;
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt, ProviderError> {
        self.record(self.next_send(), to, body)
    }

    async fn send_template(
        &self,
        to: &str,
        name: &str,
        _params: &[String],
        _language: &str,
    ) -> Result<SendReceipt, ProviderError> {
        if !self.capabilities().supports_templates {
            return Err(ProviderError::template_not_supported(
                "scripted provider rejects templates",
            ));
        }
        self.record(self.next_send(), to, name)
    }

    async fn send_media(
        &self,
        to: &str,
        media: &MediaContent,
    ) -> Result<SendReceipt, ProviderError> {
        self.record(self.next_send(), to, &media.url)
    }

    fn status(&self) -> ProviderStatus {
        *self.status.lock().unwrap()
    }

    fn phone_identity(&self) -> Option<String> {
        self.identity.lock().unwrap().clone()
    }

    fn health(&self) -> HealthSnapshot {
        self.metrics.snapshot()
    }
}

/// Factory handing out shared scripted providers so tests can script them
/// before the session builds them.
pub struct ScriptedFactory {
    priority: Vec<ProviderKind>,
    providers: Mutex<HashMap<(String, ProviderKind), Arc<ScriptedProvider>>>,
}

impl ScriptedFactory {
    pub fn new(priority: Vec<ProviderKind>) -> Self {
        Self {
            priority,
            providers: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self, tenant: &str, kind: ProviderKind) -> Arc<ScriptedProvider> {
        Arc::clone(
            self.providers
                .lock()
                .unwrap()
                .entry((tenant.to_string(), kind))
                .or_insert_with(|| Arc::new(ScriptedProvider::new(kind))),
        )
    }
}

impl ProviderFactory for ScriptedFactory {
    fn priority(&self) -> Vec<ProviderKind> {
        self.priority.clone()
    }

    fn build(
        &self,
        tenant: &str,
        kind: ProviderKind,
        events: EventSender,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        let provider = self.provider(tenant, kind);
        *provider.events.lock().unwrap() = Some(events);
        Ok(provider)
    }
}

pub struct TestGateway {
    pub supervisor: Supervisor,
    pub factory: Arc<ScriptedFactory>,
    pub forwarder: Forwarder,
    pub queue: DeliveryQueue,
    pub fallback: FallbackSettings,
    pub auth_root: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

pub async fn gateway(priority: Vec<ProviderKind>, webhook_url: Option<String>) -> TestGateway {
    let tmp = tempfile::tempdir().unwrap();
    let queue = DeliveryQueue::load(tmp.path().join("queue.json")).await;
    let forwarder = Forwarder::new(
        reqwest::Client::new(),
        webhook_url,
        Duration::from_secs(2),
        queue.clone(),
    );
    let factory = Arc::new(ScriptedFactory::new(priority));
    let fallback = FallbackSettings {
        retry_delay: Duration::from_millis(10),
        ..FallbackSettings::default()
    };
    let auth_root = tmp.path().join("auth");
    let supervisor = Supervisor::new(SupervisorDeps {
        factory: Arc::clone(&factory) as Arc<dyn ProviderFactory>,
        forwarder: forwarder.clone(),
        backend: None,
        fallback: fallback.clone(),
        polling: PollingSettings::default(),
        auth_root: auth_root.clone(),
    });
    TestGateway {
        supervisor,
        factory,
        forwarder,
        queue,
        fallback,
        auth_root,
        _tmp: tmp,
    }
}

pub fn inbound(tenant: &str, id: &str) -> NormalizedInbound {
    NormalizedInbound {
        provider: ProviderKind::Socket,
        tenant: tenant.into(),
        message_id: id.into(),
        from: "14155550000".into(),
        address: Address::Phone("+14155550000".into()),
        timestamp: 1_700_000_000,
        kind: MessageKind::Text,
        content: "hello".into(),
        push_name: Some("Ada".into()),
        is_voice: false,
        voice_transcript: None,
        voice_duration_seconds: None,
    }
}

/// Polls `probe` until it returns true or the deadline passes. Works under
/// both real and paused clocks.
pub async fn wait_until<F, Fut>(deadline: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let step = Duration::from_millis(25);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if probe().await {
            return true;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    probe().await
}
