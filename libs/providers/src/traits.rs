use async_trait::async_trait;
use tokio::sync::mpsc;

use courier_core::{MediaContent, NormalizedInbound, ProviderError, ProviderKind, SendReceipt};

use crate::health::HealthSnapshot;

/// Connection state of a single provider instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Static capability set of a provider variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_templates: bool,
    pub supports_interactive: bool,
    pub requires_qr_auth: bool,
    pub is_official: bool,
}

impl Capabilities {
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Cloud => Self {
                supports_templates: true,
                supports_interactive: true,
                requires_qr_auth: false,
                is_official: true,
            },
            ProviderKind::Socket => Self {
                supports_templates: false,
                supports_interactive: false,
                requires_qr_auth: true,
                is_official: false,
            },
        }
    }
}

/// How `connect` resolved. Credential-based providers come back
/// `Connected`; QR providers come back `QrReady` and report the eventual
/// `Connected` through the event channel.
#[derive(Clone, Debug)]
pub enum ConnectOutcome {
    Connected { phone_identity: String },
    QrReady { qr: String },
}

/// Why the upstream connection closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseCause {
    /// The platform logged the account out; credentials are gone for good.
    LoggedOut,
    /// The persisted session is unusable; credentials must be wiped before
    /// the next attempt.
    BadSession,
    Other(String),
}

/// Asynchronous events a provider pushes to its owning session.
#[derive(Debug)]
pub enum ProviderEvent {
    Qr { payload: String },
    Connected { phone_identity: String },
    Closed { cause: CloseCause },
    Inbound(NormalizedInbound),
}

/// Channel handed to a provider at construction; the owning session holds
/// the receiving side.
pub type EventSender = mpsc::Sender<ProviderEvent>;

/// One upstream transport bound to a tenant.
///
/// Send paths record their own success/failure into the provider's health
/// metrics; callers only classify behavior from the returned
/// [`ProviderError`] class.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Establishes the upstream session. Must resolve (or fail) within
    /// 60 s. May be called again after a disconnect.
    async fn connect(&self) -> Result<ConnectOutcome, ProviderError>;

    /// Idempotent teardown: releases I/O, cancels internal tasks and stops
    /// event emission.
    async fn disconnect(&self);

    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt, ProviderError>;

    async fn send_template(
        &self,
        to: &str,
        name: &str,
        params: &[String],
        language: &str,
    ) -> Result<SendReceipt, ProviderError>;

    async fn send_media(&self, to: &str, media: &MediaContent)
        -> Result<SendReceipt, ProviderError>;

    fn status(&self) -> ProviderStatus;

    /// Platform-assigned identity, available once connected.
    fn phone_identity(&self) -> Option<String>;

    fn health(&self) -> HealthSnapshot;

    /// Healthy iff connected and the observed failure ratio stays under
    /// the threshold (providers without observations count as healthy).
    fn is_healthy(&self) -> bool {
        self.status() == ProviderStatus::Connected && self.health().failure_ratio_ok()
    }
}
