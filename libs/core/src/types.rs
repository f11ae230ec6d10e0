use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Current wall-clock time as seconds since the Unix epoch.
pub fn now_epoch_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Transport providers the gateway can drive for a tenant.
///
/// `Cloud` is the official credential-authenticated HTTP provider; `Socket`
/// is the QR-authenticated socket provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Cloud,
    Socket,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Cloud => "cloud",
            ProviderKind::Socket => "socket",
        }
    }

    /// The other provider, used when resolving the fallback entry of the
    /// priority order.
    pub fn other(&self) -> ProviderKind {
        match self {
            ProviderKind::Cloud => ProviderKind::Socket,
            ProviderKind::Socket => ProviderKind::Cloud,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of a tenant session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    QrReady,
    Connecting,
    Connected,
    Reconnecting,
    LoggedOut,
    Failed,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::QrReady => "qr_ready",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Reconnecting => "reconnecting",
            SessionStatus::LoggedOut => "logged_out",
            SessionStatus::Failed => "failed",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message kinds reported by providers for inbound traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Voice,
    Document,
    Sticker,
    Location,
    Contact,
    Interactive,
    Unknown,
}

/// Sender address of an inbound message.
///
/// Exactly one representation applies: either the platform resolved the
/// sender to an E.164 phone number, or it handed us an opaque identifier
/// that is not a phone number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    Phone(String),
    Opaque(String),
}

impl Address {
    pub fn resolved_phone(&self) -> Option<&str> {
        match self {
            Address::Phone(phone) => Some(phone),
            Address::Opaque(_) => None,
        }
    }

    pub fn opaque_id(&self) -> Option<&str> {
        match self {
            Address::Phone(_) => None,
            Address::Opaque(id) => Some(id),
        }
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Address::Opaque(_))
    }
}

/// Canonical inbound message, normalized at the provider boundary before it
/// reaches the webhook forwarder or the delivery queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizedInbound {
    pub provider: ProviderKind,
    pub tenant: String,
    pub message_id: String,
    /// Raw sender address as the platform delivered it.
    pub from: String,
    pub address: Address,
    /// Epoch seconds.
    pub timestamp: i64,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub is_voice: bool,
    #[serde(default)]
    pub voice_transcript: Option<String>,
    #[serde(default)]
    pub voice_duration_seconds: Option<u32>,
}

impl NormalizedInbound {
    /// Builds the application webhook payload for this message.
    pub fn webhook_payload(&self) -> WebhookPayload {
        WebhookPayload {
            kind: "message".into(),
            tenant_id: self.tenant.clone(),
            phone: self.address.resolved_phone().map(|p| p.to_string()),
            message: self.content.clone(),
            customer_name: self.push_name.clone(),
            whatsapp_message_id: self.message_id.clone(),
            is_lid: self.address.is_opaque(),
            lid_id: self.address.opaque_id().map(|id| id.to_string()),
            is_voice_message: self.is_voice,
            voice_transcription: self.voice_transcript.clone(),
            voice_duration_seconds: self.voice_duration_seconds,
            provider: self.provider.as_str().to_string(),
        }
    }
}

/// Payload POSTed to the application webhook. The field names are the
/// application's schema and must stay stable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    /// E.164 with leading `+`, or null for opaque addresses.
    pub phone: Option<String>,
    pub message: String,
    #[serde(rename = "customerName")]
    pub customer_name: Option<String>,
    #[serde(rename = "whatsappMessageId")]
    pub whatsapp_message_id: String,
    #[serde(rename = "isLid")]
    pub is_lid: bool,
    #[serde(rename = "lidId")]
    pub lid_id: Option<String>,
    #[serde(rename = "isVoiceMessage")]
    pub is_voice_message: bool,
    #[serde(rename = "voiceTranscription")]
    pub voice_transcription: Option<String>,
    #[serde(rename = "voiceDurationSeconds")]
    pub voice_duration_seconds: Option<u32>,
    pub provider: String,
}

/// Media kinds servable through `send_media`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }
}

/// Outbound media attachment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaContent {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// What to send. Template sends carry the pre-approved template name plus
/// positional body parameters.
#[derive(Clone, Debug)]
pub enum SendContent {
    Text {
        body: String,
    },
    Template {
        name: String,
        params: Vec<String>,
        language: String,
    },
    Media(MediaContent),
}

impl SendContent {
    pub fn is_template(&self) -> bool {
        matches!(self, SendContent::Template { .. })
    }
}

/// Result of a successful send: the platform message id and the provider
/// that carried it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub provider: ProviderKind,
}
