//! Official cloud (HTTP) provider: credential-authenticated REST sends and
//! normalization of the platform's inbound webhook payloads.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::debug;

use courier_core::{
    Address, CloudCredentials, ErrorClass, MediaContent, MessageKind, NormalizedInbound,
    ProviderError, ProviderKind, SendReceipt,
};

use crate::health::{HealthMetrics, HealthSnapshot};
use crate::traits::{Capabilities, ConnectOutcome, Provider, ProviderStatus};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct CloudProvider {
    tenant: String,
    creds: CloudCredentials,
    http: reqwest::Client,
    api_base: String,
    status: Mutex<ProviderStatus>,
    identity: Mutex<Option<String>>,
    metrics: HealthMetrics,
}

impl CloudProvider {
    pub fn new(
        tenant: impl Into<String>,
        creds: CloudCredentials,
        http: reqwest::Client,
        api_base: impl Into<String>,
    ) -> Self {
        let base: String = api_base.into();
        Self {
            tenant: tenant.into(),
            creds,
            http,
            api_base: base.trim_end_matches('/').to_string(),
            status: Mutex::new(ProviderStatus::Disconnected),
            identity: Mutex::new(None),
            metrics: HealthMetrics::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.api_base, self.creds.phone_id)
    }

    fn net(&self, err: reqwest::Error) -> ProviderError {
        let class = if err.is_timeout() {
            ErrorClass::Timeout
        } else {
            ErrorClass::Other
        };
        ProviderError::new(class, err.to_string()).with_source(err)
    }

    /// POSTs one message body and returns the platform message id.
    async fn post_message(&self, payload: Value) -> Result<String, ProviderError> {
        if self.api_base.starts_with("mock://") {
            return Ok(format!("mock:{}", self.creds.phone_id));
        }

        let response = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.creds.access_token)
            .timeout(SEND_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|err| self.net(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let class = classify_status(status.as_u16(), &body);
            return Err(ProviderError::new(
                class,
                format!("status={} body={}", status.as_u16(), body),
            ));
        }

        let raw: Value = response.json().await.unwrap_or(Value::Null);
        let message_id = raw
            .get("messages")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_default();
        Ok(message_id)
    }

    async fn dispatch(&self, payload: Value) -> Result<SendReceipt, ProviderError> {
        let start = Instant::now();
        match self.post_message(payload).await {
            Ok(message_id) => {
                self.metrics
                    .record_success(start.elapsed().as_secs_f64() * 1000.0);
                Ok(SendReceipt {
                    message_id,
                    provider: ProviderKind::Cloud,
                })
            }
            Err(err) => {
                self.metrics.record_failure();
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl Provider for CloudProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::for_kind(ProviderKind::Cloud)
    }

    async fn connect(&self) -> Result<ConnectOutcome, ProviderError> {
        *self.status.lock().unwrap() = ProviderStatus::Connecting;

        let identity = if self.api_base.starts_with("mock://") {
            self.creds.phone_id.clone()
        } else {
            // Validate the credentials by reading the phone node.
            let url = format!(
                "{}/{}?fields=display_phone_number",
                self.api_base, self.creds.phone_id
            );
            let response = self
                .http
                .get(url)
                .bearer_auth(&self.creds.access_token)
                .timeout(CONNECT_TIMEOUT)
                .send()
                .await
                .map_err(|err| {
                    *self.status.lock().unwrap() = ProviderStatus::Disconnected;
                    self.net(err)
                })?;

            let status = response.status();
            if !status.is_success() {
                *self.status.lock().unwrap() = ProviderStatus::Disconnected;
                let body = response.text().await.unwrap_or_default();
                let class = match status.as_u16() {
                    401 | 403 => ErrorClass::AuthError,
                    code if code >= 500 => ErrorClass::ServerError,
                    _ => ErrorClass::Other,
                };
                return Err(ProviderError::new(
                    class,
                    format!("credential check failed: status={} body={}", status, body),
                ));
            }

            let raw: Value = response.json().await.unwrap_or(Value::Null);
            raw.get("display_phone_number")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| self.creds.phone_id.clone())
        };

        *self.status.lock().unwrap() = ProviderStatus::Connected;
        *self.identity.lock().unwrap() = Some(identity.clone());
        debug!(tenant = %self.tenant, identity = %identity, "cloud provider connected");
        Ok(ConnectOutcome::Connected {
            phone_identity: identity,
        })
    }

    async fn disconnect(&self) {
        *self.status.lock().unwrap() = ProviderStatus::Disconnected;
        *self.identity.lock().unwrap() = None;
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt, ProviderError> {
        self.dispatch(json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "preview_url": true, "body": body }
        }))
        .await
    }

    async fn send_template(
        &self,
        to: &str,
        name: &str,
        params: &[String],
        language: &str,
    ) -> Result<SendReceipt, ProviderError> {
        self.dispatch(json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "template",
            "template": {
                "name": name,
                "language": { "code": language },
                "components": [
                    {
                        "type": "body",
                        "parameters": params.iter().map(|p| json!({
                            "type": "text",
                            "text": p
                        })).collect::<Vec<_>>()
                    }
                ]
            }
        }))
        .await
    }

    async fn send_media(
        &self,
        to: &str,
        media: &MediaContent,
    ) -> Result<SendReceipt, ProviderError> {
        let kind = media.kind.as_str();
        let mut attachment = json!({ "link": media.url });
        if let Some(caption) = &media.caption {
            attachment["caption"] = json!(caption);
        }
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": kind,
        });
        payload[kind] = attachment;
        self.dispatch(payload).await
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

/// Maps an unsuccessful send response onto the error taxonomy. Template
/// and recipient problems arrive as 400s and are told apart by the
/// platform error code embedded in the body.
pub fn classify_status(status: u16, body: &str) -> ErrorClass {
    if status == 429 {
        return ErrorClass::RateLimit;
    }
    if status >= 500 {
        return ErrorClass::ServerError;
    }
    if status == 401 || status == 403 {
        return ErrorClass::AuthError;
    }

    let code = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.get("code")).and_then(Value::as_i64));
    match code {
        Some(4) | Some(80007) | Some(130429) => ErrorClass::RateLimit,
        Some(c) if (132000..=132999).contains(&c) => ErrorClass::TemplateError,
        Some(131026) | Some(131030) => ErrorClass::InvalidPhone,
        Some(190) => ErrorClass::AuthError,
        _ => ErrorClass::Other,
    }
}

/// Pulls the phone id the platform addressed in an inbound webhook body;
/// used to route the payload to the owning session.
pub fn webhook_phone_id(value: &Value) -> Option<String> {
    value
        .get("entry")?
        .as_array()?
        .iter()
        .find_map(|entry| {
            entry.get("changes")?.as_array()?.iter().find_map(|change| {
                change
                    .get("value")?
                    .get("metadata")?
                    .get("phone_number_id")?
                    .as_str()
                    .map(|s| s.to_string())
            })
        })
}

/// Normalizes a platform webhook body into inbound messages, in the order
/// the platform delivered them.
pub fn normalize_webhook(tenant: &str, value: &Value) -> Vec<NormalizedInbound> {
    let mut out = Vec::new();
    let Some(entries) = value.get("entry").and_then(Value::as_array) else {
        return out;
    };

    for entry in entries {
        let Some(changes) = entry.get("changes").and_then(Value::as_array) else {
            continue;
        };
        for change in changes {
            let Some(value) = change.get("value") else {
                continue;
            };
            let push_name = value
                .get("contacts")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("profile"))
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            let Some(messages) = value.get("messages").and_then(Value::as_array) else {
                continue;
            };
            for message in messages {
                if let Some(normalized) = normalize_message(tenant, message, push_name.clone()) {
                    out.push(normalized);
                }
            }
        }
    }
    out
}

fn normalize_message(
    tenant: &str,
    message: &Value,
    push_name: Option<String>,
) -> Option<NormalizedInbound> {
    let from = message.get("from")?.as_str()?.to_string();
    let message_id = message
        .get("id")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("cloud:{from}"));
    let timestamp = message
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    let raw_kind = message.get("type").and_then(Value::as_str).unwrap_or("");
    let (kind, content, is_voice, voice_duration) = match raw_kind {
        "text" => (
            MessageKind::Text,
            text_at(message, &["text", "body"]),
            false,
            None,
        ),
        "image" => (
            MessageKind::Image,
            text_at(message, &["image", "caption"]),
            false,
            None,
        ),
        "video" => (
            MessageKind::Video,
            text_at(message, &["video", "caption"]),
            false,
            None,
        ),
        "sticker" => (MessageKind::Sticker, String::new(), false, None),
        "document" => (
            MessageKind::Document,
            text_at(message, &["document", "filename"]),
            false,
            None,
        ),
        "audio" => {
            let voice = message
                .get("audio")
                .and_then(|a| a.get("voice"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let kind = if voice {
                MessageKind::Voice
            } else {
                MessageKind::Audio
            };
            (kind, String::new(), voice, None)
        }
        "location" => {
            let lat = message
                .get("location")
                .and_then(|l| l.get("latitude"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let lon = message
                .get("location")
                .and_then(|l| l.get("longitude"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            (MessageKind::Location, format!("{lat},{lon}"), false, None)
        }
        "contacts" => {
            let name = message
                .get("contacts")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("name"))
                .and_then(|n| n.get("formatted_name"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            (MessageKind::Contact, name, false, None)
        }
        "interactive" => {
            let reply = message
                .get("interactive")
                .and_then(|i| i.get("button_reply").or_else(|| i.get("list_reply")))
                .and_then(|r| r.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            (MessageKind::Interactive, reply, false, None)
        }
        "button" => (
            MessageKind::Interactive,
            text_at(message, &["button", "text"]),
            false,
            None,
        ),
        _ => (MessageKind::Unknown, String::new(), false, None),
    };

    Some(NormalizedInbound {
        provider: ProviderKind::Cloud,
        tenant: tenant.to_string(),
        message_id,
        address: Address::Phone(format!("+{from}")),
        from,
        timestamp,
        kind,
        content,
        push_name,
        is_voice,
        voice_transcript: None,
        voice_duration_seconds: voice_duration,
    })
}

fn text_at(message: &Value, path: &[&str]) -> String {
    let mut cursor = message;
    for key in path {
        match cursor.get(key) {
            Some(next) => cursor = next,
            None => return String::new(),
        }
    }
    cursor.as_str().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> CloudCredentials {
        CloudCredentials {
            phone_id: "1001".into(),
            access_token: "token".into(),
            verify_token: "verify".into(),
            app_secret: "secret".into(),
        }
    }

    fn mock_provider() -> CloudProvider {
        CloudProvider::new("acme", creds(), reqwest::Client::new(), "mock://cloud")
    }

    #[tokio::test]
    async fn connect_resolves_connected_with_identity() {
        let provider = mock_provider();
        let outcome = provider.connect().await.unwrap();
        match outcome {
            ConnectOutcome::Connected { phone_identity } => assert_eq!(phone_identity, "1001"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(provider.status(), ProviderStatus::Connected);
        assert_eq!(provider.phone_identity().as_deref(), Some("1001"));
    }

    #[tokio::test]
    async fn send_text_records_success() {
        let provider = mock_provider();
        provider.connect().await.unwrap();
        let receipt = provider.send_text("+14155550000", "hi").await.unwrap();
        assert_eq!(receipt.provider, ProviderKind::Cloud);
        assert_eq!(receipt.message_id, "mock:1001");
        assert_eq!(provider.health().success_count, 1);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let provider = mock_provider();
        provider.connect().await.unwrap();
        provider.disconnect().await;
        provider.disconnect().await;
        assert_eq!(provider.status(), ProviderStatus::Disconnected);
        assert_eq!(provider.phone_identity(), None);
    }

    #[test]
    fn classify_maps_status_codes() {
        assert_eq!(classify_status(429, ""), ErrorClass::RateLimit);
        assert_eq!(classify_status(500, ""), ErrorClass::ServerError);
        assert_eq!(classify_status(503, ""), ErrorClass::ServerError);
        assert_eq!(classify_status(401, ""), ErrorClass::AuthError);
        assert_eq!(classify_status(400, "{}"), ErrorClass::Other);
    }

    #[test]
    fn classify_reads_platform_error_codes() {
        let template = r#"{"error":{"code":132001,"message":"template missing"}}"#;
        assert_eq!(classify_status(400, template), ErrorClass::TemplateError);
        let phone = r#"{"error":{"code":131026,"message":"not a valid recipient"}}"#;
        assert_eq!(classify_status(400, phone), ErrorClass::InvalidPhone);
        let throttled = r#"{"error":{"code":130429}}"#;
        assert_eq!(classify_status(400, throttled), ErrorClass::RateLimit);
    }

    fn sample_webhook() -> Value {
        serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": { "phone_number_id": "1001" },
                        "contacts": [{ "profile": { "name": "Ada" } }],
                        "messages": [
                            {
                                "id": "wamid.a",
                                "from": "14155550000",
                                "timestamp": "1700000000",
                                "type": "text",
                                "text": { "body": "hello" }
                            },
                            {
                                "id": "wamid.b",
                                "from": "14155550000",
                                "timestamp": "1700000001",
                                "type": "audio",
                                "audio": { "voice": true }
                            }
                        ]
                    }
                }]
            }]
        })
    }

    #[test]
    fn normalize_webhook_extracts_messages_in_order() {
        let messages = normalize_webhook("acme", &sample_webhook());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_id, "wamid.a");
        assert_eq!(messages[0].kind, MessageKind::Text);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[0].address.resolved_phone(), Some("+14155550000"));
        assert_eq!(messages[0].push_name.as_deref(), Some("Ada"));
        assert_eq!(messages[1].kind, MessageKind::Voice);
        assert!(messages[1].is_voice);
    }

    #[test]
    fn webhook_phone_id_reads_metadata() {
        assert_eq!(webhook_phone_id(&sample_webhook()).as_deref(), Some("1001"));
        assert_eq!(webhook_phone_id(&serde_json::json!({})), None);
    }

    #[test]
    fn interactive_reply_title_becomes_content() {
        let body = serde_json::json!({
            "entry": [{ "changes": [{ "value": { "messages": [{
                "id": "wamid.c",
                "from": "14155550000",
                "timestamp": "1700000002",
                "type": "interactive",
                "interactive": { "list_reply": { "id": "r1", "title": "Option A" } }
            }]}}]}]
        });
        let messages = normalize_webhook("acme", &body);
        assert_eq!(messages[0].kind, MessageKind::Interactive);
        assert_eq!(messages[0].content, "Option A");
    }
}
