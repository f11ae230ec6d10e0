//! Client for the application backend's outbound queue: pull pending
//! messages, acknowledge per-message send status.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BackendSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One pending outbound message as the backend hands it out.
#[derive(Clone, Debug, Deserialize)]
pub struct PendingMessage {
    pub id: String,
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    pub content: String,
    #[serde(rename = "isLid", default)]
    pub is_lid: bool,
    #[serde(rename = "lidId", default)]
    pub lid_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PendingResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    messages: Vec<PendingMessage>,
}

#[derive(Serialize)]
struct MarkSentRequest<'a> {
    ids: &'a [String],
    status: &'a str,
    #[serde(rename = "providerMessageId", skip_serializing_if = "Option::is_none")]
    provider_message_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Connection refused or timed out; the poller treats these as silent.
    #[error("backend unreachable")]
    Unreachable,
    #[error("backend request failed: {0}")]
    Failed(String),
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base: String,
    key: String,
}

impl BackendClient {
    pub fn new(http: reqwest::Client, settings: &BackendSettings) -> Self {
        Self {
            http,
            base: settings.url.trim_end_matches('/').to_string(),
            key: settings.key.clone(),
        }
    }

    fn classify(err: reqwest::Error) -> BackendError {
        if err.is_timeout() || err.is_connect() {
            BackendError::Unreachable
        } else {
            BackendError::Failed(err.to_string())
        }
    }

    pub async fn pending_messages(&self, tenant: &str) -> Result<Vec<PendingMessage>, BackendError> {
        let response = self
            .http
            .get(format!("{}/pending-messages", self.base))
            .query(&[("tenantId", tenant)])
            .bearer_auth(&self.key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(Self::classify)?;

        if !response.status().is_success() {
            return Err(BackendError::Failed(format!(
                "pending-messages status={}",
                response.status()
            )));
        }

        let body: PendingResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Failed(err.to_string()))?;
        if !body.success {
            return Err(BackendError::Failed("pending-messages success=false".into()));
        }
        Ok(body.messages)
    }

    pub async fn mark_sent(
        &self,
        ids: &[String],
        status: &str,
        provider_message_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), BackendError> {
        let response = self
            .http
            .post(format!("{}/mark-sent", self.base))
            .bearer_auth(&self.key)
            .timeout(REQUEST_TIMEOUT)
            .json(&MarkSentRequest {
                ids,
                status,
                provider_message_id,
                error,
            })
            .send()
            .await
            .map_err(Self::classify)?;

        if !response.status().is_success() {
            return Err(BackendError::Failed(format!(
                "mark-sent status={}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_message_parses_opaque_fields() {
        let raw = r#"{"id":"42","phoneNumber":"+141555","content":"hi","isLid":true,"lidId":"9@lid"}"#;
        let msg: PendingMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.is_lid);
        assert_eq!(msg.lid_id.as_deref(), Some("9@lid"));
    }

    #[test]
    fn pending_message_defaults_opaque_fields() {
        let raw = r#"{"id":"42","phoneNumber":"+141555","content":"hi"}"#;
        let msg: PendingMessage = serde_json::from_str(raw).unwrap();
        assert!(!msg.is_lid);
        assert_eq!(msg.lid_id, None);
    }

    #[test]
    fn mark_sent_request_skips_absent_fields() {
        let ids = vec!["1".to_string()];
        let body = serde_json::to_value(MarkSentRequest {
            ids: &ids,
            status: "sent",
            provider_message_id: Some("wamid.9"),
            error: None,
        })
        .unwrap();
        assert_eq!(body["status"], "sent");
        assert_eq!(body["providerMessageId"], "wamid.9");
        assert!(body.get("error").is_none());
    }
}
