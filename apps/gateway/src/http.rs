//! Thin HTTP layer: the admin surface over the core API and the platform
//! webhook for the cloud provider.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;

use courier_core::{CloudCredentials, MediaContent, SendContent};
use courier_providers::cloud;

use crate::forwarder::Forwarder;
use crate::router::SendRouter;
use crate::session::Supervisor;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub router: SendRouter,
    pub forwarder: Forwarder,
    pub cloud_creds: Option<CloudCredentials>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions/{tenant}", post(create_session))
        .route("/sessions/{tenant}", get(session_status))
        .route("/sessions/{tenant}", delete(disconnect_session))
        .route("/sessions/{tenant}/qr", get(session_qr))
        .route("/sessions/{tenant}/send", post(send_message))
        .route("/queue/drain", post(drain_queue))
        .route("/webhook/cloud", get(verify_webhook).post(receive_webhook))
        .with_state(state)
}

#[derive(Serialize)]
struct ApiErrorBody {
    error: String,
}

#[derive(Serialize)]
struct NotFoundBody {
    #[serde(rename = "tenantId")]
    tenant_id: String,
    status: &'static str,
}

fn not_found(tenant: String) -> Json<Value> {
    Json(
        serde_json::to_value(NotFoundBody {
            tenant_id: tenant,
            status: "not_found",
        })
        .unwrap_or(Value::Null),
    )
}

async fn healthz() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn create_session(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    let snapshot = state.supervisor.create_session(&tenant).await;
    Json(snapshot)
}

async fn session_status(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.snapshot(&tenant).await {
        Some(snapshot) => Json(serde_json::to_value(snapshot).unwrap_or(Value::Null)),
        None => not_found(tenant),
    }
}

async fn session_qr(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.snapshot(&tenant).await {
        Some(snapshot) => Json(serde_json::json!({
            "tenantId": snapshot.tenant,
            "status": snapshot.status,
            "qrPayload": snapshot.qr_payload,
        })),
        None => not_found(tenant),
    }
}

async fn disconnect_session(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> impl IntoResponse {
    if state.supervisor.disconnect_session(&tenant).await {
        Json(serde_json::json!({ "tenantId": tenant, "status": "disconnected" }))
    } else {
        not_found(tenant)
    }
}

#[derive(Deserialize)]
struct SendBody {
    to: String,
    text: Option<String>,
    #[serde(rename = "templateName")]
    template_name: Option<String>,
    #[serde(rename = "templateParams", default)]
    template_params: Vec<String>,
    #[serde(rename = "languageCode")]
    language_code: Option<String>,
    media: Option<MediaContent>,
}

async fn send_message(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(body): Json<SendBody>,
) -> Result<Json<courier_core::SendReceipt>, (StatusCode, Json<ApiErrorBody>)> {
    let content = if let Some(name) = body.template_name {
        SendContent::Template {
            name,
            params: body.template_params,
            language: body.language_code.unwrap_or_else(|| "en".into()),
        }
    } else if let Some(media) = body.media {
        SendContent::Media(media)
    } else if let Some(text) = body.text {
        SendContent::Text { body: text }
    } else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiErrorBody {
                error: "one of text, templateName or media is required".into(),
            }),
        ));
    };

    state
        .router
        .send(&tenant, &body.to, &content)
        .await
        .map(Json)
        .map_err(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorBody {
                    error: err.to_string(),
                }),
            )
        })
}

async fn drain_queue(State(state): State<AppState>) -> impl IntoResponse {
    let queued = state.forwarder.queue().len();
    let forwarder = state.forwarder.clone();
    tokio::spawn(async move { forwarder.process_queue().await });
    Json(serde_json::json!({ "queued": queued, "draining": true }))
}

#[derive(Deserialize)]
struct VerifyQs {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    token: Option<String>,
}

async fn verify_webhook(
    State(state): State<AppState>,
    Query(query): Query<VerifyQs>,
) -> impl IntoResponse {
    let Some(creds) = state.cloud_creds.as_ref() else {
        return (StatusCode::FORBIDDEN, "forbidden".to_string());
    };
    if query.mode.as_deref() == Some("subscribe")
        && query.token.as_deref() == Some(creds.verify_token.as_str())
    {
        (StatusCode::OK, query.challenge.unwrap_or_default())
    } else {
        (StatusCode::FORBIDDEN, "forbidden".to_string())
    }
}

async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    let Some(creds) = state.cloud_creds.as_ref() else {
        return StatusCode::FORBIDDEN;
    };
    if !verify_signature(&creds.app_secret, &headers, &body) {
        warn!("invalid platform webhook signature");
        return StatusCode::UNAUTHORIZED;
    }

    // Acknowledge first; processing happens off the request path.
    let supervisor = state.supervisor.clone();
    tokio::spawn(async move {
        let payload: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "unparsable platform webhook payload");
                return;
            }
        };
        let Some(phone_id) = cloud::webhook_phone_id(&payload) else {
            warn!("platform webhook payload without phone id");
            return;
        };
        // The owning session rewrites the tenant when it accepts the batch.
        let messages = cloud::normalize_webhook("", &payload);
        if messages.is_empty() {
            return;
        }
        supervisor.route_platform_inbound(&phone_id, messages).await;
    });

    StatusCode::OK
}

/// Checks the `X-Hub-Signature-256` header against the request body.
fn verify_signature(app_secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    let header = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Some(provided) = decode_hex(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).ok())
        .collect()
}
