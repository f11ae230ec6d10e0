use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use courier_core::{
    CloudCredentials, FallbackSettings, FallbackTriggers, PollingSettings, ProviderKind,
    ProviderSettings,
};

#[derive(Clone, Debug)]
pub struct BackendSettings {
    pub url: String,
    pub key: String,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub webhook_url: Option<String>,
    pub webhook_timeout: Duration,
    pub backend: Option<BackendSettings>,
    pub providers: ProviderSettings,
    pub fallback: FallbackSettings,
    pub polling: PollingSettings,
    pub cloud_api_base: String,
    pub bridge_base: String,
    pub queue_file: PathBuf,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("COURIER_ADDR").unwrap_or_else(|_| "0.0.0.0".into());
        let port = std::env::var("COURIER_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(8080);
        let ip = IpAddr::from_str(&host).context("invalid COURIER_ADDR")?;

        let primary = match std::env::var("PRIMARY_PROVIDER")
            .unwrap_or_else(|_| "socket".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "cloud" => ProviderKind::Cloud,
            "socket" => ProviderKind::Socket,
            other => bail!("PRIMARY_PROVIDER must be `cloud` or `socket`, got `{other}`"),
        };

        let cloud_credentials = match (
            std::env::var("CLOUD_PHONE_ID").ok(),
            std::env::var("CLOUD_ACCESS_TOKEN").ok(),
        ) {
            (Some(phone_id), Some(access_token)) => Some(CloudCredentials {
                phone_id,
                access_token,
                verify_token: std::env::var("CLOUD_VERIFY_TOKEN").unwrap_or_default(),
                app_secret: std::env::var("CLOUD_APP_SECRET").unwrap_or_default(),
            }),
            _ => None,
        };

        let providers = ProviderSettings {
            primary,
            cloud_enabled: env_bool("CLOUD_ENABLED", true),
            socket_enabled: env_bool("SOCKET_ENABLED", true),
            cloud_credentials,
            auth_root: PathBuf::from(std::env::var("AUTH_ROOT").unwrap_or_else(|_| "auth".into())),
        };

        let fallback = FallbackSettings {
            enabled: env_bool("FALLBACK_ENABLED", true),
            max_retries: env_u64("FALLBACK_MAX_RETRIES", 3)? as u32,
            retry_delay: Duration::from_millis(env_u64("FALLBACK_RETRY_DELAY_MS", 1000)?),
            triggers: FallbackTriggers {
                timeout: env_bool("FALLBACK_ON_TIMEOUT", true),
                rate_limit: env_bool("FALLBACK_ON_RATE_LIMIT", true),
                template_error: env_bool("FALLBACK_ON_TEMPLATE_ERROR", true),
                server_error: env_bool("FALLBACK_ON_SERVER_ERROR", true),
            },
        };

        let backend = match std::env::var("BACKEND_URL") {
            Ok(url) if !url.is_empty() => Some(BackendSettings {
                url: url.trim_end_matches('/').to_string(),
                key: std::env::var("BACKEND_KEY").unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            webhook_url: std::env::var("WEBHOOK_URL").ok().filter(|u| !u.is_empty()),
            webhook_timeout: Duration::from_millis(env_u64("WEBHOOK_TIMEOUT_MS", 15_000)?),
            backend,
            providers,
            fallback,
            polling: PollingSettings {
                interval: Duration::from_millis(env_u64("POLL_INTERVAL_MS", 5_000)?),
            },
            cloud_api_base: std::env::var("CLOUD_API_BASE")
                .unwrap_or_else(|_| "https://graph.facebook.com/v19.0".into()),
            bridge_base: std::env::var("SOCKET_BRIDGE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3001".into()),
            queue_file: PathBuf::from(
                std::env::var("QUEUE_FILE").unwrap_or_else(|_| "delivery-queue.json".into()),
            ),
        })
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("{name} must be an integer")),
        Err(_) => Ok(default),
    }
}
