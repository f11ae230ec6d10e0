use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ProviderKind;

/// Credentials for the official cloud (HTTP) provider. Opaque to the
/// session layer; the cloud provider and the platform webhook consume them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudCredentials {
    pub phone_id: String,
    pub access_token: String,
    /// Token echoed back during platform webhook verification.
    pub verify_token: String,
    /// Secret used to check inbound webhook signatures.
    pub app_secret: String,
}

/// Which fallback triggers are armed. All default to true.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FallbackTriggers {
    pub timeout: bool,
    pub rate_limit: bool,
    pub template_error: bool,
    pub server_error: bool,
}

impl Default for FallbackTriggers {
    fn default() -> Self {
        Self {
            timeout: true,
            rate_limit: true,
            template_error: true,
            server_error: true,
        }
    }
}

/// Send-router fallback policy.
#[derive(Clone, Debug)]
pub struct FallbackSettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub triggers: FallbackTriggers,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            triggers: FallbackTriggers::default(),
        }
    }
}

impl FallbackSettings {
    /// Per-provider retry budget: the configured budget when fallback is
    /// enabled, otherwise a single attempt.
    pub fn retry_budget(&self) -> u32 {
        if self.enabled {
            self.max_retries.max(1)
        } else {
            1
        }
    }
}

/// Outbound poller schedule.
#[derive(Clone, Debug)]
pub struct PollingSettings {
    pub interval: Duration,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
        }
    }
}

/// Which providers are available for sessions and in what order.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub primary: ProviderKind,
    pub cloud_enabled: bool,
    pub socket_enabled: bool,
    pub cloud_credentials: Option<CloudCredentials>,
    /// Root directory holding one opaque credential directory per tenant.
    pub auth_root: PathBuf,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            primary: ProviderKind::Socket,
            cloud_enabled: true,
            socket_enabled: true,
            cloud_credentials: None,
            auth_root: PathBuf::from("auth"),
        }
    }
}

impl ProviderSettings {
    /// Providers usable under this configuration. Cloud requires
    /// credentials and not being disabled; socket only requires not being
    /// disabled.
    pub fn available(&self) -> Vec<ProviderKind> {
        let mut out = Vec::with_capacity(2);
        if self.cloud_enabled && self.cloud_credentials.is_some() {
            out.push(ProviderKind::Cloud);
        }
        if self.socket_enabled {
            out.push(ProviderKind::Socket);
        }
        out
    }

    /// Priority order `[primary, fallback]`, filtered down to available
    /// providers. Deterministic for a given configuration.
    pub fn priority(&self) -> Vec<ProviderKind> {
        let available = self.available();
        let mut out = Vec::with_capacity(2);
        for kind in [self.primary, self.primary.other()] {
            if available.contains(&kind) {
                out.push(kind);
            }
        }
        out
    }
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

    #[test]
    fn cloud_requires_credentials() {
        let settings = ProviderSettings {
            primary: ProviderKind::Cloud,
            ..ProviderSettings::default()
        };
        assert_eq!(settings.available(), vec![ProviderKind::Socket]);
        assert_eq!(settings.priority(), vec![ProviderKind::Socket]);
    }

    #[test]
    fn priority_puts_primary_first_and_fallback_second() {
        let settings = ProviderSettings {
            primary: ProviderKind::Cloud,
            cloud_credentials: Some(creds()),
            ..ProviderSettings::default()
        };
        assert_eq!(
            settings.priority(),
            vec![ProviderKind::Cloud, ProviderKind::Socket]
        );
    }

    #[test]
    fn disabled_fallback_is_filtered_out() {
        let settings = ProviderSettings {
            primary: ProviderKind::Cloud,
            cloud_credentials: Some(creds()),
            socket_enabled: false,
            ..ProviderSettings::default()
        };
        assert_eq!(settings.priority(), vec![ProviderKind::Cloud]);
    }

    #[test]
    fn retry_budget_collapses_to_one_when_fallback_disabled() {
        let mut fallback = FallbackSettings::default();
        assert_eq!(fallback.retry_budget(), 3);
        fallback.enabled = false;
        assert_eq!(fallback.retry_budget(), 1);
    }
}
