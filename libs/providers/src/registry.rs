use std::sync::Arc;

use courier_core::{ProviderError, ProviderKind, ProviderSettings};

use crate::cloud::CloudProvider;
use crate::socket::{HttpBridgeLink, SocketLink, SocketProvider};
use crate::traits::{EventSender, Provider};

/// Builds provider instances for sessions. The supervisor depends on this
/// seam so tests can substitute scripted providers.
pub trait ProviderFactory: Send + Sync {
    /// Deterministic priority order `[primary, fallback]` over the
    /// providers available under the current configuration.
    fn priority(&self) -> Vec<ProviderKind>;

    fn build(
        &self,
        tenant: &str,
        kind: ProviderKind,
        events: EventSender,
    ) -> Result<Arc<dyn Provider>, ProviderError>;
}

/// Production factory: cloud providers from the configured credentials,
/// socket providers over the bridge link.
pub struct DefaultProviderFactory {
    settings: ProviderSettings,
    http: reqwest::Client,
    cloud_api_base: String,
    link: Arc<dyn SocketLink>,
}

impl DefaultProviderFactory {
    pub fn new(
        settings: ProviderSettings,
        http: reqwest::Client,
        cloud_api_base: impl Into<String>,
        bridge_base: impl Into<String>,
    ) -> Self {
        let link = Arc::new(HttpBridgeLink::new(http.clone(), bridge_base));
        Self {
            settings,
            http,
            cloud_api_base: cloud_api_base.into(),
            link,
        }
    }

    /// Overrides the socket transport; used by deployments that embed the
    /// upstream socket differently.
    pub fn with_link(mut self, link: Arc<dyn SocketLink>) -> Self {
        self.link = link;
        self
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn priority(&self) -> Vec<ProviderKind> {
        self.settings.priority()
    }

    fn build(
        &self,
        tenant: &str,
        kind: ProviderKind,
        events: EventSender,
    ) -> Result<Arc<dyn Provider>, ProviderError> {
        match kind {
            ProviderKind::Cloud => {
                let creds = self
                    .settings
                    .cloud_credentials
                    .clone()
                    .ok_or_else(|| ProviderError::auth("cloud credentials not configured"))?;
                Ok(Arc::new(CloudProvider::new(
                    tenant,
                    creds,
                    self.http.clone(),
                    self.cloud_api_base.clone(),
                )))
            }
            ProviderKind::Socket => Ok(Arc::new(SocketProvider::new(
                tenant,
                self.settings.auth_root.join(tenant),
                Arc::clone(&self.link),
                events,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::CloudCredentials;
    use tokio::sync::mpsc;

    fn factory(settings: ProviderSettings) -> DefaultProviderFactory {
        DefaultProviderFactory::new(
            settings,
            reqwest::Client::new(),
            "mock://cloud",
            "http://127.0.0.1:1",
        )
    }

    fn creds() -> CloudCredentials {
        CloudCredentials {
            phone_id: "1001".into(),
            access_token: "token".into(),
            verify_token: "verify".into(),
            app_secret: "secret".into(),
        }
    }

    #[test]
    fn priority_follows_settings() {
        let factory = factory(ProviderSettings {
            primary: ProviderKind::Cloud,
            cloud_credentials: Some(creds()),
            ..ProviderSettings::default()
        });
        assert_eq!(
            factory.priority(),
            vec![ProviderKind::Cloud, ProviderKind::Socket]
        );
    }

    #[tokio::test]
    async fn builds_both_provider_kinds() {
        let factory = factory(ProviderSettings {
            primary: ProviderKind::Cloud,
            cloud_credentials: Some(creds()),
            ..ProviderSettings::default()
        });
        let (tx, _rx) = mpsc::channel(4);
        let cloud = factory.build("acme", ProviderKind::Cloud, tx.clone()).unwrap();
        assert_eq!(cloud.kind(), ProviderKind::Cloud);
        let socket = factory.build("acme", ProviderKind::Socket, tx).unwrap();
        assert_eq!(socket.kind(), ProviderKind::Socket);
    }

    #[tokio::test]
    async fn cloud_build_without_credentials_fails() {
        let factory = factory(ProviderSettings::default());
        let (tx, _rx) = mpsc::channel(4);
        let err = factory
            .build("acme", ProviderKind::Cloud, tx)
            .err()
            .expect("missing credentials");
        assert_eq!(err.class(), courier_core::ErrorClass::AuthError);
    }
}
