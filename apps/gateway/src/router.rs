//! Send routing: capability promotion, health filtering, per-provider
//! retry budgets, and error-class-driven failover between providers.

use metrics::counter;
use tracing::{debug, warn};

use courier_core::{FallbackSettings, ProviderError, SendContent, SendReceipt};
use courier_providers::Provider;

use crate::session::Supervisor;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("no provider available")]
    NoProviderAvailable,
    #[error("template_not_supported: no installed provider serves templates")]
    TemplateNotSupported,
    #[error(transparent)]
    Send(#[from] ProviderError),
}

#[derive(Clone)]
pub struct SendRouter {
    supervisor: Supervisor,
    fallback: FallbackSettings,
}

impl SendRouter {
    pub fn new(supervisor: Supervisor, fallback: FallbackSettings) -> Self {
        Self {
            supervisor,
            fallback,
        }
    }

    pub async fn send(
        &self,
        tenant: &str,
        to: &str,
        content: &SendContent,
    ) -> Result<SendReceipt, RouteError> {
        let set = self
            .supervisor
            .candidates(tenant)
            .await
            .ok_or_else(|| RouteError::SessionNotFound(tenant.to_string()))?;
        let mut candidates = set.candidates;

        if content.is_template() {
            // Providers without template support cannot serve as fallbacks
            // for a template send either.
            candidates.retain(|provider| provider.capabilities().supports_templates);
            if candidates.is_empty() {
                return Err(RouteError::TemplateNotSupported);
            }
        }

        if candidates.is_empty() {
            return Err(RouteError::NoProviderAvailable);
        }

        let budget = self.fallback.retry_budget();
        let total = candidates.len();
        let mut last_error: Option<ProviderError> = None;

        for (index, provider) in candidates.iter().enumerate() {
            let others_remain = index + 1 < total;
            if !provider.is_healthy() && others_remain {
                debug!(
                    tenant,
                    provider = %provider.kind(),
                    "skipping unhealthy provider"
                );
                continue;
            }

            for retry in 0..budget {
                match dispatch(provider.as_ref(), to, content).await {
                    Ok(receipt) => return Ok(receipt),
                    Err(err) => {
                        let class = err.class();
                        warn!(
                            tenant,
                            provider = %provider.kind(),
                            class = %class,
                            retry,
                            error = %err,
                            "send attempt failed"
                        );
                        let falls_over = class.triggers_fallback(&self.fallback.triggers);
                        let retryable = class.is_retryable();
                        if class.is_terminal() {
                            return Err(RouteError::Send(err));
                        }
                        last_error = Some(err);

                        if falls_over {
                            counter!(
                                "courier_send_fallbacks_total",
                                "provider" => provider.kind().as_str()
                            )
                            .increment(1);
                            break;
                        }
                        if !retryable {
                            break;
                        }
                        if retry + 1 < budget {
                            tokio::time::sleep(self.fallback.retry_delay * (retry + 1)).await;
                        }
                    }
                }
            }
        }

        Err(last_error
            .map(RouteError::Send)
            .unwrap_or(RouteError::NoProviderAvailable))
    }
}

async fn dispatch(
    provider: &dyn Provider,
    to: &str,
    content: &SendContent,
) -> Result<SendReceipt, ProviderError> {
    match content {
        SendContent::Text { body } => provider.send_text(to, body).await,
        SendContent::Template {
            name,
            params,
            language,
        } => provider.send_template(to, name, params, language).await,
        SendContent::Media(media) => provider.send_media(to, media).await,
    }
}
