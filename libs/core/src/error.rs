use std::error::Error;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::settings::FallbackTriggers;

/// Normalized classification of provider failures.
///
/// Raw upstream errors are classified exactly once, at the provider
/// boundary; everything downstream (the send router, the poller, the admin
/// surface) decides behavior from the class alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimit,
    TemplateError,
    ServerError,
    Timeout,
    InvalidPhone,
    AuthError,
    TemplateNotSupported,
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::TemplateError => "template_error",
            ErrorClass::ServerError => "server_error",
            ErrorClass::Timeout => "timeout",
            ErrorClass::InvalidPhone => "invalid_phone",
            ErrorClass::AuthError => "auth_error",
            ErrorClass::TemplateNotSupported => "template_not_supported",
            ErrorClass::Other => "other",
        }
    }

    /// Whether the same provider may be retried after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorClass::RateLimit | ErrorClass::ServerError | ErrorClass::Timeout => true,
            // Unknown failures get the local retry budget before surfacing.
            ErrorClass::Other => true,
            ErrorClass::TemplateError
            | ErrorClass::InvalidPhone
            | ErrorClass::AuthError
            | ErrorClass::TemplateNotSupported => false,
        }
    }

    /// Whether this failure ends the whole send: no local retry and no
    /// move to another provider.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorClass::InvalidPhone | ErrorClass::AuthError)
    }

    /// Whether this failure moves the send to the next provider in priority
    /// order, under the configured trigger set.
    pub fn triggers_fallback(&self, triggers: &FallbackTriggers) -> bool {
        match self {
            ErrorClass::Timeout => triggers.timeout,
            ErrorClass::RateLimit => triggers.rate_limit,
            ErrorClass::TemplateError => triggers.template_error,
            ErrorClass::ServerError => triggers.server_error,
            ErrorClass::InvalidPhone
            | ErrorClass::AuthError
            | ErrorClass::TemplateNotSupported
            | ErrorClass::Other => false,
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error emitted by provider operations (connect and the send family).
///
/// Carries the normalized class plus a descriptive message; the raw
/// upstream error is attached as a source for debugging only and is never
/// re-inspected by callers.
#[derive(Debug)]
pub struct ProviderError {
    class: ErrorClass,
    message: String,
    source: Option<anyhow::Error>,
}

impl ProviderError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            source: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::AuthError, message)
    }

    pub fn template_not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::TemplateNotSupported, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Other, message)
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl Error for ProviderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|err| err.as_ref() as &(dyn Error + 'static))
    }
}
