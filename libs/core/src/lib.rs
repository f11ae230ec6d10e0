//! Courier core contracts and value types.
//!
//! This crate exposes the shared data structures exchanged between the
//! session supervisor, the send router, the providers, and the webhook
//! forwarder: normalized inbound messages, send content, the provider error
//! taxonomy, and the settings blocks read from the environment.

pub mod error;
pub mod settings;
pub mod types;

pub use error::{ErrorClass, ProviderError};
pub use settings::{
    CloudCredentials, FallbackSettings, FallbackTriggers, PollingSettings, ProviderSettings,
};
pub use types::{
    now_epoch_ms, now_epoch_secs, Address, MediaContent, MediaKind, MessageKind, NormalizedInbound,
    ProviderKind, SendContent, SendReceipt, SessionStatus, WebhookPayload,
};
