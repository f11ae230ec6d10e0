//! Multi-tenant messaging gateway.
//!
//! Fronts a chat platform for many tenants: one supervised session per
//! tenant over two transport providers, a fallback send router, a durable
//! inbound-delivery queue, an outbound poller against the application
//! backend, and a webhook forwarder toward the application.

pub mod backend;
pub mod config;
pub mod forwarder;
pub mod http;
pub mod janitor;
pub mod main_logic;
pub mod poller;
pub mod router;
pub mod session;

pub use main_logic::run;
