//! ZRC Broker - session broker core for Zippy Remote Control.
//!
//! This crate implements:
//! - The session lifecycle state machine (create, start, PIN validation, join, stop)
//! - One-time PIN issuance and single-use validation
//! - Backend provider selection with fallback
//! - Session to provider connection tracking
//! - Audit records and configuration

#![forbid(unsafe_code)]

// Core state machine
pub mod session;
pub mod model;

// Credentials and backends
pub mod pin;
pub mod provider;
pub mod registry;
pub mod handles;
pub mod input;

// Infrastructure
pub mod store;
pub mod audit;
pub mod rate_limit;
pub mod locks;
pub mod clock;
pub mod config;

// Supporting modules
pub mod errors;
pub mod harness;

pub use config::BrokerConfig;
pub use errors::{ErrorKind, PinError, PinRejection, ProviderError, SessionError, StoreError};
pub use handles::{Liveness, SessionHandleRegistry};
pub use model::{CreateSessionRequest, Session, SessionId, SessionStatus};
pub use pin::PinAuthority;
pub use registry::ProviderRegistry;
pub use session::SessionBroker;
