//! Backend provider contract.
//!
//! A provider owns the actual capture/input pipeline to a device. The broker
//! only ever talks to it through [`RemoteProvider`], so backends can be
//! swapped at startup without touching session logic.

pub mod native;
pub mod relay;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

pub use native::{CapturePlatform, NativeProvider};
pub use relay::RelayProvider;

/// Backend-issued connection for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSessionHandle {
    pub connection_id: String,
    pub device_id: String,
    pub connection_url: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A single captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
    pub key_frame: bool,
}

impl ScreenFrame {
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            data: Bytes::new(),
            timestamp: Utc::now(),
            key_frame: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionStatistics {
    pub frames_per_second: f64,
    pub latency_ms: f64,
    pub bandwidth_bps: u64,
    pub packet_loss: f32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    None,
    Left,
    Right,
    Middle,
    X1,
    X2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseAction {
    Move,
    Press,
    Release,
    Click,
    DoubleClick,
    Wheel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAction {
    Press,
    Release,
}

/// Input in the representation providers consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderInput {
    Mouse {
        x: i32,
        y: i32,
        button: MouseButton,
        action: MouseAction,
        wheel_delta: i32,
    },
    Keyboard {
        key_code: u32,
        action: KeyAction,
        ctrl: bool,
        alt: bool,
        shift: bool,
        meta: bool,
    },
}

/// Capability set every backend implements.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str;

    /// Prepare the backend. Called at most once successfully per instance.
    async fn initialize(&self) -> Result<(), ProviderError>;

    /// Open a connection to `device_id`. `token` is the broker session id.
    async fn start_session(
        &self,
        device_id: &str,
        token: &str,
    ) -> Result<ProviderSessionHandle, ProviderError>;

    /// Close a connection. `Ok(false)` means the backend declined.
    async fn end_session(&self, handle: &ProviderSessionHandle) -> Result<bool, ProviderError>;

    async fn send_input(
        &self,
        handle: &ProviderSessionHandle,
        input: ProviderInput,
    ) -> Result<(), ProviderError>;

    async fn capture_frame(&self, handle: &ProviderSessionHandle) -> Result<ScreenFrame, ProviderError>;

    /// `Ok(None)` means the backend no longer knows the connection.
    async fn get_statistics(
        &self,
        handle: &ProviderSessionHandle,
    ) -> Result<Option<SessionStatistics>, ProviderError>;
}

/// Backend implementations the registry can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process capture pipeline. Preferred.
    Native,
    /// HTTP-controlled relay service. Always constructible, used as fallback.
    Relay,
}

impl ProviderKind {
    pub const PREFERRED: ProviderKind = ProviderKind::Native;
    pub const FALLBACK: ProviderKind = ProviderKind::Relay;

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "native" => Some(ProviderKind::Native),
            "relay" => Some(ProviderKind::Relay),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Native => "native",
            ProviderKind::Relay => "relay",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Random hex connection identifier.
pub(crate) fn new_connection_id() -> Result<String, ProviderError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(|e| ProviderError::Unavailable(e.to_string()))?;
    Ok(hex::encode(bytes))
}
