//! Session id to provider connection mapping.
//!
//! Every provider call runs under the configured deadline, so a hung backend
//! turns into `ProviderError::Timeout` instead of holding a session lock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::errors::ProviderError;
use crate::input::InputEvent;
use crate::locks::SessionLocks;
use crate::model::SessionId;
use crate::provider::{ProviderSessionHandle, RemoteProvider, SessionStatistics};
use crate::registry::ProviderRegistry;

/// Connection details handed back to the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteConnection {
    pub connection_id: String,
    pub connection_url: Option<String>,
}

impl From<&ProviderSessionHandle> for RemoteConnection {
    fn from(handle: &ProviderSessionHandle) -> Self {
        Self {
            connection_id: handle.connection_id.clone(),
            connection_url: handle.connection_url.clone(),
        }
    }
}

/// What the backend says about a session's connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Liveness {
    Active(SessionStatistics),
    /// No handle, or the backend no longer knows the connection.
    Ended,
    /// The backend could not be asked. The connection may still be up.
    Unknown(String),
}

impl Liveness {
    pub fn is_active(&self) -> bool {
        matches!(self, Liveness::Active(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleRegistryStats {
    pub provider: &'static str,
    pub initialized: bool,
    pub active_handles: usize,
}

pub struct SessionHandleRegistry {
    provider: Arc<dyn RemoteProvider>,
    handles: DashMap<SessionId, ProviderSessionHandle>,
    locks: SessionLocks,
    initialized: OnceCell<()>,
    call_timeout: Duration,
}

impl SessionHandleRegistry {
    pub fn new(provider: Arc<dyn RemoteProvider>, call_timeout: Duration) -> Self {
        Self {
            provider,
            handles: DashMap::new(),
            locks: SessionLocks::new(),
            initialized: OnceCell::new(),
            call_timeout,
        }
    }

    /// Backed by whatever provider `registry` constructs.
    pub fn from_registry(registry: &ProviderRegistry) -> Self {
        Self::new(registry.create_provider(), registry.config().call_timeout())
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = self.call_timeout.as_millis() as u64;
                error!(operation, timeout_ms, provider = self.provider.name(), "provider call timed out");
                Err(ProviderError::Timeout { operation, timeout_ms })
            }
        }
    }

    /// Initialize the provider once. A failed attempt is retried on the next call.
    async fn ensure_initialized(&self) -> Result<(), ProviderError> {
        self.initialized
            .get_or_try_init(|| async {
                self.call("initialize", self.provider.initialize()).await?;
                info!(provider = self.provider.name(), "provider initialized");
                Ok::<(), ProviderError>(())
            })
            .await
            .map(|_| ())
    }

    fn handle(&self, session_id: &SessionId) -> Option<ProviderSessionHandle> {
        self.handles.get(session_id).map(|h| h.value().clone())
    }

    pub fn has_handle(&self, session_id: &SessionId) -> bool {
        self.handles.contains_key(session_id)
    }

    pub fn connection(&self, session_id: &SessionId) -> Option<RemoteConnection> {
        self.handles.get(session_id).map(|h| RemoteConnection::from(h.value()))
    }

    /// Open a backend connection for the session.
    ///
    /// If the session already has one, it is returned unchanged.
    pub async fn start_remote_session(
        &self,
        session_id: &SessionId,
        device_id: &str,
    ) -> Result<RemoteConnection, ProviderError> {
        let _guard = self.locks.lock(session_id).await;

        if let Some(existing) = self.connection(session_id) {
            debug!(session_id = %session_id, connection_id = %existing.connection_id, "reusing provider connection");
            return Ok(existing);
        }

        self.ensure_initialized().await?;
        let token = session_id.to_string();
        let handle = self
            .call("start_session", self.provider.start_session(device_id, &token))
            .await?;
        let connection = RemoteConnection::from(&handle);
        self.handles.insert(*session_id, handle);

        info!(
            session_id = %session_id,
            device_id,
            connection_id = %connection.connection_id,
            provider = self.provider.name(),
            "remote session started"
        );
        Ok(connection)
    }

    /// Close the session's backend connection.
    ///
    /// `Ok(false)` if there was nothing to close. The mapping is only dropped
    /// once the backend confirms, so a failed stop can be retried.
    pub async fn stop_remote_session(&self, session_id: &SessionId) -> Result<bool, ProviderError> {
        let _guard = self.locks.lock(session_id).await;

        let Some(handle) = self.handle(session_id) else {
            warn!(session_id = %session_id, "no provider connection to stop");
            return Ok(false);
        };

        let ended = self.call("end_session", self.provider.end_session(&handle)).await?;
        if !ended {
            warn!(session_id = %session_id, connection_id = %handle.connection_id, "provider refused to end session");
            return Err(ProviderError::Rejected(format!(
                "provider refused to end connection {}",
                handle.connection_id
            )));
        }

        self.handles.remove(session_id);
        info!(session_id = %session_id, connection_id = %handle.connection_id, "remote session stopped");
        Ok(true)
    }

    /// Forward input to the session's connection. Never fails; returns
    /// whether the input was delivered.
    pub async fn send_input(&self, session_id: &SessionId, event: &InputEvent) -> bool {
        let Some(handle) = self.handle(session_id) else {
            debug!(session_id = %session_id, "input for session without connection dropped");
            return false;
        };
        let Some(input) = event.to_provider() else {
            warn!(session_id = %session_id, event = ?event, "unsupported input event dropped");
            return false;
        };

        match self.call("send_input", self.provider.send_input(&handle, input)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "input delivery failed");
                false
            }
        }
    }

    /// Latest frame bytes, or empty when there is no connection or no frame.
    pub async fn capture_frame(&self, session_id: &SessionId) -> Bytes {
        let Some(handle) = self.handle(session_id) else {
            return Bytes::new();
        };
        match self.call("capture_frame", self.provider.capture_frame(&handle)).await {
            Ok(frame) => frame.data,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "frame capture failed");
                Bytes::new()
            }
        }
    }

    pub async fn liveness(&self, session_id: &SessionId) -> Liveness {
        let Some(handle) = self.handle(session_id) else {
            return Liveness::Ended;
        };
        match self.call("get_statistics", self.provider.get_statistics(&handle)).await {
            Ok(Some(stats)) => Liveness::Active(stats),
            Ok(None) => Liveness::Ended,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "liveness check failed");
                Liveness::Unknown(e.to_string())
            }
        }
    }

    /// True only when the backend reports statistics for the connection.
    pub async fn is_active(&self, session_id: &SessionId) -> bool {
        self.liveness(session_id).await.is_active()
    }

    pub async fn statistics(&self, session_id: &SessionId) -> Option<SessionStatistics> {
        match self.liveness(session_id).await {
            Liveness::Active(stats) => Some(stats),
            _ => None,
        }
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.handles.iter().map(|entry| *entry.key()).collect()
    }

    pub fn stats(&self) -> HandleRegistryStats {
        HandleRegistryStats {
            provider: self.provider.name(),
            initialized: self.initialized.initialized(),
            active_handles: self.handles.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::ScriptedProvider;
    use crate::input::Modifiers;
    use uuid::Uuid;

    fn registry() -> (SessionHandleRegistry, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new());
        let registry = SessionHandleRegistry::new(provider.clone(), Duration::from_secs(5));
        (registry, provider)
    }

    #[tokio::test]
    async fn initializes_lazily_and_once() {
        let (registry, provider) = registry();
        assert_eq!(provider.calls().initialize, 0);

        registry.start_remote_session(&Uuid::new_v4(), "D1").await.unwrap();
        registry.start_remote_session(&Uuid::new_v4(), "D2").await.unwrap();

        let calls = provider.calls();
        assert_eq!(calls.initialize, 1);
        assert_eq!(calls.start_session, 2);
        assert!(registry.stats().initialized);
    }

    #[tokio::test]
    async fn failed_initialize_is_retried() {
        let (registry, provider) = registry();
        provider.fail_initialize(true);
        let session = Uuid::new_v4();

        assert!(registry.start_remote_session(&session, "D1").await.is_err());
        assert!(!registry.has_handle(&session));

        provider.fail_initialize(false);
        registry.start_remote_session(&session, "D1").await.unwrap();
        assert_eq!(provider.calls().initialize, 2);
    }

    #[tokio::test]
    async fn start_is_idempotent_per_session() {
        let (registry, provider) = registry();
        let session = Uuid::new_v4();

        let first = registry.start_remote_session(&session, "D1").await.unwrap();
        let second = registry.start_remote_session(&session, "D1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls().start_session, 1);
        assert_eq!(registry.active_sessions(), vec![session]);
    }

    #[tokio::test]
    async fn stop_without_handle_is_noop() {
        let (registry, provider) = registry();
        assert!(!registry.stop_remote_session(&Uuid::new_v4()).await.unwrap());
        assert_eq!(provider.calls().end_session, 0);
    }

    #[tokio::test]
    async fn refused_stop_keeps_mapping() {
        let (registry, provider) = registry();
        let session = Uuid::new_v4();
        registry.start_remote_session(&session, "D1").await.unwrap();

        provider.refuse_end(true);
        assert!(registry.stop_remote_session(&session).await.is_err());
        assert!(registry.has_handle(&session));

        provider.refuse_end(false);
        assert!(registry.stop_remote_session(&session).await.unwrap());
        assert!(!registry.has_handle(&session));
        assert!(!registry.stop_remote_session(&session).await.unwrap());
    }

    #[tokio::test]
    async fn input_requires_handle_and_supported_event() {
        let (registry, provider) = registry();
        let session = Uuid::new_v4();
        let key = InputEvent::KeyDown {
            code: 65,
            modifiers: Modifiers::default(),
        };

        assert!(!registry.send_input(&session, &key).await);

        registry.start_remote_session(&session, "D1").await.unwrap();
        assert!(registry.send_input(&session, &key).await);
        assert!(!registry.send_input(&session, &InputEvent::Unsupported).await);
        assert_eq!(provider.calls().send_input, 1);
    }

    #[tokio::test]
    async fn capture_returns_empty_without_frame() {
        let (registry, provider) = registry();
        let session = Uuid::new_v4();
        assert!(registry.capture_frame(&session).await.is_empty());

        registry.start_remote_session(&session, "D1").await.unwrap();
        assert!(!registry.capture_frame(&session).await.is_empty());

        provider.set_frame(Bytes::new());
        assert!(registry.capture_frame(&session).await.is_empty());
    }

    #[tokio::test]
    async fn liveness_distinguishes_unknown_from_ended() {
        let (registry, provider) = registry();
        let session = Uuid::new_v4();
        assert_eq!(registry.liveness(&session).await, Liveness::Ended);

        registry.start_remote_session(&session, "D1").await.unwrap();
        assert!(registry.is_active(&session).await);

        provider.fail_statistics(true);
        assert!(matches!(registry.liveness(&session).await, Liveness::Unknown(_)));
        assert!(!registry.is_active(&session).await);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_times_out() {
        let provider = Arc::new(ScriptedProvider::new());
        let registry = SessionHandleRegistry::new(provider.clone(), Duration::from_millis(100));
        provider.hang_start(true);

        let err = registry
            .start_remote_session(&Uuid::new_v4(), "D1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { operation: "start_session", .. }));
    }
}
