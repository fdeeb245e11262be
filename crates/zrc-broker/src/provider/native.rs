//! In-process provider driving a host capture platform directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{
    new_connection_id, ProviderInput, ProviderSessionHandle, RemoteProvider, ScreenFrame,
    SessionStatistics,
};
use crate::config::NativeConfig;
use crate::errors::ProviderError;

/// Raw capture frame as produced by a host platform.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Host-side capture and input injection.
#[async_trait]
pub trait CapturePlatform: Send + Sync {
    async fn capture_frame(&self) -> anyhow::Result<CapturedFrame>;
    async fn apply_input(&self, input: ProviderInput) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct NativeConnection {
    device_id: String,
    opened: Instant,
    frames: u64,
    bytes_sent: u64,
    inputs: u64,
}

pub struct NativeProvider {
    config: NativeConfig,
    platform: Arc<dyn CapturePlatform>,
    initialized: AtomicBool,
    connections: DashMap<String, NativeConnection>,
}

impl NativeProvider {
    /// Fails if no capture platform is available or the tuning is invalid.
    pub fn new(
        config: NativeConfig,
        platform: Option<Arc<dyn CapturePlatform>>,
    ) -> Result<Self, ProviderError> {
        let platform = platform.ok_or_else(|| {
            ProviderError::Construction("no capture platform available on this host".to_string())
        })?;
        config
            .validate()
            .map_err(|e| ProviderError::Construction(e.to_string()))?;

        Ok(Self {
            config,
            platform,
            initialized: AtomicBool::new(false),
            connections: DashMap::new(),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn ensure_initialized(&self) -> Result<(), ProviderError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ProviderError::NotInitialized)
        }
    }
}

#[async_trait]
impl RemoteProvider for NativeProvider {
    fn name(&self) -> &'static str {
        "native"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.initialized.store(true, Ordering::Release);
        info!(
            frame_rate = self.config.target_frame_rate,
            transport = self.config.transport.scheme(),
            hardware_acceleration = self.config.hardware_acceleration,
            capture_mode = ?self.config.capture_mode,
            "native provider initialized"
        );
        Ok(())
    }

    async fn start_session(
        &self,
        device_id: &str,
        token: &str,
    ) -> Result<ProviderSessionHandle, ProviderError> {
        self.ensure_initialized()?;
        let connection_id = new_connection_id()?;
        let connection_url = format!(
            "{}://{}/{}",
            self.config.transport.scheme(),
            device_id,
            connection_id
        );

        self.connections.insert(
            connection_id.clone(),
            NativeConnection {
                device_id: device_id.to_string(),
                opened: Instant::now(),
                frames: 0,
                bytes_sent: 0,
                inputs: 0,
            },
        );
        debug!(connection_id = %connection_id, device_id, session = token, "native connection opened");

        Ok(ProviderSessionHandle {
            connection_id,
            device_id: device_id.to_string(),
            connection_url: Some(connection_url),
            started_at: Utc::now(),
        })
    }

    async fn end_session(&self, handle: &ProviderSessionHandle) -> Result<bool, ProviderError> {
        match self.connections.remove(&handle.connection_id) {
            Some((_, connection)) => {
                debug!(
                    connection_id = %handle.connection_id,
                    device_id = %connection.device_id,
                    frames = connection.frames,
                    inputs = connection.inputs,
                    "native connection closed"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn send_input(
        &self,
        handle: &ProviderSessionHandle,
        input: ProviderInput,
    ) -> Result<(), ProviderError> {
        self.ensure_initialized()?;
        if !self.connections.contains_key(&handle.connection_id) {
            return Err(ProviderError::UnknownConnection(handle.connection_id.clone()));
        }

        self.platform
            .apply_input(input)
            .await
            .map_err(|e| ProviderError::Rejected(e.to_string()))?;

        if let Some(mut connection) = self.connections.get_mut(&handle.connection_id) {
            connection.inputs += 1;
        }
        Ok(())
    }

    async fn capture_frame(&self, handle: &ProviderSessionHandle) -> Result<ScreenFrame, ProviderError> {
        self.ensure_initialized()?;
        if !self.connections.contains_key(&handle.connection_id) {
            return Err(ProviderError::UnknownConnection(handle.connection_id.clone()));
        }

        let captured = self
            .platform
            .capture_frame()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let key_frame = match self.connections.get_mut(&handle.connection_id) {
            Some(mut connection) => {
                connection.frames += 1;
                connection.bytes_sent += captured.data.len() as u64;
                connection.frames == 1
            }
            None => return Err(ProviderError::UnknownConnection(handle.connection_id.clone())),
        };

        Ok(ScreenFrame {
            width: captured.width,
            height: captured.height,
            data: captured.data,
            timestamp: Utc::now(),
            key_frame,
        })
    }

    async fn get_statistics(
        &self,
        handle: &ProviderSessionHandle,
    ) -> Result<Option<SessionStatistics>, ProviderError> {
        let Some(connection) = self.connections.get(&handle.connection_id) else {
            return Ok(None);
        };
        let elapsed = connection.opened.elapsed();
        let secs = elapsed.as_secs_f64();
        let (fps, bandwidth) = if secs > 0.0 {
            (
                connection.frames as f64 / secs,
                (connection.bytes_sent as f64 * 8.0 / secs) as u64,
            )
        } else {
            (0.0, 0)
        };

        Ok(Some(SessionStatistics {
            frames_per_second: fps,
            bandwidth_bps: bandwidth,
            bytes_sent: connection.bytes_sent,
            frames_encoded: connection.frames,
            duration_secs: elapsed.as_secs(),
            ..SessionStatistics::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::LoopbackPlatform;
    use crate::provider::{KeyAction, ProviderInput};

    fn provider() -> (NativeProvider, Arc<LoopbackPlatform>) {
        let platform = Arc::new(LoopbackPlatform::new(64, 32));
        let provider = NativeProvider::new(
            NativeConfig::default(),
            Some(platform.clone() as Arc<dyn CapturePlatform>),
        )
        .unwrap();
        (provider, platform)
    }

    #[test]
    fn construction_requires_platform() {
        let err = NativeProvider::new(NativeConfig::default(), None).err().unwrap();
        assert!(matches!(err, ProviderError::Construction(_)));
    }

    #[test]
    fn construction_rejects_bad_tuning() {
        let config = NativeConfig {
            target_frame_rate: 0,
            ..NativeConfig::default()
        };
        let platform: Arc<dyn CapturePlatform> = Arc::new(LoopbackPlatform::new(8, 8));
        assert!(NativeProvider::new(config, Some(platform)).is_err());
    }

    #[tokio::test]
    async fn start_requires_initialize() {
        let (provider, _) = provider();
        let err = provider.start_session("D1", "token").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotInitialized));
    }

    #[tokio::test]
    async fn connection_lifecycle() {
        let (provider, platform) = provider();
        provider.initialize().await.unwrap();

        let handle = provider.start_session("D1", "token").await.unwrap();
        assert!(handle.connection_url.as_deref().unwrap().starts_with("quic://D1/"));
        assert_eq!(provider.connection_count(), 1);

        let frame = provider.capture_frame(&handle).await.unwrap();
        assert_eq!((frame.width, frame.height), (64, 32));
        assert_eq!(frame.data.len(), 64 * 32 * 4);
        assert!(frame.key_frame);
        assert!(!provider.capture_frame(&handle).await.unwrap().key_frame);

        let input = ProviderInput::Keyboard {
            key_code: 13,
            action: KeyAction::Press,
            ctrl: false,
            alt: false,
            shift: false,
            meta: false,
        };
        provider.send_input(&handle, input.clone()).await.unwrap();
        assert_eq!(platform.inputs().await, vec![input]);

        let stats = provider.get_statistics(&handle).await.unwrap().unwrap();
        assert_eq!(stats.frames_encoded, 2);
        assert_eq!(stats.bytes_sent, 2 * 64 * 32 * 4);

        assert!(provider.end_session(&handle).await.unwrap());
        assert!(!provider.end_session(&handle).await.unwrap());
        assert!(provider.get_statistics(&handle).await.unwrap().is_none());
        assert!(matches!(
            provider.capture_frame(&handle).await,
            Err(ProviderError::UnknownConnection(_))
        ));
    }
}
