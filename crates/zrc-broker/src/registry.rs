//! Startup-time selection of the backend provider.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::ProviderConfig;
use crate::provider::{CapturePlatform, NativeProvider, ProviderKind, RelayProvider, RemoteProvider};

const NONE_ACTIVE: u8 = 0;

fn encode(kind: ProviderKind) -> u8 {
    match kind {
        ProviderKind::Native => 1,
        ProviderKind::Relay => 2,
    }
}

fn decode(value: u8) -> Option<ProviderKind> {
    match value {
        1 => Some(ProviderKind::Native),
        2 => Some(ProviderKind::Relay),
        _ => None,
    }
}

/// Builds the configured provider, falling back to the relay provider when
/// the configured one cannot be constructed.
pub struct ProviderRegistry {
    config: ProviderConfig,
    requested: ProviderKind,
    platform: Option<Arc<dyn CapturePlatform>>,
    active: AtomicU8,
}

impl ProviderRegistry {
    pub fn new(config: ProviderConfig) -> Self {
        let requested = match ProviderKind::from_name(&config.name) {
            Some(kind) => kind,
            None => {
                warn!(
                    provider = %config.name,
                    fallback = %ProviderKind::FALLBACK,
                    "unknown provider name, using fallback"
                );
                ProviderKind::FALLBACK
            }
        };
        Self {
            config,
            requested,
            platform: None,
            active: AtomicU8::new(NONE_ACTIVE),
        }
    }

    /// Capture platform the native provider needs. Without one, native
    /// construction fails and the registry falls back.
    pub fn with_platform(mut self, platform: Arc<dyn CapturePlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn requested_kind(&self) -> ProviderKind {
        self.requested
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Construct a provider. Never fails.
    pub fn create_provider(&self) -> Arc<dyn RemoteProvider> {
        let (kind, provider): (ProviderKind, Arc<dyn RemoteProvider>) = match self.requested {
            ProviderKind::Native => {
                match NativeProvider::new(self.config.native.clone(), self.platform.clone()) {
                    Ok(native) => (ProviderKind::Native, Arc::new(native) as Arc<dyn RemoteProvider>),
                    Err(e) => {
                        error!(
                            error = %e,
                            fallback = %ProviderKind::FALLBACK,
                            "native provider construction failed, falling back"
                        );
                        (ProviderKind::FALLBACK, self.fallback())
                    }
                }
            }
            ProviderKind::Relay => (ProviderKind::Relay, self.fallback()),
        };

        self.active.store(encode(kind), Ordering::Release);
        info!(provider = %kind, version = provider.version(), "provider selected");
        provider
    }

    fn fallback(&self) -> Arc<dyn RemoteProvider> {
        Arc::new(RelayProvider::new(self.config.relay.clone()))
    }

    /// The provider actually constructed, or the requested one before any
    /// construction.
    pub fn current_provider_name(&self) -> &'static str {
        decode(self.active.load(Ordering::Acquire))
            .unwrap_or(self.requested)
            .name()
    }

    pub fn is_preferred_provider_active(&self) -> bool {
        decode(self.active.load(Ordering::Acquire)) == Some(ProviderKind::PREFERRED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::LoopbackPlatform;

    fn config(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn native_with_platform_is_preferred() {
        let registry =
            ProviderRegistry::new(config("native")).with_platform(Arc::new(LoopbackPlatform::new(4, 4)));
        assert!(!registry.is_preferred_provider_active());

        let provider = registry.create_provider();
        assert_eq!(provider.name(), "native");
        assert_eq!(registry.current_provider_name(), "native");
        assert!(registry.is_preferred_provider_active());
    }

    #[test]
    fn native_construction_failure_falls_back() {
        let registry = ProviderRegistry::new(config("native"));
        assert_eq!(registry.current_provider_name(), "native");

        let provider = registry.create_provider();
        assert_eq!(provider.name(), "relay");
        assert_eq!(registry.current_provider_name(), "relay");
        assert!(!registry.is_preferred_provider_active());
    }

    #[test]
    fn invalid_native_tuning_falls_back() {
        let mut cfg = config("native");
        cfg.native.target_frame_rate = 0;
        let registry =
            ProviderRegistry::new(cfg).with_platform(Arc::new(LoopbackPlatform::new(4, 4)));
        assert_eq!(registry.create_provider().name(), "relay");
    }

    #[test]
    fn unknown_name_uses_fallback() {
        let registry = ProviderRegistry::new(config("teleport"));
        assert_eq!(registry.requested_kind(), ProviderKind::Relay);
        assert_eq!(registry.create_provider().name(), "relay");
    }

    #[test]
    fn relay_requested_is_not_preferred() {
        let registry =
            ProviderRegistry::new(config("relay")).with_platform(Arc::new(LoopbackPlatform::new(4, 4)));
        assert_eq!(registry.create_provider().name(), "relay");
        assert!(!registry.is_preferred_provider_active());
    }
}
