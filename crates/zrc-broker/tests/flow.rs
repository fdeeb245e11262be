//! End-to-end broker flows.

use std::sync::Arc;

use zrc_broker::{
    audit::AuditLogger,
    config::BrokerConfig,
    harness::{run_demo_flow, BrokerFixture, LoopbackPlatform},
    pin::PinAuthority,
    store::{InMemoryDirectory, InMemorySessionStore},
    ProviderRegistry, SessionBroker, SessionHandleRegistry, SessionStatus,
};

#[tokio::test]
async fn test_demo_flow() {
    let fixture = BrokerFixture::new();

    let report = run_demo_flow(&fixture.broker, "U1", "D1")
        .await
        .expect("demo flow should succeed");

    assert_eq!(report.pin_length, 6);
    assert_eq!(report.status_after_start, SessionStatus::WaitingForPin);
    assert!(!report.wrong_pin_accepted);
    assert_eq!(report.status_after_wrong_pin, SessionStatus::WaitingForPin);
    assert!(report.pin_accepted);
    assert_eq!(report.status_after_pin, SessionStatus::Connected);
    assert!(!report.replay_accepted);
    assert!(report.input_delivered);
    assert!(report.frame_bytes > 0);
    assert_eq!(report.final_status, SessionStatus::Ended);
}

#[tokio::test]
async fn test_demo_flow_over_native_provider() {
    let config = BrokerConfig::default();
    let registry = ProviderRegistry::new(config.provider.clone())
        .with_platform(Arc::new(LoopbackPlatform::new(32, 16)));
    let handles = Arc::new(SessionHandleRegistry::from_registry(&registry));
    assert!(registry.is_preferred_provider_active());

    let broker = SessionBroker::new(
        Arc::new(InMemorySessionStore::new()),
        Arc::new(InMemoryDirectory::new().with_device("D1")),
        Arc::new(PinAuthority::in_memory(config.pin.clone())),
        handles,
        Arc::new(AuditLogger::disabled()),
    );

    let report = run_demo_flow(&broker, "U1", "D1").await.unwrap();
    assert_eq!(report.provider, "native");
    assert!(report.pin_accepted);
    assert!(!report.replay_accepted);
    assert!(report.input_delivered);
    assert_eq!(report.frame_bytes, 32 * 16 * 4);
    assert_eq!(report.final_status, SessionStatus::Ended);
}
