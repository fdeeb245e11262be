//! Test harness for the ZRC session broker.
//!
//! Provides a controllable clock, a scripted provider with failure injection,
//! a loopback capture platform for the native provider, and a fixture that
//! wires an in-memory broker together. `run_demo_flow` drives the full
//! create/start/validate/stop workflow and is shared by the integration tests
//! and the `zrc-brokerd demo` command.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::audit::{AuditAction, AuditLogger, AuditRecord, MemoryAuditSink};
use crate::clock::Clock;
use crate::config::PinConfig;
use crate::errors::{ProviderError, SessionError};
use crate::handles::SessionHandleRegistry;
use crate::input::{InputEvent, Modifiers};
use crate::model::{CreateSessionRequest, SessionId, SessionStatus};
use crate::pin::{InMemoryPinStore, PinAuthority};
use crate::provider::native::CapturedFrame;
use crate::provider::{
    new_connection_id, CapturePlatform, ProviderInput, ProviderSessionHandle, RemoteProvider,
    ScreenFrame, SessionStatistics,
};
use crate::session::SessionBroker;
use crate::store::{InMemoryDirectory, InMemorySessionStore};

// ============================================================================
// Clock
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }
}

// ============================================================================
// Scripted provider
// ============================================================================

/// Per-method call counts of a [`ScriptedProvider`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCalls {
    pub initialize: usize,
    pub start_session: usize,
    pub end_session: usize,
    pub send_input: usize,
    pub capture_frame: usize,
    pub get_statistics: usize,
}

#[derive(Default)]
struct CallCounters {
    initialize: AtomicUsize,
    start_session: AtomicUsize,
    end_session: AtomicUsize,
    send_input: AtomicUsize,
    capture_frame: AtomicUsize,
    get_statistics: AtomicUsize,
}

/// In-memory provider that records calls and fails on request.
pub struct ScriptedProvider {
    calls: CallCounters,
    fail_initialize: AtomicBool,
    fail_start: AtomicBool,
    hang_start: AtomicBool,
    refuse_end: AtomicBool,
    fail_statistics: AtomicBool,
    frame: Mutex<Bytes>,
    connections: DashMap<String, String>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            calls: CallCounters::default(),
            fail_initialize: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            hang_start: AtomicBool::new(false),
            refuse_end: AtomicBool::new(false),
            fail_statistics: AtomicBool::new(false),
            frame: Mutex::new(Bytes::from_static(b"\x89FRAME")),
            connections: DashMap::new(),
        }
    }

    pub fn calls(&self) -> ProviderCalls {
        ProviderCalls {
            initialize: self.calls.initialize.load(Ordering::SeqCst),
            start_session: self.calls.start_session.load(Ordering::SeqCst),
            end_session: self.calls.end_session.load(Ordering::SeqCst),
            send_input: self.calls.send_input.load(Ordering::SeqCst),
            capture_frame: self.calls.capture_frame.load(Ordering::SeqCst),
            get_statistics: self.calls.get_statistics.load(Ordering::SeqCst),
        }
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make `start_session` never complete.
    pub fn hang_start(&self, hang: bool) {
        self.hang_start.store(hang, Ordering::SeqCst);
    }

    pub fn refuse_end(&self, refuse: bool) {
        self.refuse_end.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_statistics(&self, fail: bool) {
        self.fail_statistics.store(fail, Ordering::SeqCst);
    }

    pub fn set_frame(&self, frame: Bytes) {
        *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = frame;
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl RemoteProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn version(&self) -> &'static str {
        "0.0.0"
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("scripted initialize failure".into()));
        }
        Ok(())
    }

    async fn start_session(
        &self,
        device_id: &str,
        _token: &str,
    ) -> Result<ProviderSessionHandle, ProviderError> {
        self.calls.start_session.fetch_add(1, Ordering::SeqCst);
        if self.hang_start.load(Ordering::SeqCst) {
            tokio::time::sleep(StdDuration::from_secs(3600)).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("scripted start failure".into()));
        }

        let connection_id = new_connection_id()?;
        self.connections
            .insert(connection_id.clone(), device_id.to_string());
        Ok(ProviderSessionHandle {
            connection_url: Some(format!("loopback://{}/{}", device_id, connection_id)),
            connection_id,
            device_id: device_id.to_string(),
            started_at: Utc::now(),
        })
    }

    async fn end_session(&self, handle: &ProviderSessionHandle) -> Result<bool, ProviderError> {
        self.calls.end_session.fetch_add(1, Ordering::SeqCst);
        if self.refuse_end.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.connections.remove(&handle.connection_id);
        Ok(true)
    }

    async fn send_input(
        &self,
        handle: &ProviderSessionHandle,
        _input: ProviderInput,
    ) -> Result<(), ProviderError> {
        self.calls.send_input.fetch_add(1, Ordering::SeqCst);
        if !self.connections.contains_key(&handle.connection_id) {
            return Err(ProviderError::UnknownConnection(handle.connection_id.clone()));
        }
        Ok(())
    }

    async fn capture_frame(&self, _handle: &ProviderSessionHandle) -> Result<ScreenFrame, ProviderError> {
        self.calls.capture_frame.fetch_add(1, Ordering::SeqCst);
        let data = self.frame.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(ScreenFrame {
            width: if data.is_empty() { 0 } else { 1 },
            height: if data.is_empty() { 0 } else { 1 },
            data,
            timestamp: Utc::now(),
            key_frame: true,
        })
    }

    async fn get_statistics(
        &self,
        handle: &ProviderSessionHandle,
    ) -> Result<Option<SessionStatistics>, ProviderError> {
        self.calls.get_statistics.fetch_add(1, Ordering::SeqCst);
        if self.fail_statistics.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("scripted statistics failure".into()));
        }
        Ok(self
            .connections
            .contains_key(&handle.connection_id)
            .then(SessionStatistics::default))
    }
}

// ============================================================================
// Loopback capture platform
// ============================================================================

/// Capture platform that renders a synthetic RGBA gradient and records input.
pub struct LoopbackPlatform {
    width: u32,
    height: u32,
    frames: AtomicU64,
    inputs: tokio::sync::Mutex<Vec<ProviderInput>>,
}

impl LoopbackPlatform {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: AtomicU64::new(0),
            inputs: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn inputs(&self) -> Vec<ProviderInput> {
        self.inputs.lock().await.clone()
    }
}

#[async_trait]
impl CapturePlatform for LoopbackPlatform {
    async fn capture_frame(&self) -> anyhow::Result<CapturedFrame> {
        let shade = (self.frames.fetch_add(1, Ordering::SeqCst) % 256) as u8;
        let mut data = Vec::with_capacity((self.width * self.height * 4) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, shade, 0xff]);
            }
        }
        Ok(CapturedFrame {
            width: self.width,
            height: self.height,
            data: Bytes::from(data),
        })
    }

    async fn apply_input(&self, input: ProviderInput) -> anyhow::Result<()> {
        self.inputs.lock().await.push(input);
        Ok(())
    }
}

// ============================================================================
// Broker fixture
// ============================================================================

/// In-memory broker over a [`ScriptedProvider`].
///
/// The directory knows device `D1` and users `U1`, `U2` and `U3`.
pub struct BrokerFixture {
    pub broker: SessionBroker,
    pub provider: Arc<ScriptedProvider>,
    pub directory: Arc<InMemoryDirectory>,
    pub store: Arc<InMemorySessionStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub clock: Arc<ManualClock>,
}

impl Default for BrokerFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerFixture {
    pub fn new() -> Self {
        Self::with_pin_config(PinConfig::default())
    }

    pub fn with_pin_config(pin: PinConfig) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let provider = Arc::new(ScriptedProvider::new());
        let directory = Arc::new(
            InMemoryDirectory::new()
                .with_device("D1")
                .with_user("U1")
                .with_user("U2")
                .with_user("U3"),
        );
        let audit = Arc::new(MemoryAuditSink::new(1024));
        let store = Arc::new(InMemorySessionStore::new());

        let pins = Arc::new(PinAuthority::new(
            pin,
            Arc::new(InMemoryPinStore::new()),
            clock.clone(),
        ));
        let handles = Arc::new(SessionHandleRegistry::new(
            provider.clone(),
            StdDuration::from_secs(5),
        ));
        let logger = Arc::new(AuditLogger::new(StdDuration::from_secs(1)).with_sink(audit.clone()));

        let broker = SessionBroker::new(
            store.clone(),
            directory.clone(),
            pins,
            handles,
            logger,
        )
        .with_clock(clock.clone());

        Self {
            broker,
            provider,
            directory,
            store,
            audit,
            clock,
        }
    }

    /// Audit records delivered so far, after draining the queue.
    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.broker.flush_audit().await;
        self.audit.records().await
    }

    pub async fn audit_actions(&self) -> Vec<AuditAction> {
        self.broker.flush_audit().await;
        self.audit.actions().await
    }
}

// ============================================================================
// End-to-end flow
// ============================================================================

/// A code of the same length that differs from `pin` in every digit.
pub fn wrong_pin_for(pin: &str) -> String {
    pin.chars()
        .map(|c| match c.to_digit(10) {
            Some(d) => char::from(b'0' + ((d + 1) % 10) as u8),
            None => '0',
        })
        .collect()
}

/// What happened at each step of [`run_demo_flow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DemoReport {
    pub session_id: SessionId,
    pub provider: &'static str,
    pub pin_length: usize,
    pub status_after_start: SessionStatus,
    pub wrong_pin_accepted: bool,
    pub status_after_wrong_pin: SessionStatus,
    pub pin_accepted: bool,
    pub status_after_pin: SessionStatus,
    pub replay_accepted: bool,
    pub input_delivered: bool,
    pub frame_bytes: usize,
    pub final_status: SessionStatus,
}

/// Create a PIN-protected session on `device_id` as `actor`, start it,
/// present a wrong PIN, the right PIN and the right PIN again, exercise
/// input and capture, then stop it.
pub async fn run_demo_flow(
    broker: &SessionBroker,
    actor: &str,
    device_id: &str,
) -> Result<DemoReport, SessionError> {
    let session = broker
        .create(CreateSessionRequest::new("Demo", device_id).require_pin(true), actor)
        .await?;
    let session_id = session.id;

    let started = broker.start(&session_id, actor).await?;
    let pin = started
        .pin
        .ok_or_else(|| SessionError::Internal("start returned no PIN".into()))?;

    let wrong = broker.validate_pin(&session_id, &wrong_pin_for(&pin)).await?;
    let status_after_wrong_pin = broker.get_session(&session_id, actor).await?.status;

    let accepted = broker.validate_pin(&session_id, &pin).await?;
    let status_after_pin = broker.get_session(&session_id, actor).await?.status;

    let replay = broker.validate_pin(&session_id, &pin).await?;

    let input_delivered = broker
        .send_input(
            &session_id,
            &InputEvent::KeyDown {
                code: 13,
                modifiers: Modifiers::default(),
            },
        )
        .await;
    let frame_bytes = broker.capture_frame(&session_id).await.len();

    broker.stop(&session_id, actor).await?;
    let final_status = broker.get_session(&session_id, actor).await?.status;

    Ok(DemoReport {
        session_id,
        provider: broker.handles().provider_name(),
        pin_length: pin.len(),
        status_after_start: started.status,
        wrong_pin_accepted: wrong.valid,
        status_after_wrong_pin,
        pin_accepted: accepted.valid,
        status_after_pin,
        replay_accepted: replay.valid,
        input_delivered,
        frame_bytes,
        final_status,
    })
}
