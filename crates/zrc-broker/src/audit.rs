//! Audit records for state-changing broker operations.
//!
//! Each record names the action, the resource, the acting user and whether
//! the operation succeeded. Delivery is best effort and happens off the
//! caller's path: a failing or slow sink is logged and skipped, and never
//! fails or delays the operation being audited.
//! PIN values never appear in audit records.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, warn};

use crate::model::SessionId;

/// Errors from audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("sink error: {0}")]
    SinkError(String),
    #[error("io error: {0}")]
    IoError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::IoError(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "session.create")]
    SessionCreate,
    #[serde(rename = "session.start")]
    SessionStart,
    #[serde(rename = "session.stop")]
    SessionStop,
    #[serde(rename = "session.join")]
    SessionJoin,
    #[serde(rename = "session.status")]
    SessionStatus,
    #[serde(rename = "session.pin.generate")]
    PinGenerate,
    #[serde(rename = "session.pin.validate")]
    PinValidate,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::SessionCreate => "session.create",
            AuditAction::SessionStart => "session.start",
            AuditAction::SessionStop => "session.stop",
            AuditAction::SessionJoin => "session.join",
            AuditAction::SessionStatus => "session.status",
            AuditAction::PinGenerate => "session.pin.generate",
            AuditAction::PinValidate => "session.pin.validate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub actor_id: Option<String>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn session(action: AuditAction, session_id: &SessionId, actor_id: Option<&str>, success: bool) -> Self {
        Self {
            action,
            resource_type: "session".to_string(),
            resource_id: session_id.to_string(),
            actor_id: actor_id.map(str::to_string),
            success,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn to_log_line(&self) -> Result<String, AuditError> {
        serde_json::to_string(self).map_err(|e| AuditError::SerializationError(e.to_string()))
    }
}

// ============================================================================
// Sinks
// ============================================================================

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Bounded in-memory sink. Oldest records are dropped first.
#[derive(Debug)]
pub struct MemoryAuditSink {
    records: RwLock<VecDeque<AuditRecord>>,
    max_records: usize,
}

impl MemoryAuditSink {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(max_records.min(1024))),
            max_records,
        }
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.iter().cloned().collect()
    }

    pub async fn actions(&self) -> Vec<AuditAction> {
        self.records.read().await.iter().map(|r| r.action).collect()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut records = self.records.write().await;
        if self.max_records == 0 {
            return Ok(());
        }
        while records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }
}

/// Appends one JSON record per line.
pub struct FileAuditSink {
    path: std::path::PathBuf,
}

impl FileAuditSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn append_line(&self, line: &str) -> Result<(), AuditError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditSink").field("path", &self.path).finish()
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn emit(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.append_line(&record.to_log_line()?).await
    }
}

// ============================================================================
// Logger
// ============================================================================

/// Records queued before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

enum AuditMessage {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

/// Fans records out to every sink, each under its own deadline.
///
/// `record` only enqueues. A worker task started on first use delivers
/// records in order, so a slow sink delays the audit trail but never the
/// operation being audited. Sinks must be added before the first record.
pub struct AuditLogger {
    sinks: Vec<Arc<dyn AuditSink>>,
    emit_timeout: Duration,
    capacity: usize,
    queue: OnceLock<mpsc::Sender<AuditMessage>>,
}

impl AuditLogger {
    pub fn new(emit_timeout: Duration) -> Self {
        Self {
            sinks: Vec::new(),
            emit_timeout,
            capacity: DEFAULT_QUEUE_CAPACITY,
            queue: OnceLock::new(),
        }
    }

    /// Logger with no sinks. Records are dropped.
    pub fn disabled() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn AuditSink>) {
        if self.queue.get().is_some() {
            warn!("audit sink added after delivery started, ignoring");
            return;
        }
        self.sinks.push(sink);
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Queue `record` for delivery. Never waits; a full queue drops the
    /// record and logs it.
    pub fn record(&self, record: AuditRecord) {
        if self.sinks.is_empty() {
            return;
        }
        let queue = self.queue.get_or_init(|| self.spawn_worker());
        if let Err(e) = queue.try_send(AuditMessage::Record(record)) {
            let (reason, record) = match e {
                TrySendError::Full(AuditMessage::Record(r)) => ("queue full", Some(r)),
                TrySendError::Closed(AuditMessage::Record(r)) => ("worker stopped", Some(r)),
                _ => ("undeliverable", None),
            };
            error!(
                reason,
                action = record.as_ref().map(|r| r.action.as_str()),
                resource_id = record.as_ref().map(|r| r.resource_id.as_str()),
                "audit record dropped"
            );
        }
    }

    /// Wait until every record queued so far has been offered to the sinks.
    pub async fn flush(&self) {
        let Some(queue) = self.queue.get() else {
            return;
        };
        let (done, delivered) = oneshot::channel();
        if queue.send(AuditMessage::Flush(done)).await.is_ok() {
            let _ = delivered.await;
        }
    }

    fn spawn_worker(&self) -> mpsc::Sender<AuditMessage> {
        let (tx, mut rx) = mpsc::channel(self.capacity);
        let sinks = self.sinks.clone();
        let emit_timeout = self.emit_timeout;
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    AuditMessage::Record(record) => deliver(&sinks, emit_timeout, &record).await,
                    AuditMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("audit worker stopped");
        });
        tx
    }
}

async fn deliver(sinks: &[Arc<dyn AuditSink>], emit_timeout: Duration, record: &AuditRecord) {
    for (index, sink) in sinks.iter().enumerate() {
        match tokio::time::timeout(emit_timeout, sink.emit(record.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                sink = index,
                action = record.action.as_str(),
                resource_id = %record.resource_id,
                error = %e,
                "audit delivery failed"
            ),
            Err(_) => error!(
                sink = index,
                action = record.action.as_str(),
                resource_id = %record.resource_id,
                timeout_ms = emit_timeout.as_millis() as u64,
                "audit delivery timed out"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn emit(&self, _record: AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::SinkError("unreachable collector".to_string()))
        }
    }

    struct StalledSink;

    #[async_trait]
    impl AuditSink for StalledSink {
        async fn emit(&self, _record: AuditRecord) -> Result<(), AuditError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn record(action: AuditAction) -> AuditRecord {
        AuditRecord::session(action, &Uuid::new_v4(), Some("U1"), true)
    }

    #[test]
    fn actions_serialize_dotted() {
        let line = record(AuditAction::PinValidate).to_log_line().unwrap();
        assert!(line.contains(r#""action":"session.pin.validate""#));
        assert!(line.contains(r#""resource_type":"session""#));
        assert_eq!(AuditAction::SessionStop.as_str(), "session.stop");
    }

    #[tokio::test]
    async fn memory_sink_is_bounded() {
        let sink = MemoryAuditSink::new(2);
        sink.emit(record(AuditAction::SessionCreate)).await.unwrap();
        sink.emit(record(AuditAction::SessionStart)).await.unwrap();
        sink.emit(record(AuditAction::SessionStop)).await.unwrap();

        assert_eq!(
            sink.actions().await,
            vec![AuditAction::SessionStart, AuditAction::SessionStop]
        );
    }

    #[tokio::test]
    async fn file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = FileAuditSink::new(&path);

        sink.emit(record(AuditAction::SessionCreate)).await.unwrap();
        sink.emit(record(AuditAction::PinGenerate).with_detail("regenerated"))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<AuditRecord> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].action, AuditAction::PinGenerate);
        assert_eq!(lines[1].detail.as_deref(), Some("regenerated"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sinks_do_not_block_delivery() {
        let memory = Arc::new(MemoryAuditSink::new(16));
        let logger = AuditLogger::new(Duration::from_millis(50))
            .with_sink(Arc::new(FailingSink))
            .with_sink(Arc::new(StalledSink))
            .with_sink(memory.clone());

        logger.record(record(AuditAction::SessionStart));
        logger.record(record(AuditAction::SessionStop));
        logger.flush().await;
        assert_eq!(
            memory.actions().await,
            vec![AuditAction::SessionStart, AuditAction::SessionStop]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn record_returns_without_waiting_on_sinks() {
        let memory = Arc::new(MemoryAuditSink::new(16));
        let logger = AuditLogger::new(Duration::from_secs(60))
            .with_sink(Arc::new(StalledSink))
            .with_sink(memory.clone());

        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            logger.record(record(AuditAction::SessionStart));
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(memory.count().await, 0);

        logger.flush().await;
        assert_eq!(memory.count().await, 3);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_waiting() {
        let memory = Arc::new(MemoryAuditSink::new(16));
        let logger = AuditLogger::new(Duration::from_secs(60))
            .with_queue_capacity(1)
            .with_sink(memory.clone());

        // Nothing yields between these, so the worker has not drained any.
        for _ in 0..5 {
            logger.record(record(AuditAction::SessionStart));
        }
        logger.flush().await;
        assert_eq!(memory.count().await, 1);
    }

    #[tokio::test]
    async fn disabled_logger_drops_records() {
        let logger = AuditLogger::disabled();
        logger.record(record(AuditAction::SessionCreate));
        logger.flush().await;
        assert_eq!(logger.sink_count(), 0);
    }
}
