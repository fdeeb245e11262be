//! Session lifecycle state machine.
//!
//! `SessionBroker` owns the decision logic for creating, starting, joining
//! and stopping sessions. Durable rows live behind [`SessionStore`], PINs
//! behind [`PinAuthority`] and backend connections behind
//! [`SessionHandleRegistry`]. Mutations of one session are serialized by a
//! per-session lock; different sessions never contend.
//!
//! Expected negative outcomes (wrong PIN, replay, expiry) are values, not
//! errors. Backend failures during start are folded into a failed
//! [`SessionStartResult`] so the session stays retryable.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditAction, AuditLogger, AuditRecord};
use crate::clock::{Clock, SystemClock};
use crate::errors::{PinRejection, SessionError};
use crate::handles::{Liveness, RemoteConnection, SessionHandleRegistry};
use crate::input::InputEvent;
use crate::locks::SessionLocks;
use crate::model::{
    CreateSessionRequest, Participant, ParticipantRole, Session, SessionId, SessionStatus,
};
use crate::pin::{mask_pin, PinAuthority, PinIssued};
use crate::store::{Directory, SessionStore};

/// Longest lifetime accepted for a temporary PIN.
pub const MAX_TEMPORARY_PIN_MINUTES: u32 = 24 * 60;

// ============================================================================
// Results
// ============================================================================

/// Outcome of starting (or resuming) a session.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SessionStartResult {
    pub success: bool,
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub connection_id: Option<String>,
    pub connection_url: Option<String>,
    /// Set when the session waits for a PIN.
    pub pin: Option<String>,
    pub pin_expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl SessionStartResult {
    fn connected(session: &Session, connection: RemoteConnection) -> Self {
        Self {
            success: true,
            session_id: session.id,
            status: session.status,
            connection_id: Some(connection.connection_id),
            connection_url: connection.connection_url,
            pin: None,
            pin_expires_at: None,
            error_message: None,
        }
    }

    fn awaiting_pin(session: &Session, issued: PinIssued) -> Self {
        Self {
            success: true,
            session_id: session.id,
            status: session.status,
            connection_id: None,
            connection_url: None,
            pin: Some(issued.pin),
            pin_expires_at: Some(issued.expires_at),
            error_message: None,
        }
    }

    fn failed(session: &Session, message: String) -> Self {
        Self {
            success: false,
            session_id: session.id,
            status: session.status,
            connection_id: None,
            connection_url: None,
            pin: None,
            pin_expires_at: None,
            error_message: Some(message),
        }
    }
}

impl std::fmt::Debug for SessionStartResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStartResult")
            .field("success", &self.success)
            .field("session_id", &self.session_id)
            .field("status", &self.status)
            .field("connection_id", &self.connection_id)
            .field("pin", &self.pin.as_deref().map(mask_pin))
            .field("error_message", &self.error_message)
            .finish()
    }
}

/// Outcome of `validate_pin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinValidation {
    pub valid: bool,
    pub rejection: Option<PinRejection>,
    /// Backend start attempted after a successful validation.
    pub start: Option<SessionStartResult>,
}

impl PinValidation {
    fn rejected(reason: PinRejection) -> Self {
        Self {
            valid: false,
            rejection: Some(reason),
            start: None,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct PinGenerationResult {
    pub session_id: SessionId,
    pub pin: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for PinGenerationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinGenerationResult")
            .field("session_id", &self.session_id)
            .field("pin", &mask_pin(&self.pin))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionJoinResult {
    pub session_id: SessionId,
    pub user_id: String,
    pub role: ParticipantRole,
    pub status: SessionStatus,
    /// Opaque per-join token for the viewer's media connection.
    pub connection_token: String,
    pub start: Option<SessionStartResult>,
}

// ============================================================================
// Broker
// ============================================================================

pub struct SessionBroker {
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn Directory>,
    pins: Arc<PinAuthority>,
    handles: Arc<SessionHandleRegistry>,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
    locks: SessionLocks,
}

impl SessionBroker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn Directory>,
        pins: Arc<PinAuthority>,
        handles: Arc<SessionHandleRegistry>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            store,
            directory,
            pins,
            handles,
            audit,
            clock: Arc::new(SystemClock),
            locks: SessionLocks::new(),
        }
    }

    /// Use `clock` for session timestamps. Pass the same clock the
    /// `PinAuthority` was built with.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pins(&self) -> &Arc<PinAuthority> {
        &self.pins
    }

    pub fn handles(&self) -> &Arc<SessionHandleRegistry> {
        &self.handles
    }

    /// Wait for queued audit records to reach the sinks.
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }

    fn audit(
        &self,
        action: AuditAction,
        session_id: &SessionId,
        actor: Option<&str>,
        success: bool,
        detail: Option<String>,
    ) {
        let mut record = AuditRecord::session(action, session_id, actor, success).at(self.clock.now());
        record.detail = detail;
        self.audit.record(record);
    }

    async fn load(&self, session_id: &SessionId) -> Result<Session, SessionError> {
        self.store
            .load_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(format!("session {}", session_id)))
    }

    // ------------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------------

    /// Create a session in `Created` with `actor` as Owner.
    ///
    /// Invited users that the directory does not know are skipped.
    pub async fn create(
        &self,
        request: CreateSessionRequest,
        actor: &str,
    ) -> Result<Session, SessionError> {
        request.validate()?;
        if actor.trim().is_empty() {
            return Err(SessionError::InvalidRequest("actor id is empty".into()));
        }
        if !self.directory.device_exists(&request.device_id).await? {
            warn!(device_id = %request.device_id, actor, "session requested for unknown device");
            return Err(SessionError::NotFound(format!("device {}", request.device_id)));
        }

        let mut session = Session::new(&request, actor, self.clock.now());
        for (invited, role) in request.invitations() {
            if invited == actor || session.participant(invited).is_some() {
                continue;
            }
            match self.directory.user_exists(invited).await {
                Ok(true) => session.participants.push(Participant::new(invited, role)),
                Ok(false) => {
                    warn!(session_id = %session.id, user_id = %invited, "skipping unknown invited user")
                }
                Err(e) => {
                    warn!(session_id = %session.id, user_id = %invited, error = %e, "skipping invited user, directory lookup failed")
                }
            }
        }

        self.store.insert_session(session.clone()).await?;
        info!(
            session_id = %session.id,
            device_id = %session.device_id,
            actor,
            require_pin = session.require_pin,
            participants = session.participants.len(),
            "session created"
        );
        self.audit(AuditAction::SessionCreate, &session.id, Some(actor), true, None);
        Ok(session)
    }

    // ------------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------------

    /// Start the session.
    ///
    /// With `require_pin` the session moves to `WaitingForPin` and the
    /// backend is not contacted until a PIN validates. Otherwise the backend
    /// connection is opened immediately. Calling again while waiting for a
    /// PIN reissues it; calling again after a failed backend start retries.
    pub async fn start(
        &self,
        session_id: &SessionId,
        actor: &str,
    ) -> Result<SessionStartResult, SessionError> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.load(session_id).await?;

        if !session.has_access(actor) {
            warn!(session_id = %session_id, actor, "start denied");
            self.audit(AuditAction::SessionStart, session_id, Some(actor), false, Some("unauthorized".into()));
            return Err(SessionError::Unauthorized(format!(
                "{} is not a participant of session {}",
                actor, session_id
            )));
        }

        let result = match session.status {
            SessionStatus::Created if session.require_pin => {
                let issued = self.issue_pin(&session).await?;
                session.transition(SessionStatus::WaitingForPin)?;
                session.started_at = Some(self.clock.now());
                self.store.save_session(&session).await?;
                info!(session_id = %session_id, actor, pin = %mask_pin(&issued.pin), "session waiting for PIN");
                SessionStartResult::awaiting_pin(&session, issued)
            }
            SessionStatus::Created => {
                session.transition(SessionStatus::Connecting)?;
                session.started_at = Some(self.clock.now());
                self.store.save_session(&session).await?;
                self.connect_backend(&mut session).await?
            }
            SessionStatus::WaitingForPin => {
                let issued = self.issue_pin(&session).await?;
                debug!(session_id = %session_id, actor, "PIN reissued for waiting session");
                SessionStartResult::awaiting_pin(&session, issued)
            }
            SessionStatus::Connecting | SessionStatus::Connected => {
                self.connect_backend(&mut session).await?
            }
            status => {
                return Err(SessionError::InvalidRequest(format!(
                    "session {} is {} and cannot be started",
                    session_id, status
                )))
            }
        };

        self.audit(
            AuditAction::SessionStart,
            session_id,
            Some(actor),
            result.success,
            result.error_message.clone(),
        );
        Ok(result)
    }

    /// Invalidate any prior PIN and issue a new one.
    async fn issue_pin(&self, session: &Session) -> Result<PinIssued, SessionError> {
        self.pins.invalidate(&session.id).await?;
        Ok(self.pins.generate(&session.id).await?)
    }

    /// Open (or reuse) the backend connection and move `Connecting` to
    /// `Connected` on success. Backend failures become a failed result.
    async fn connect_backend(&self, session: &mut Session) -> Result<SessionStartResult, SessionError> {
        match self
            .handles
            .start_remote_session(&session.id, &session.device_id)
            .await
        {
            Ok(connection) => {
                if session.status == SessionStatus::Connecting {
                    session.transition(SessionStatus::Connected)?;
                    self.store.save_session(session).await?;
                }
                info!(
                    session_id = %session.id,
                    connection_id = %connection.connection_id,
                    status = %session.status,
                    "backend connected"
                );
                Ok(SessionStartResult::connected(session, connection))
            }
            Err(e) => {
                error!(session_id = %session.id, error = %e, "backend start failed");
                Ok(SessionStartResult::failed(session, e.to_string()))
            }
        }
    }

    // ------------------------------------------------------------------------
    // PIN validation and join
    // ------------------------------------------------------------------------

    /// Check a PIN for a session waiting on one.
    ///
    /// On success the session moves to `Connected` and the backend is
    /// started. Any other outcome leaves the session unchanged.
    pub async fn validate_pin(&self, session_id: &SessionId, pin: &str) -> Result<PinValidation, SessionError> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.load(session_id).await?;

        if session.status != SessionStatus::WaitingForPin {
            warn!(session_id = %session_id, status = %session.status, "PIN presented for session not waiting on one");
            self.audit(AuditAction::PinValidate, session_id, None, false, Some(format!("status {}", session.status)));
            let reason = match self.pins.details(session_id).await {
                Some(details) if details.used => PinRejection::AlreadyUsed,
                _ => PinRejection::Missing,
            };
            return Ok(PinValidation::rejected(reason));
        }

        if let Err(rejection) = self.pins.check(session_id, pin).await {
            warn!(session_id = %session_id, reason = %rejection, "PIN rejected");
            self.audit(AuditAction::PinValidate, session_id, None, false, Some(rejection.to_string()));
            return Ok(PinValidation::rejected(rejection));
        }

        session.transition(SessionStatus::Connected)?;
        self.store.save_session(&session).await?;
        self.audit(AuditAction::PinValidate, session_id, None, true, None);

        let start = self.connect_backend(&mut session).await?;
        Ok(PinValidation {
            valid: true,
            rejection: None,
            start: Some(start),
        })
    }

    /// Join a PIN-protected session as `user_id`.
    ///
    /// Joining a session that waits on its PIN also connects it.
    pub async fn join_with_pin(
        &self,
        session_id: &SessionId,
        pin: &str,
        user_id: &str,
    ) -> Result<SessionJoinResult, SessionError> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.load(session_id).await?;

        if !session.require_pin {
            return Err(SessionError::InvalidRequest(format!(
                "session {} does not accept PIN joins",
                session_id
            )));
        }
        if session.status.is_terminal() {
            return Err(SessionError::InvalidRequest(format!(
                "session {} is {}",
                session_id, session.status
            )));
        }

        if let Err(rejection) = self.pins.check(session_id, pin).await {
            warn!(session_id = %session_id, user_id, reason = %rejection, "PIN join rejected");
            self.audit(AuditAction::SessionJoin, session_id, Some(user_id), false, Some(rejection.to_string()));
            return Err(SessionError::Pin(rejection));
        }

        let now = self.clock.now();
        match session.participant_mut(user_id) {
            Some(participant) => participant.connect(now),
            None => {
                let mut participant = Participant::new(user_id, ParticipantRole::Viewer);
                participant.connect(now);
                session.participants.push(participant);
            }
        }

        let start = if session.status == SessionStatus::WaitingForPin {
            session.transition(SessionStatus::Connected)?;
            self.store.save_session(&session).await?;
            Some(self.connect_backend(&mut session).await?)
        } else {
            self.store.save_session(&session).await?;
            None
        };

        let role = session
            .participant(user_id)
            .map(|p| p.role)
            .unwrap_or(ParticipantRole::Viewer);
        let connection_token = new_join_token()?;

        info!(session_id = %session_id, user_id, role = ?role, "participant joined");
        self.audit(AuditAction::SessionJoin, session_id, Some(user_id), true, None);

        Ok(SessionJoinResult {
            session_id: *session_id,
            user_id: user_id.to_string(),
            role,
            status: session.status,
            connection_token,
            start,
        })
    }

    /// Non-consuming PIN check.
    pub async fn is_pin_valid(&self, session_id: &SessionId, pin: &str) -> bool {
        self.pins.is_valid(session_id, pin).await
    }

    // ------------------------------------------------------------------------
    // PIN management
    // ------------------------------------------------------------------------

    /// Issue a fresh PIN, revoking any previous one. Owner or Administrator only.
    pub async fn generate_pin(
        &self,
        session_id: &SessionId,
        actor: &str,
    ) -> Result<PinGenerationResult, SessionError> {
        let _guard = self.locks.lock(session_id).await;
        let session = self.load(session_id).await?;
        self.require_admin(&session, actor, AuditAction::PinGenerate).await?;
        if session.status.is_terminal() {
            return Err(SessionError::InvalidRequest(format!(
                "session {} is {}",
                session_id, session.status
            )));
        }

        let issued = self.issue_pin(&session).await?;
        self.audit(AuditAction::PinGenerate, session_id, Some(actor), true, None);
        Ok(PinGenerationResult {
            session_id: *session_id,
            pin: issued.pin,
            expires_at: issued.expires_at,
        })
    }

    pub async fn regenerate_pin(
        &self,
        session_id: &SessionId,
        actor: &str,
    ) -> Result<PinGenerationResult, SessionError> {
        self.generate_pin(session_id, actor).await
    }

    /// Issue a PIN with a caller-chosen lifetime. Session creator only.
    pub async fn generate_temporary_pin(
        &self,
        session_id: &SessionId,
        actor: &str,
        ttl_minutes: u32,
    ) -> Result<PinGenerationResult, SessionError> {
        if ttl_minutes == 0 || ttl_minutes > MAX_TEMPORARY_PIN_MINUTES {
            return Err(SessionError::InvalidRequest(format!(
                "temporary PIN lifetime must be between 1 and {} minutes",
                MAX_TEMPORARY_PIN_MINUTES
            )));
        }

        let _guard = self.locks.lock(session_id).await;
        let session = self.load(session_id).await?;
        if session.created_by != actor {
            self.audit(AuditAction::PinGenerate, session_id, Some(actor), false, Some("unauthorized".into()));
            return Err(SessionError::Unauthorized(format!(
                "only the creator of session {} may issue temporary PINs",
                session_id
            )));
        }
        if session.status.is_terminal() {
            return Err(SessionError::InvalidRequest(format!(
                "session {} is {}",
                session_id, session.status
            )));
        }

        self.pins.invalidate(session_id).await?;
        let issued = self
            .pins
            .generate_with_ttl(session_id, Duration::minutes(i64::from(ttl_minutes)))
            .await?;
        self.audit(
            AuditAction::PinGenerate,
            session_id,
            Some(actor),
            true,
            Some(format!("temporary {}m", ttl_minutes)),
        );
        Ok(PinGenerationResult {
            session_id: *session_id,
            pin: issued.pin,
            expires_at: issued.expires_at,
        })
    }

    async fn require_admin(
        &self,
        session: &Session,
        actor: &str,
        action: AuditAction,
    ) -> Result<(), SessionError> {
        if session.can_administer(actor) {
            return Ok(());
        }
        warn!(session_id = %session.id, actor, action = action.as_str(), "operation requires owner or administrator");
        self.audit(action, &session.id, Some(actor), false, Some("unauthorized".into()));
        Err(SessionError::Unauthorized(format!(
            "{} is not an owner or administrator of session {}",
            actor, session.id
        )))
    }

    // ------------------------------------------------------------------------
    // Stop and status
    // ------------------------------------------------------------------------

    /// End the session. Owner or Administrator only.
    ///
    /// Stopping a session that is already `Ended` or `Error` changes nothing,
    /// apart from closing a backend connection an earlier `Error` report
    /// could not release. If the backend refuses to close the connection the
    /// session is left unchanged and the error returned, so the stop can be
    /// retried.
    pub async fn stop(&self, session_id: &SessionId, actor: &str) -> Result<(), SessionError> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.load(session_id).await?;
        self.require_admin(&session, actor, AuditAction::SessionStop).await?;

        if session.status.is_terminal() {
            if self.handles.has_handle(session_id) {
                if let Err(e) = self.handles.stop_remote_session(session_id).await {
                    error!(session_id = %session_id, error = %e, "backend release failed for terminal session");
                    return Err(e.into());
                }
            }
            debug!(session_id = %session_id, actor, status = %session.status, "session already terminal");
            return Ok(());
        }

        if let Err(e) = self.handles.stop_remote_session(session_id).await {
            error!(session_id = %session_id, error = %e, "backend stop failed");
            self.audit(AuditAction::SessionStop, session_id, Some(actor), false, Some(e.to_string()));
            return Err(e.into());
        }
        self.release_pin(session_id).await;

        let now = self.clock.now();
        session.disconnect_all(now);
        session.transition(SessionStatus::Ended)?;
        session.ended_at = Some(now);
        self.store.save_session(&session).await?;

        info!(session_id = %session_id, actor, status = %session.status, "session stopped");
        self.audit(AuditAction::SessionStop, session_id, Some(actor), true, None);
        Ok(())
    }

    async fn release_pin(&self, session_id: &SessionId) {
        if let Err(e) = self.pins.invalidate(session_id).await {
            error!(session_id = %session_id, error = %e, "failed to invalidate PIN");
        }
    }

    /// Move the session along one edge of the lifecycle graph.
    ///
    /// Entering `Ended` or `Error` releases the backend connection and PIN.
    pub async fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<Session, SessionError> {
        let _guard = self.locks.lock(session_id).await;
        let mut session = self.load(session_id).await?;
        if session.status == status {
            return Ok(session);
        }
        if !session.status.can_transition_to(status) {
            warn!(session_id = %session_id, from = %session.status, to = %status, "illegal status transition");
            return Err(SessionError::InvalidTransition {
                from: session.status,
                to: status,
            });
        }

        let now = self.clock.now();
        match status {
            SessionStatus::Ended => {
                self.handles.stop_remote_session(session_id).await?;
                self.release_pin(session_id).await;
                session.disconnect_all(now);
                session.ended_at = Some(now);
            }
            SessionStatus::Error => {
                if let Err(e) = self.handles.stop_remote_session(session_id).await {
                    warn!(session_id = %session_id, error = %e, "backend release failed for errored session");
                }
                self.release_pin(session_id).await;
                session.disconnect_all(now);
                session.ended_at = Some(now);
            }
            SessionStatus::Active if session.started_at.is_none() => {
                session.started_at = Some(now);
            }
            _ => {}
        }

        let from = session.status;
        session.transition(status)?;
        self.store.save_session(&session).await?;
        info!(session_id = %session_id, from = %from, to = %status, "session status updated");
        self.audit(
            AuditAction::SessionStatus,
            session_id,
            None,
            true,
            Some(format!("{} -> {}", from, status)),
        );
        Ok(session)
    }

    // ------------------------------------------------------------------------
    // Queries and pass-throughs
    // ------------------------------------------------------------------------

    pub async fn get_session(&self, session_id: &SessionId, actor: &str) -> Result<Session, SessionError> {
        let session = self.load(session_id).await?;
        if !session.has_access(actor) {
            return Err(SessionError::Unauthorized(format!(
                "{} cannot view session {}",
                actor, session_id
            )));
        }
        Ok(session)
    }

    pub async fn list_sessions(&self, actor: &str) -> Result<Vec<Session>, SessionError> {
        Ok(self.store.list_sessions_for_user(actor).await?)
    }

    pub async fn send_input(&self, session_id: &SessionId, event: &InputEvent) -> bool {
        self.handles.send_input(session_id, event).await
    }

    pub async fn capture_frame(&self, session_id: &SessionId) -> Bytes {
        self.handles.capture_frame(session_id).await
    }

    pub async fn is_active(&self, session_id: &SessionId) -> bool {
        self.handles.is_active(session_id).await
    }

    pub async fn liveness(&self, session_id: &SessionId) -> Liveness {
        self.handles.liveness(session_id).await
    }
}

fn new_join_token() -> Result<String, SessionError> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| SessionError::Internal(format!("random source failure: {}", e)))?;
    Ok(hex::encode(bytes))
}
