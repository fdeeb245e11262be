//! Session data model: sessions, participants and the lifecycle graph.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SessionError;

pub type SessionId = Uuid;

/// Lifecycle status of a session.
///
/// `Created` is initial; `Ended` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    WaitingForPin,
    Connecting,
    Connected,
    Active,
    Paused,
    Disconnected,
    Ended,
    Error,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 9] = [
        SessionStatus::Created,
        SessionStatus::WaitingForPin,
        SessionStatus::Connecting,
        SessionStatus::Connected,
        SessionStatus::Active,
        SessionStatus::Paused,
        SessionStatus::Disconnected,
        SessionStatus::Ended,
        SessionStatus::Error,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Error)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// Besides the forward path, every non-terminal state may fail into
    /// `Error` or be stopped into `Ended`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Error) | (_, Ended) => true,
            (Created, WaitingForPin) | (Created, Connecting) => true,
            (WaitingForPin, Connected) | (Connecting, Connected) => true,
            (Connected, Active) => true,
            (Active, Paused) | (Active, Disconnected) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::WaitingForPin => "waiting_for_pin",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Ended => "ended",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    Standard,
    ViewOnly,
    FileTransfer,
    CommandExecution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Administrator,
    Viewer,
}

impl ParticipantRole {
    /// Owners and administrators may stop the session and manage PINs.
    pub fn can_administer(self) -> bool {
        matches!(self, ParticipantRole::Owner | ParticipantRole::Administrator)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub role: ParticipantRole,
    pub connected: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            connected: false,
            joined_at: None,
            left_at: None,
        }
    }

    pub fn connect(&mut self, at: DateTime<Utc>) {
        self.connected = true;
        self.joined_at = Some(at);
        self.left_at = None;
    }

    pub fn disconnect(&mut self, at: DateTime<Utc>) {
        if self.connected {
            self.connected = false;
            self.left_at = Some(at);
        }
    }
}

/// Input to `SessionBroker::create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    pub device_id: String,
    #[serde(default)]
    pub session_type: SessionType,
    #[serde(default)]
    pub require_pin: bool,
    #[serde(default)]
    pub invited_user_ids: Vec<String>,
    /// Invited users that join as Administrator instead of Viewer.
    #[serde(default)]
    pub invited_administrator_ids: Vec<String>,
}

impl CreateSessionRequest {
    pub fn new(name: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_id: device_id.into(),
            session_type: SessionType::Standard,
            require_pin: false,
            invited_user_ids: Vec::new(),
            invited_administrator_ids: Vec::new(),
        }
    }

    pub fn require_pin(mut self, require_pin: bool) -> Self {
        self.require_pin = require_pin;
        self
    }

    pub fn session_type(mut self, session_type: SessionType) -> Self {
        self.session_type = session_type;
        self
    }

    pub fn invite(mut self, user_id: impl Into<String>) -> Self {
        self.invited_user_ids.push(user_id.into());
        self
    }

    pub fn invite_administrator(mut self, user_id: impl Into<String>) -> Self {
        self.invited_administrator_ids.push(user_id.into());
        self
    }

    /// Every invitation with the role it grants. Administrator invitations
    /// come first so they win over a duplicate Viewer invitation.
    pub fn invitations(&self) -> impl Iterator<Item = (&str, ParticipantRole)> + '_ {
        self.invited_administrator_ids
            .iter()
            .map(|id| (id.as_str(), ParticipantRole::Administrator))
            .chain(
                self.invited_user_ids
                    .iter()
                    .map(|id| (id.as_str(), ParticipantRole::Viewer)),
            )
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.name.trim().is_empty() {
            return Err(SessionError::InvalidRequest("session name is empty".into()));
        }
        if self.device_id.trim().is_empty() {
            return Err(SessionError::InvalidRequest("device id is empty".into()));
        }
        Ok(())
    }
}

/// A remote-access session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub device_id: String,
    pub created_by: String,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub require_pin: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub participants: Vec<Participant>,
}

impl Session {
    /// New session in `Created` with the creator registered as Owner.
    pub fn new(request: &CreateSessionRequest, creator: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            device_id: request.device_id.clone(),
            created_by: creator.to_string(),
            session_type: request.session_type,
            status: SessionStatus::Created,
            require_pin: request.require_pin,
            created_at: now,
            started_at: None,
            ended_at: None,
            participants: vec![Participant::new(creator, ParticipantRole::Owner)],
        }
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    /// Creator or any registered participant.
    pub fn has_access(&self, user_id: &str) -> bool {
        self.created_by == user_id || self.participant(user_id).is_some()
    }

    /// Owner or Administrator role.
    pub fn can_administer(&self, user_id: &str) -> bool {
        self.participant(user_id)
            .map(|p| p.role.can_administer())
            .unwrap_or(false)
    }

    /// Apply a status change if it is an edge of the lifecycle graph.
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), SessionError> {
        if !self.status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn disconnect_all(&mut self, at: DateTime<Utc>) {
        for participant in &mut self.participants {
            participant.disconnect(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status_strategy() -> impl Strategy<Value = SessionStatus> {
        proptest::sample::select(SessionStatus::ALL.to_vec())
    }

    #[test]
    fn forward_path_is_legal() {
        use SessionStatus::*;
        let path = [Created, WaitingForPin, Connected, Active, Paused, Ended];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Created.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Active.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Ended));
    }

    #[test]
    fn shortcuts_are_rejected() {
        use SessionStatus::*;
        assert!(!Created.can_transition_to(Active));
        assert!(!WaitingForPin.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Active));
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[test]
    fn creator_is_owner() {
        let request = CreateSessionRequest::new("Demo", "D1");
        let session = Session::new(&request, "U1", Utc::now());
        assert_eq!(session.status, SessionStatus::Created);
        assert_eq!(session.participants.len(), 1);
        assert_eq!(session.participants[0].role, ParticipantRole::Owner);
        assert!(session.can_administer("U1"));
        assert!(!session.has_access("U2"));
    }

    #[test]
    fn empty_request_fields_are_invalid() {
        assert!(CreateSessionRequest::new("", "D1").validate().is_err());
        assert!(CreateSessionRequest::new("Demo", "  ").validate().is_err());
        assert!(CreateSessionRequest::new("Demo", "D1").validate().is_ok());
    }

    proptest! {
        #[test]
        fn terminal_states_have_no_exits(to in status_strategy()) {
            prop_assert!(!SessionStatus::Ended.can_transition_to(to));
            prop_assert!(!SessionStatus::Error.can_transition_to(to));
        }

        #[test]
        fn every_live_state_can_fail(from in status_strategy()) {
            prop_assume!(!from.is_terminal());
            prop_assert!(from.can_transition_to(SessionStatus::Error));
            prop_assert!(from.can_transition_to(SessionStatus::Ended));
        }

        #[test]
        fn transition_only_moves_along_edges(from in status_strategy(), to in status_strategy()) {
            let request = CreateSessionRequest::new("Demo", "D1");
            let mut session = Session::new(&request, "U1", Utc::now());
            session.status = from;
            let result = session.transition(to);
            prop_assert_eq!(result.is_ok(), from.can_transition_to(to));
            if result.is_err() {
                prop_assert_eq!(session.status, from);
            } else {
                prop_assert_eq!(session.status, to);
            }
        }
    }
}
