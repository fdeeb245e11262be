//! Storage abstractions for durable session rows and the device/user
//! directory, with in-memory implementations for tests and single-node use.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::RwLock;

use crate::errors::StoreError;
use crate::model::{Session, SessionId};

// ============================================================================
// Traits
// ============================================================================

/// Durable session and participant storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with `AlreadyExists` if the id is taken.
    async fn insert_session(&self, session: Session) -> Result<(), StoreError>;

    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Fails with `NotFound` if the session was never inserted.
    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Sessions the user created or participates in, newest first.
    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError>;
}

/// Lookup of known devices and users.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn device_exists(&self, device_id: &str) -> Result<bool, StoreError>;
    async fn user_exists(&self, user_id: &str) -> Result<bool, StoreError>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert_session(&self, session: Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(session.id.to_string()));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    async fn load_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(stored) => {
                *stored = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(session.id.to_string())),
        }
    }

    async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut visible: Vec<Session> = sessions
            .values()
            .filter(|s| s.has_access(user_id))
            .cloned()
            .collect();
        visible.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(visible)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    devices: DashSet<String>,
    users: DashSet<String>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, device_id: impl Into<String>) -> Self {
        self.add_device(device_id);
        self
    }

    pub fn with_user(self, user_id: impl Into<String>) -> Self {
        self.add_user(user_id);
        self
    }

    pub fn add_device(&self, device_id: impl Into<String>) {
        self.devices.insert(device_id.into());
    }

    pub fn add_user(&self, user_id: impl Into<String>) {
        self.users.insert(user_id.into());
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn device_exists(&self, device_id: &str) -> Result<bool, StoreError> {
        Ok(self.devices.contains(device_id))
    }

    async fn user_exists(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.users.contains(user_id))
    }
}
