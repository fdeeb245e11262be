//! One-time PIN credentials bound to sessions.
//!
//! Credentials are keyed by session id and stored as a SHA-256 hash of the
//! code. A code is never issued while another session holds a live
//! credential with the same digits, so a PIN identifies at most one session.
//! Consumption is a compare-and-set on the credential's used flag inside the
//! store, which closes the race between two concurrent validations of the
//! same correct code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::PinConfig;
use crate::errors::{PinError, PinRejection, StoreError};
use crate::model::SessionId;
use crate::rate_limit::PinAttemptLimiter;

// ============================================================================
// Credential records
// ============================================================================

/// Stored form of a PIN credential. The plaintext code is never kept.
#[derive(Clone, PartialEq, Eq)]
pub struct PinRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub code_hash: [u8; 32],
    /// Display form with all but the leading digits starred out.
    pub masked: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
}

impl PinRecord {
    fn issue(session_id: SessionId, code: &str, created_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            code_hash: hash_pin(code),
            masked: mask_pin(code),
            created_at,
            expires_at: created_at + ttl,
            used: false,
            used_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.is_expired(now)
    }

    /// Constant-time comparison of a presented code against the stored hash.
    pub fn matches(&self, pin: &str) -> bool {
        constant_time_eq::constant_time_eq(&hash_pin(pin), &self.code_hash)
    }
}

impl std::fmt::Debug for PinRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinRecord")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("masked", &self.masked)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("used", &self.used)
            .finish()
    }
}

pub fn hash_pin(pin: &str) -> [u8; 32] {
    Sha256::digest(pin.as_bytes()).into()
}

/// `123456` becomes `12****`.
pub fn mask_pin(pin: &str) -> String {
    let visible = pin.len().min(2);
    let mut masked: String = pin.chars().take(visible).collect();
    masked.extend(std::iter::repeat('*').take(pin.len().saturating_sub(visible)));
    masked
}

/// Draw `length` uniformly distributed decimal digits from the OS RNG.
///
/// Bytes >= 250 are discarded so every digit has probability exactly 1/10.
pub fn random_digits(length: usize) -> Result<String, PinError> {
    let mut code = String::with_capacity(length);
    let mut buf = [0u8; 16];
    while code.len() < length {
        getrandom::getrandom(&mut buf).map_err(|e| PinError::Rng(e.to_string()))?;
        for byte in buf {
            if byte >= 250 {
                continue;
            }
            code.push(char::from(b'0' + byte % 10));
            if code.len() == length {
                break;
            }
        }
    }
    Ok(code)
}

// ============================================================================
// Store abstraction
// ============================================================================

/// Backing store for PIN credentials.
///
/// The in-process implementation is enough for a single broker instance;
/// several instances behind a load balancer need a shared implementation.
#[async_trait]
pub trait PinStore: Send + Sync {
    /// Store a credential for its session, replacing any previous one.
    ///
    /// Returns `Ok(false)` without storing anything if another session holds
    /// a live credential with the same code hash.
    async fn insert_unique(&self, record: PinRecord, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn get(&self, session_id: &SessionId) -> Result<Option<PinRecord>, StoreError>;

    /// Returns whether a credential was removed.
    async fn remove(&self, session_id: &SessionId) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<PinRecord>, StoreError>;

    /// Atomically flip the used flag of credential `pin_id`.
    ///
    /// Exactly one caller observes `Ok(true)` for a given credential.
    async fn mark_used(
        &self,
        session_id: &SessionId,
        pin_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Remove every credential past its expiry. Returns how many were removed.
    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

struct PinEntry {
    record: PinRecord,
    used: AtomicBool,
    used_at: OnceLock<DateTime<Utc>>,
}

impl PinEntry {
    fn new(record: PinRecord) -> Self {
        Self {
            record,
            used: AtomicBool::new(false),
            used_at: OnceLock::new(),
        }
    }

    fn snapshot(&self) -> PinRecord {
        let mut record = self.record.clone();
        record.used = self.used.load(Ordering::Acquire);
        record.used_at = self.used_at.get().copied();
        record
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.used.load(Ordering::Acquire) && !self.record.is_expired(now)
    }
}

/// In-process PIN store backed by concurrent maps.
#[derive(Default)]
pub struct InMemoryPinStore {
    by_session: DashMap<SessionId, Arc<PinEntry>>,
    by_code: DashMap<[u8; 32], SessionId>,
}

impl InMemoryPinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }

    fn holds_live_code(&self, holder: &SessionId, code_hash: &[u8; 32], now: DateTime<Utc>) -> bool {
        self.by_session
            .get(holder)
            .map(|entry| entry.record.code_hash == *code_hash && entry.is_live(now))
            .unwrap_or(false)
    }

    fn release_code(&self, code_hash: &[u8; 32], session_id: &SessionId) {
        self.by_code.remove_if(code_hash, |_, holder| holder == session_id);
    }
}

#[async_trait]
impl PinStore for InMemoryPinStore {
    async fn insert_unique(&self, record: PinRecord, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let session_id = record.session_id;
        let code_hash = record.code_hash;

        let entry = Arc::new(PinEntry::new(record));

        // The code index entry is the claim on the digits. It stays locked
        // until the session record is in place, so a concurrent draw of the
        // same code sees either no claim or a claim backed by a live record.
        let previous = match self.by_code.entry(code_hash) {
            Entry::Occupied(mut claim) => {
                let holder = *claim.get();
                if holder != session_id && self.holds_live_code(&holder, &code_hash, now) {
                    return Ok(false);
                }
                claim.insert(session_id);
                self.by_session.insert(session_id, entry)
            }
            Entry::Vacant(slot) => {
                let _claim = slot.insert(session_id);
                self.by_session.insert(session_id, entry)
            }
        };

        if let Some(previous) = previous {
            if previous.record.code_hash != code_hash {
                self.release_code(&previous.record.code_hash, &session_id);
            }
        }
        Ok(true)
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<PinRecord>, StoreError> {
        Ok(self.by_session.get(session_id).map(|entry| entry.snapshot()))
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        match self.by_session.remove(session_id) {
            Some((_, entry)) => {
                self.release_code(&entry.record.code_hash, session_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<PinRecord>, StoreError> {
        Ok(self.by_session.iter().map(|entry| entry.snapshot()).collect())
    }

    async fn mark_used(
        &self,
        session_id: &SessionId,
        pin_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let entry = match self.by_session.get(session_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Ok(false),
        };
        if entry.record.id != pin_id {
            return Ok(false);
        }
        if entry
            .used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        let _ = entry.used_at.set(at);
        Ok(true)
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired: Vec<SessionId> = self
            .by_session
            .iter()
            .filter(|entry| entry.record.is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for session_id in expired {
            let taken = self
                .by_session
                .remove_if(&session_id, |_, entry| entry.record.is_expired(now));
            if let Some((_, entry)) = taken {
                self.release_code(&entry.record.code_hash, &session_id);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// Authority
// ============================================================================

/// A freshly issued PIN. The only place the plaintext code exists.
#[derive(Clone, PartialEq, Eq)]
pub struct PinIssued {
    pub pin: String,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for PinIssued {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinIssued")
            .field("pin", &mask_pin(&self.pin))
            .field("session_id", &self.session_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Lifecycle facts about a session's credential. Never contains the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinDetails {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivePin {
    pub session_id: SessionId,
    pub masked_pin: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Issues, validates and revokes session PINs.
pub struct PinAuthority {
    config: PinConfig,
    store: Arc<dyn PinStore>,
    clock: Arc<dyn Clock>,
    limiter: PinAttemptLimiter,
}

impl PinAuthority {
    pub fn new(config: PinConfig, store: Arc<dyn PinStore>, clock: Arc<dyn Clock>) -> Self {
        let limiter = PinAttemptLimiter::new(config.max_failed_attempts, config.attempt_window());
        Self {
            config,
            store,
            clock,
            limiter,
        }
    }

    /// Authority over a fresh in-process store and the system clock.
    pub fn in_memory(config: PinConfig) -> Self {
        Self::new(config, Arc::new(InMemoryPinStore::new()), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &PinConfig {
        &self.config
    }

    /// Issue a PIN with the configured lifetime, replacing any prior one.
    pub async fn generate(&self, session_id: &SessionId) -> Result<PinIssued, PinError> {
        self.generate_with_ttl(session_id, self.config.expiry()).await
    }

    /// Issue a PIN that expires `ttl` after creation.
    pub async fn generate_with_ttl(
        &self,
        session_id: &SessionId,
        ttl: Duration,
    ) -> Result<PinIssued, PinError> {
        if ttl <= Duration::zero() {
            return Err(PinError::InvalidLifetime(format!("{}s", ttl.num_seconds())));
        }

        let attempts = self.config.max_generation_attempts.max(1);
        for attempt in 1..=attempts {
            let pin = random_digits(self.config.length)?;
            let now = self.clock.now();
            let record = PinRecord::issue(*session_id, &pin, now, ttl);
            let expires_at = record.expires_at;

            if !self.store.insert_unique(record, now).await? {
                debug!(session_id = %session_id, attempt, "PIN collided with a live credential, redrawing");
                continue;
            }

            self.limiter.reset(session_id);
            info!(
                session_id = %session_id,
                pin = %mask_pin(&pin),
                expires_at = %expires_at,
                "PIN issued"
            );
            return Ok(PinIssued {
                pin,
                session_id: *session_id,
                created_at: now,
                expires_at,
            });
        }

        error!(session_id = %session_id, attempts, "no unique PIN available");
        Err(PinError::CodeSpaceExhausted(attempts))
    }

    /// Consume the session's PIN if `pin` matches a live credential.
    ///
    /// Succeeds at most once per credential, including under concurrent calls.
    pub async fn check(&self, session_id: &SessionId, pin: &str) -> Result<(), PinRejection> {
        let now = self.clock.now();
        if self.limiter.is_blocked(session_id, now) {
            return Err(PinRejection::RateLimited);
        }

        let record = self.load_live(session_id, now).await?;
        if record.session_id != *session_id || !record.matches(pin) {
            self.limiter.record_failure(session_id, now);
            return Err(PinRejection::Mismatch);
        }

        match self.store.mark_used(session_id, record.id, now).await {
            Ok(true) => {
                self.limiter.reset(session_id);
                info!(session_id = %session_id, "PIN accepted");
                Ok(())
            }
            Ok(false) => Err(PinRejection::AlreadyUsed),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "failed to consume PIN");
                Err(PinRejection::Unavailable)
            }
        }
    }

    /// Boolean form of [`check`](Self::check). Rejections are logged at warn.
    pub async fn validate(&self, session_id: &SessionId, pin: &str) -> bool {
        match self.check(session_id, pin).await {
            Ok(()) => true,
            Err(rejection) => {
                warn!(session_id = %session_id, reason = %rejection, "PIN validation failed");
                false
            }
        }
    }

    /// Same predicates as `validate` without consuming the credential or
    /// counting a failure.
    pub async fn is_valid(&self, session_id: &SessionId, pin: &str) -> bool {
        let now = self.clock.now();
        match self.store.get(session_id).await {
            Ok(Some(record)) => {
                record.session_id == *session_id && record.is_live(now) && record.matches(pin)
            }
            Ok(None) => false,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "PIN store lookup failed");
                false
            }
        }
    }

    /// Revoke the session's credential. Idempotent.
    pub async fn invalidate(&self, session_id: &SessionId) -> Result<(), PinError> {
        if self.store.remove(session_id).await? {
            info!(session_id = %session_id, "PIN invalidated");
        }
        self.limiter.reset(session_id);
        Ok(())
    }

    pub async fn details(&self, session_id: &SessionId) -> Option<PinDetails> {
        let now = self.clock.now();
        match self.store.get(session_id).await {
            Ok(record) => record.map(|r| PinDetails {
                session_id: r.session_id,
                created_at: r.created_at,
                expires_at: r.expires_at,
                used: r.used,
                used_at: r.used_at,
                expired: r.is_expired(now),
            }),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "PIN store lookup failed");
                None
            }
        }
    }

    /// Live credentials, oldest first.
    pub async fn active_pins(&self) -> Vec<ActivePin> {
        let now = self.clock.now();
        let records = match self.store.list().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "PIN store listing failed");
                return Vec::new();
            }
        };
        let mut active: Vec<ActivePin> = records
            .into_iter()
            .filter(|r| r.is_live(now))
            .map(|r| ActivePin {
                session_id: r.session_id,
                masked_pin: r.masked,
                created_at: r.created_at,
                expires_at: r.expires_at,
            })
            .collect();
        active.sort_by_key(|p| p.created_at);
        active
    }

    /// Remove expired credentials and stale attempt counters.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        self.limiter.cleanup(now);
        match self.store.remove_expired(now).await {
            Ok(removed) => {
                if removed > 0 {
                    debug!(removed, "swept expired PINs");
                }
                removed
            }
            Err(e) => {
                error!(error = %e, "PIN sweep failed");
                0
            }
        }
    }

    /// Run `sweep_expired` every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: StdDuration) -> JoinHandle<()> {
        let authority = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                authority.sweep_expired().await;
            }
        })
    }

    /// Fetch the session's credential, rejecting absent, expired and used ones.
    /// Expired credentials are removed on sight.
    async fn load_live(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<PinRecord, PinRejection> {
        let record = match self.store.get(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(PinRejection::Missing),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "PIN store lookup failed");
                return Err(PinRejection::Unavailable);
            }
        };
        if record.is_expired(now) {
            if let Err(e) = self.store.remove(session_id).await {
                warn!(session_id = %session_id, error = %e, "failed to reclaim expired PIN");
            }
            return Err(PinRejection::Expired);
        }
        if record.used {
            return Err(PinRejection::AlreadyUsed);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::ManualClock;
    use proptest::prelude::*;

    fn authority_with_clock(config: PinConfig) -> (Arc<PinAuthority>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let authority = PinAuthority::new(config, Arc::new(InMemoryPinStore::new()), clock.clone());
        (Arc::new(authority), clock)
    }

    fn wrong_pin(pin: &str) -> String {
        pin.chars()
            .map(|c| if c == '9' { '0' } else { char::from(c as u8 + 1) })
            .collect()
    }

    #[tokio::test]
    async fn generated_pin_has_configured_length() {
        let authority = PinAuthority::in_memory(PinConfig::default());
        let session = Uuid::new_v4();
        let issued = authority.generate(&session).await.unwrap();
        assert_eq!(issued.pin.len(), 6);
        assert!(issued.pin.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(issued.expires_at - issued.created_at, Duration::minutes(10));
        assert!(!format!("{:?}", issued).contains(&issued.pin));
    }

    #[tokio::test]
    async fn validate_succeeds_once() {
        let authority = PinAuthority::in_memory(PinConfig::default());
        let session = Uuid::new_v4();
        let issued = authority.generate(&session).await.unwrap();

        assert!(authority.is_valid(&session, &issued.pin).await);
        assert!(authority.validate(&session, &issued.pin).await);
        assert!(!authority.validate(&session, &issued.pin).await);
        assert_eq!(
            authority.check(&session, &issued.pin).await,
            Err(PinRejection::AlreadyUsed)
        );
        assert!(!authority.is_valid(&session, &issued.pin).await);

        let details = authority.details(&session).await.unwrap();
        assert!(details.used);
        assert!(details.used_at.is_some());
    }

    #[tokio::test]
    async fn wrong_pin_does_not_consume() {
        let authority = PinAuthority::in_memory(PinConfig::default());
        let session = Uuid::new_v4();
        let issued = authority.generate(&session).await.unwrap();

        assert_eq!(
            authority.check(&session, &wrong_pin(&issued.pin)).await,
            Err(PinRejection::Mismatch)
        );
        assert!(authority.validate(&session, &issued.pin).await);
    }

    #[tokio::test]
    async fn pin_of_other_session_is_rejected() {
        let authority = PinAuthority::in_memory(PinConfig::default());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let issued_a = authority.generate(&a).await.unwrap();
        authority.generate(&b).await.unwrap();

        assert!(!authority.validate(&b, &issued_a.pin).await);
        let unissued = Uuid::new_v4();
        assert_eq!(
            authority.check(&unissued, &issued_a.pin).await,
            Err(PinRejection::Missing)
        );
        assert!(authority.validate(&a, &issued_a.pin).await);
    }

    #[tokio::test]
    async fn expired_pin_is_permanently_invalid() {
        let (authority, clock) = authority_with_clock(PinConfig::default());
        let session = Uuid::new_v4();
        let issued = authority.generate(&session).await.unwrap();

        clock.advance(Duration::minutes(10));
        assert_eq!(
            authority.check(&session, &issued.pin).await,
            Err(PinRejection::Expired)
        );
        clock.set(issued.created_at);
        assert_eq!(
            authority.check(&session, &issued.pin).await,
            Err(PinRejection::Missing)
        );
    }

    #[tokio::test]
    async fn regenerate_revokes_previous_pin() {
        let authority = PinAuthority::in_memory(PinConfig::default());
        let session = Uuid::new_v4();
        let first = authority.generate(&session).await.unwrap();
        let second = authority.generate(&session).await.unwrap();

        if first.pin != second.pin {
            assert!(!authority.is_valid(&session, &first.pin).await);
        }
        assert!(authority.validate(&session, &second.pin).await);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let authority = PinAuthority::in_memory(PinConfig::default());
        let session = Uuid::new_v4();
        let issued = authority.generate(&session).await.unwrap();

        authority.invalidate(&session).await.unwrap();
        authority.invalidate(&session).await.unwrap();
        assert!(!authority.validate(&session, &issued.pin).await);
        assert!(authority.details(&session).await.is_none());
    }

    #[tokio::test]
    async fn failed_attempts_lock_out_session() {
        let config = PinConfig {
            max_failed_attempts: 3,
            ..PinConfig::default()
        };
        let (authority, clock) = authority_with_clock(config);
        let session = Uuid::new_v4();
        let issued = authority.generate(&session).await.unwrap();
        let wrong = wrong_pin(&issued.pin);

        for _ in 0..3 {
            assert_eq!(authority.check(&session, &wrong).await, Err(PinRejection::Mismatch));
        }
        assert_eq!(
            authority.check(&session, &issued.pin).await,
            Err(PinRejection::RateLimited)
        );

        clock.advance(Duration::seconds(61));
        assert!(authority.validate(&session, &issued.pin).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_validation_accepts_exactly_once() {
        let authority = Arc::new(PinAuthority::in_memory(PinConfig::default()));
        let session = Uuid::new_v4();
        let issued = authority.generate(&session).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let authority = Arc::clone(&authority);
            let pin = issued.pin.clone();
            tasks.push(tokio::spawn(async move { authority.validate(&session, &pin).await }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_on_one_code_admit_one_session() {
        let now = Utc::now();
        for _ in 0..50 {
            let store = Arc::new(InMemoryPinStore::new());
            let barrier = Arc::new(tokio::sync::Barrier::new(8));

            let mut tasks = Vec::new();
            for _ in 0..8 {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                tasks.push(tokio::spawn(async move {
                    let session = Uuid::new_v4();
                    let record = PinRecord::issue(session, "4821", now, Duration::minutes(10));
                    barrier.wait().await;
                    store.insert_unique(record, now).await.unwrap()
                }));
            }

            let mut admitted = 0;
            for task in tasks {
                if task.await.unwrap() {
                    admitted += 1;
                }
            }
            assert_eq!(admitted, 1);
            assert_eq!(store.len(), 1);
        }
    }

    #[tokio::test]
    async fn live_codes_are_unique_across_sessions() {
        let config = PinConfig {
            length: 1,
            max_generation_attempts: 400,
            ..PinConfig::default()
        };
        let authority = PinAuthority::in_memory(config);

        let mut codes = std::collections::HashSet::new();
        for _ in 0..10 {
            let issued = authority.generate(&Uuid::new_v4()).await.unwrap();
            assert!(codes.insert(issued.pin));
        }
        assert_eq!(codes.len(), 10);

        let err = authority.generate(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PinError::CodeSpaceExhausted(400)));
    }

    #[tokio::test]
    async fn consumed_code_can_be_reissued_elsewhere() {
        let config = PinConfig {
            length: 1,
            max_generation_attempts: 400,
            ..PinConfig::default()
        };
        let authority = PinAuthority::in_memory(config);

        let mut issued = Vec::new();
        for _ in 0..10 {
            let session = Uuid::new_v4();
            issued.push((session, authority.generate(&session).await.unwrap()));
        }
        let (session, first) = &issued[0];
        assert!(authority.validate(session, &first.pin).await);

        let latecomer = Uuid::new_v4();
        let reissued = authority.generate(&latecomer).await.unwrap();
        assert_eq!(reissued.pin, first.pin);
    }

    #[tokio::test]
    async fn temporary_pin_uses_requested_ttl() {
        let (authority, clock) = authority_with_clock(PinConfig::default());
        let session = Uuid::new_v4();
        let issued = authority
            .generate_with_ttl(&session, Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(issued.expires_at - issued.created_at, Duration::minutes(2));

        clock.advance(Duration::minutes(3));
        assert!(!authority.validate(&session, &issued.pin).await);

        let err = authority
            .generate_with_ttl(&session, Duration::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, PinError::InvalidLifetime(_)));
    }

    #[tokio::test]
    async fn sweep_and_active_listing() {
        let (authority, clock) = authority_with_clock(PinConfig::default());
        let short = Uuid::new_v4();
        let long = Uuid::new_v4();
        authority
            .generate_with_ttl(&short, Duration::minutes(1))
            .await
            .unwrap();
        let kept = authority.generate(&long).await.unwrap();

        assert_eq!(authority.active_pins().await.len(), 2);

        clock.advance(Duration::minutes(2));
        let active = authority.active_pins().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, long);
        assert_eq!(active[0].masked_pin, mask_pin(&kept.pin));
        assert!(active[0].masked_pin.ends_with("****"));

        assert_eq!(authority.sweep_expired().await, 1);
        assert!(authority.details(&short).await.is_none());
        assert!(authority.details(&long).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_reclaims_expired() {
        let (authority, clock) = authority_with_clock(PinConfig::default());
        let session = Uuid::new_v4();
        authority
            .generate_with_ttl(&session, Duration::minutes(1))
            .await
            .unwrap();
        clock.advance(Duration::minutes(5));

        let sweeper = authority.spawn_sweeper(StdDuration::from_secs(60));
        tokio::time::sleep(StdDuration::from_secs(1)).await;
        assert!(authority.details(&session).await.is_none());
        sweeper.abort();
    }

    #[test]
    fn masks_all_but_leading_digits() {
        assert_eq!(mask_pin("123456"), "12****");
        assert_eq!(mask_pin("7"), "7");
        assert_eq!(mask_pin(""), "");
    }

    #[test]
    fn digits_are_unbiased() {
        let mut counts = [0usize; 10];
        let sample = random_digits(50_000).unwrap();
        for c in sample.chars() {
            counts[c.to_digit(10).unwrap() as usize] += 1;
        }
        // Expected 5000 each; a 10% band is far beyond sampling noise.
        for (digit, count) in counts.iter().enumerate() {
            assert!(
                (4500..=5500).contains(count),
                "digit {} drawn {} times",
                digit,
                count
            );
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn random_digits_have_requested_length(length in 1usize..=12) {
            let code = random_digits(length).unwrap();
            prop_assert_eq!(code.len(), length);
            prop_assert!(code.chars().all(|c| c.is_ascii_digit()));
        }

        #[test]
        fn hash_match_agrees_with_equality(a in "[0-9]{6}", b in "[0-9]{6}") {
            let record = PinRecord::issue(Uuid::new_v4(), &a, Utc::now(), Duration::minutes(1));
            prop_assert_eq!(record.matches(&b), a == b);
        }
    }
}
