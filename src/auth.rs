//! Credential-gated admin access with bcrypt.
//!
//! Provides admin login, credential rotation, and lockout tracking.
//! Credential hashes are stored in the SQLite `local_settings` table
//! (category "admin", keys "username" / "password_hash"). Sessions are
//! kept in-memory and expire on inactivity or max duration; an active
//! session is what grants the admin capability to the reconciliation
//! operations, via the [`AdminGate`] implementation.

use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{CoreError, CoreResult};
use crate::identity::{AdminGate, Principal};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 30;
const SESSION_MAX_DURATION_HOURS: i64 = 2;

const SETTINGS_CATEGORY: &str = "admin";
const USERNAME_KEY: &str = "username";
const PASSWORD_HASH_KEY: &str = "password_hash";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An active admin session.
#[derive(Clone)]
struct AdminSession {
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl AdminSession {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_activity: now,
            expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
        }
    }

    /// Check whether this session has expired (inactivity or max duration).
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if now >= self.expires_at {
            return true;
        }
        if now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES) {
            return true;
        }
        false
    }
}

/// Lockout tracking entry.
struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

/// In-memory authentication state.
pub struct AuthState {
    sessions: Mutex<HashMap<Principal, AdminSession>>,
    lockout: Mutex<LockoutEntry>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lockout: Mutex::new(LockoutEntry {
                attempts: 0,
                last_attempt: Utc::now(),
            }),
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminGate for AuthState {
    /// A principal holds the admin capability while it has an unexpired
    /// session. Answers from current state on every call; expired
    /// sessions are dropped here rather than by a background sweeper.
    fn is_admin(&self, principal: &Principal) -> bool {
        let mut sessions = match self.sessions.lock() {
            Ok(s) => s,
            Err(_) => return false,
        };
        let now = Utc::now();
        match sessions.get_mut(principal) {
            Some(session) if !session.is_expired(now) => {
                session.last_activity = now;
                true
            }
            Some(_) => {
                sessions.remove(principal);
                false
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Credential management
// ---------------------------------------------------------------------------

/// Configure the initial admin credentials. Only legal while none exist;
/// afterwards changes go through [`rotate_credentials`].
pub fn set_initial_credentials(db: &DbState, username: &str, password: &str) -> CoreResult<()> {
    validate_credentials(username, password)?;
    let conn = db.lock()?;
    if db::get_setting(&conn, SETTINGS_CATEGORY, PASSWORD_HASH_KEY).is_some() {
        return Err(CoreError::Credentials(
            "credentials are already configured".into(),
        ));
    }
    let password_hash = hash(password, DEFAULT_COST)
        .map_err(|e| CoreError::Internal(format!("hash password: {e}")))?;
    db::set_setting(&conn, SETTINGS_CATEGORY, USERNAME_KEY, username)?;
    db::set_setting(&conn, SETTINGS_CATEGORY, PASSWORD_HASH_KEY, &password_hash)?;
    info!("Initial admin credentials configured");
    Ok(())
}

/// Replace the admin credentials. Requires the current pair.
pub fn rotate_credentials(
    db: &DbState,
    current_username: &str,
    current_password: &str,
    new_username: &str,
    new_password: &str,
) -> CoreResult<()> {
    validate_credentials(new_username, new_password)?;
    let conn = db.lock()?;
    verify_credentials_locked(&conn, current_username, current_password)?;
    let password_hash = hash(new_password, DEFAULT_COST)
        .map_err(|e| CoreError::Internal(format!("hash password: {e}")))?;
    db::set_setting(&conn, SETTINGS_CATEGORY, USERNAME_KEY, new_username)?;
    db::set_setting(&conn, SETTINGS_CATEGORY, PASSWORD_HASH_KEY, &password_hash)?;
    info!("Admin credentials rotated");
    Ok(())
}

fn validate_credentials(username: &str, password: &str) -> CoreResult<()> {
    if username.trim().is_empty() {
        return Err(CoreError::Credentials("username must not be empty".into()));
    }
    if password.len() < 8 {
        return Err(CoreError::Credentials(
            "password must be at least 8 characters".into(),
        ));
    }
    Ok(())
}

fn verify_credentials_locked(
    conn: &rusqlite::Connection,
    username: &str,
    password: &str,
) -> CoreResult<()> {
    let stored_username = db::get_setting(conn, SETTINGS_CATEGORY, USERNAME_KEY);
    let stored_hash = db::get_setting(conn, SETTINGS_CATEGORY, PASSWORD_HASH_KEY);
    let (stored_username, stored_hash) = match (stored_username, stored_hash) {
        (Some(u), Some(h)) => (u, h),
        _ => return Err(CoreError::Credentials("Credentials not set".into())),
    };

    let password_ok = verify(password, &stored_hash).unwrap_or(false);
    if stored_username != username || !password_ok {
        return Err(CoreError::Credentials("Wrong username or password".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Login / logout
// ---------------------------------------------------------------------------

/// Authenticate the calling principal as an administrator.
///
/// On success an in-memory session is opened for the principal, which
/// then passes [`AdminGate::is_admin`] until it expires or logs out.
pub fn authenticate_admin(
    db: &DbState,
    state: &AuthState,
    principal: &Principal,
    username: &str,
    password: &str,
) -> CoreResult<()> {
    {
        let lockout = state
            .lockout
            .lock()
            .map_err(|e| CoreError::Internal(format!("lockout lock poisoned: {e}")))?;
        check_lockout(&lockout)?;
    }

    let verified = {
        let conn = db.lock()?;
        verify_credentials_locked(&conn, username, password)
    };

    if let Err(e) = verified {
        if let Ok(mut lockout) = state.lockout.lock() {
            record_failure(&mut lockout);
        }
        return Err(e);
    }

    let mut sessions = state
        .sessions
        .lock()
        .map_err(|e| CoreError::Internal(format!("session lock poisoned: {e}")))?;
    sessions.insert(principal.clone(), AdminSession::new(Utc::now()));
    drop(sessions);

    if let Ok(mut lockout) = state.lockout.lock() {
        lockout.attempts = 0;
    }

    info!(principal = %principal, "Admin authenticated");
    Ok(())
}

/// Close the principal's admin session, if any.
pub fn logout(state: &AuthState, principal: &Principal) {
    if let Ok(mut sessions) = state.sessions.lock() {
        sessions.remove(principal);
    }
}

// ---------------------------------------------------------------------------
// Lockout helpers
// ---------------------------------------------------------------------------

/// Check whether admin login is currently locked out.
fn check_lockout(lockout: &LockoutEntry) -> CoreResult<()> {
    if lockout.attempts >= MAX_FAILED_ATTEMPTS {
        let elapsed = Utc::now() - lockout.last_attempt;
        if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
            let remaining = LOCKOUT_MINUTES - elapsed.num_minutes();
            return Err(CoreError::Credentials(format!(
                "Too many failed attempts. Try again in {remaining} minute(s)."
            )));
        }
        // Lockout period has elapsed — reset happens on next successful login
    }
    Ok(())
}

/// Record a failed login attempt.
fn record_failure(lockout: &mut LockoutEntry) {
    lockout.attempts += 1;
    lockout.last_attempt = Utc::now();
    warn!(attempts = lockout.attempts, "failed admin login attempt");
}

// ===========================================================================
// Tests
// ===========================================================================
