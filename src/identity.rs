//! Identity boundary: principals, roles, and the admin capability gate.
//!
//! The identity collaborator supplies a stable, opaque principal for the
//! current caller. The core never parses principals; it only compares them
//! and checks the admin claim through [`AdminGate`]. Privileged operations
//! re-verify that claim at call time via [`ensure_admin`] rather than
//! caching it.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// Opaque caller identity supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(raw: impl Into<String>) -> Self {
        Principal(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(raw: &str) -> Self {
        Principal(raw.to_string())
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Role attested for a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    Guest,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Guest => "guest",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            "guest" => Some(Role::Guest),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Admin gate
// ---------------------------------------------------------------------------

/// Capability check consumed from the identity collaborator.
///
/// Implementations must answer from current state on every call — the
/// admin claim is untrusted-but-attested input and is never cached by
/// the core.
pub trait AdminGate: Send + Sync {
    fn is_admin(&self, principal: &Principal) -> bool;
}

/// Uniform authorization guard for every privileged operation.
pub fn ensure_admin(gate: &dyn AdminGate, caller: &Principal) -> CoreResult<()> {
    if gate.is_admin(caller) {
        return Ok(());
    }
    Err(CoreError::Forbidden(format!(
        "{caller} lacks the admin capability"
    )))
}

// ---------------------------------------------------------------------------
// Role registry
// ---------------------------------------------------------------------------

/// Database-backed role assignments.
///
/// Unassigned principals are guests.
pub struct RoleGate {
    db: Arc<DbState>,
}

impl RoleGate {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Role currently assigned to a principal.
    pub fn role_of(&self, principal: &Principal) -> CoreResult<Role> {
        let conn = self.db.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT role FROM user_roles WHERE principal = ?1",
                params![principal.as_str()],
                |row| row.get(0),
            )
            .ok();
        Ok(raw.and_then(|r| Role::parse(&r)).unwrap_or(Role::Guest))
    }

    /// Assign a role to a principal. Admin-only.
    pub fn assign_role(
        &self,
        gate: &dyn AdminGate,
        caller: &Principal,
        target: &Principal,
        role: Role,
    ) -> CoreResult<()> {
        ensure_admin(gate, caller)?;
        self.write_role(target, role)?;
        info!(target = %target, role = role.as_str(), "Role assigned");
        Ok(())
    }

    /// Grant the very first admin role.
    ///
    /// Only legal while no admin exists; afterwards role changes go
    /// through [`RoleGate::assign_role`].
    pub fn bootstrap_admin(&self, principal: &Principal) -> CoreResult<()> {
        {
            let conn = self.db.lock()?;
            let admins: i64 = conn.query_row(
                "SELECT COUNT(*) FROM user_roles WHERE role = 'admin'",
                [],
                |row| row.get(0),
            )?;
            if admins > 0 {
                return Err(CoreError::Forbidden(
                    "an administrator is already configured".into(),
                ));
            }
        }
        self.write_role(principal, Role::Admin)?;
        info!(principal = %principal, "Initial admin bootstrapped");
        Ok(())
    }

    fn write_role(&self, principal: &Principal, role: Role) -> CoreResult<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO user_roles (principal, role, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(principal) DO UPDATE SET
                role = excluded.role,
                updated_at = excluded.updated_at",
            params![principal.as_str(), role.as_str()],
        )?;
        Ok(())
    }
}

impl AdminGate for RoleGate {
    fn is_admin(&self, principal: &Principal) -> bool {
        matches!(self.role_of(principal), Ok(Role::Admin))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn role_gate() -> RoleGate {
        RoleGate::new(Arc::new(db::test_db()))
    }

    #[test]
    fn test_unassigned_principal_is_guest() {
        let gate = role_gate();
        let p = Principal::from("nobody");
        assert_eq!(gate.role_of(&p).unwrap(), Role::Guest);
        assert!(!gate.is_admin(&p));
    }

    #[test]
    fn test_bootstrap_then_assign() {
        let gate = role_gate();
        let root = Principal::from("root");
        let user = Principal::from("alice");

        gate.bootstrap_admin(&root).unwrap();
        assert!(gate.is_admin(&root));

        // Second bootstrap is rejected
        let err = gate.bootstrap_admin(&user).unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        // Admin can promote others
        gate.assign_role(&gate, &root, &user, Role::User).unwrap();
        assert_eq!(gate.role_of(&user).unwrap(), Role::User);
        assert!(!gate.is_admin(&user));
    }

    #[test]
    fn test_assign_role_requires_admin() {
        let gate = role_gate();
        let alice = Principal::from("alice");
        let bob = Principal::from("bob");
        let err = gate
            .assign_role(&gate, &alice, &bob, Role::Admin)
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
        assert_eq!(gate.role_of(&bob).unwrap(), Role::Guest);
    }

    #[test]
    fn test_ensure_admin_uniform_error() {
        let gate = role_gate();
        let err = ensure_admin(&gate, &Principal::from("rando")).unwrap_err();
        assert!(err.to_string().contains("admin capability"));
    }
}
