//! Customer profile registry.
//!
//! Profiles hang off the opaque identity principal. The core needs them
//! only for the kitchen ticket projection and delivery contact details;
//! authentication itself stays with the identity collaborator.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::identity::{AdminGate, Principal};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub principal: Principal,
    pub name: String,
    pub phone_number: String,
    pub pickup_address: String,
}

/// Create or update the caller's own profile.
pub fn register_customer(
    db: &DbState,
    caller: &Principal,
    name: &str,
    phone_number: &str,
    pickup_address: &str,
) -> CoreResult<()> {
    let name = name.trim();
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO customers (principal, name, phone_number, pickup_address, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(principal) DO UPDATE SET
            name = excluded.name,
            phone_number = excluded.phone_number,
            pickup_address = excluded.pickup_address,
            updated_at = excluded.updated_at",
        params![caller.as_str(), name, phone_number, pickup_address],
    )?;
    info!(principal = %caller, "Customer registered");
    Ok(())
}

/// Fetch a profile. Callers may read their own; admins may read any.
pub fn get_customer(
    db: &DbState,
    gate: &dyn AdminGate,
    caller: &Principal,
    principal: &Principal,
) -> CoreResult<Customer> {
    if caller != principal && !gate.is_admin(caller) {
        return Err(CoreError::Forbidden(format!(
            "{caller} may not read another customer's profile"
        )));
    }
    let conn = db.lock()?;
    conn.query_row(
        "SELECT principal, name, phone_number, pickup_address
         FROM customers WHERE principal = ?1",
        params![principal.as_str()],
        |row| {
            Ok(Customer {
                principal: Principal::new(row.get::<_, String>(0)?),
                name: row.get(1)?,
                phone_number: row.get(2)?,
                pickup_address: row.get(3)?,
            })
        },
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            CoreError::NotFound(format!("customer {principal}"))
        }
        other => CoreError::Storage(other),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::identity::RoleGate;
    use std::sync::Arc;

    #[test]
    fn test_register_and_read_own_profile() {
        let db = Arc::new(db::test_db());
        let gate = RoleGate::new(db.clone());
        let alice = Principal::from("alice");

        register_customer(&db, &alice, "Alice", "555-0101", "12 Main St").unwrap();
        let profile = get_customer(&db, &gate, &alice, &alice).unwrap();
        assert_eq!(profile.name, "Alice");
        assert_eq!(profile.pickup_address, "12 Main St");

        // Re-registering updates in place
        register_customer(&db, &alice, "Alice B.", "555-0101", "14 Main St").unwrap();
        let profile = get_customer(&db, &gate, &alice, &alice).unwrap();
        assert_eq!(profile.name, "Alice B.");
    }

    #[test]
    fn test_cross_customer_read_requires_admin() {
        let db = Arc::new(db::test_db());
        let gate = RoleGate::new(db.clone());
        let alice = Principal::from("alice");
        let bob = Principal::from("bob");
        let staff = Principal::from("staff");

        register_customer(&db, &alice, "Alice", "", "").unwrap();

        let err = get_customer(&db, &gate, &bob, &alice).unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        gate.bootstrap_admin(&staff).unwrap();
        assert!(get_customer(&db, &gate, &staff, &alice).is_ok());
    }

    #[test]
    fn test_unknown_customer_is_not_found() {
        let db = Arc::new(db::test_db());
        let gate = RoleGate::new(db.clone());
        let alice = Principal::from("alice");
        let err = get_customer(&db, &gate, &alice, &alice).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
