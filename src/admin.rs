//! Admin reconciliation interface.
//!
//! Privileged operations that mutate order and payment state outside the
//! customer-driven flow: manual COD settlement, forced completion for
//! disputes, and cancellation. Every operation re-verifies the admin
//! claim through [`ensure_admin`] at call time and writes a row to the
//! `admin_actions` audit table, which is separate from the
//! customer-visible tracking timeline.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::identity::{ensure_admin, AdminGate, Principal};
use crate::orders::{self, OrderStatus};
use crate::payment;
use crate::tracking;

/// One audit record of a privileged operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAction {
    pub id: i64,
    pub order_id: Option<i64>,
    pub action: String,
    pub actor: String,
    pub detail: String,
    pub created_at: String,
}

/// Manually settle a cash-on-delivery order.
///
/// Legal only for COD orders whose payment is still pending; the order
/// advances straight to `completed` (COD settlement implies fulfillment
/// confirmation in this domain).
pub fn mark_cod_settled(
    db: &DbState,
    gate: &dyn AdminGate,
    caller: &Principal,
    order_id: i64,
) -> CoreResult<()> {
    ensure_admin(gate, caller)?;
    payment::settle_cod(db, caller, order_id)?;
    Ok(())
}

/// Force an order to `completed` regardless of payment state.
///
/// Escape hatch for disputes. Bypasses the sanctioned transition table;
/// already-completed orders are left untouched.
pub fn force_complete(
    db: &DbState,
    gate: &dyn AdminGate,
    caller: &Principal,
    order_id: i64,
) -> CoreResult<()> {
    ensure_admin(gate, caller)?;
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| {
        let order = orders::load_order_txn(&conn, order_id)?;
        if order.status == OrderStatus::Completed {
            return Ok(false);
        }
        orders::set_status_txn(&conn, order_id, OrderStatus::Completed)?;
        tracking::append_entry(
            &conn,
            order_id,
            OrderStatus::Completed,
            "Order completed by manual override",
        )?;
        record_action_txn(
            &conn,
            Some(order_id),
            "force_complete",
            caller,
            &format!("previous status {}", order.status.as_str()),
        )?;
        Ok(true)
    })();
    match result {
        Ok(mutated) => {
            conn.execute_batch("COMMIT")?;
            if mutated {
                warn!(order_id, actor = %caller, "Order force-completed by admin");
            }
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Cancel an order that has not progressed past `confirmed` and has no
/// settled payment.
pub fn cancel_order(
    db: &DbState,
    gate: &dyn AdminGate,
    caller: &Principal,
    order_id: i64,
    reason: &str,
) -> CoreResult<()> {
    ensure_admin(gate, caller)?;
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| {
        let order = orders::load_order_txn(&conn, order_id)?;
        if order.payment.is_completed()
            || !orders::can_transition(order.status, OrderStatus::Canceled)
        {
            return Err(CoreError::InvalidStateTransition {
                order_id,
                from: order.status.as_str().into(),
                to: "canceled".into(),
            });
        }
        conn.execute(
            "UPDATE orders SET cancellation_reason = ?1 WHERE id = ?2",
            params![reason, order_id],
        )?;
        orders::set_status_txn(&conn, order_id, OrderStatus::Canceled)?;
        tracking::append_entry(
            &conn,
            order_id,
            OrderStatus::Canceled,
            &format!("Order canceled: {reason}"),
        )?;
        record_action_txn(&conn, Some(order_id), "cancel_order", caller, reason)?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            warn!(order_id, actor = %caller, reason, "Order canceled by admin");
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Audit rows for one order, oldest first. Admin-only.
pub fn list_actions_for_order(
    db: &DbState,
    gate: &dyn AdminGate,
    caller: &Principal,
    order_id: i64,
) -> CoreResult<Vec<AdminAction>> {
    ensure_admin(gate, caller)?;
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, order_id, action, actor, detail, created_at
         FROM admin_actions WHERE order_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![order_id], |row| {
        Ok(AdminAction {
            id: row.get(0)?,
            order_id: row.get(1)?,
            action: row.get(2)?,
            actor: row.get(3)?,
            detail: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;
    let mut actions = Vec::new();
    for row in rows {
        actions.push(row?);
    }
    Ok(actions)
}

pub(crate) fn record_action_txn(
    conn: &Connection,
    order_id: Option<i64>,
    action: &str,
    actor: &Principal,
    detail: &str,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO admin_actions (order_id, action, actor, detail)
         VALUES (?1, ?2, ?3, ?4)",
        params![order_id, action, actor.as_str(), detail],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::CartLine;
    use crate::catalog::StaticCatalog;
    use crate::db;
    use crate::identity::RoleGate;
    use crate::orders::{place_order, PaymentMethod, PaymentStatus};
    use std::sync::Arc;

    struct Fixture {
        db: Arc<db::DbState>,
        gate: RoleGate,
        staff: Principal,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(db::test_db());
        let gate = RoleGate::new(db.clone());
        let staff = Principal::from("staff");
        gate.bootstrap_admin(&staff).unwrap();
        Fixture { db, gate, staff }
    }

    fn order_with(f: &Fixture, method: PaymentMethod) -> i64 {
        let catalog = StaticCatalog::new().with_product(1, "Olive Oil 500ml", 1200);
        place_order(
            &f.db,
            &catalog,
            &Principal::from("alice"),
            &[CartLine { product_id: 1, quantity: 1 }],
            method,
            None,
        )
        .unwrap()
    }

    fn load(f: &Fixture, order_id: i64) -> crate::orders::Order {
        let conn = f.db.lock().unwrap();
        orders::load_order_txn(&conn, order_id).unwrap()
    }

    #[test]
    fn test_cod_settlement_is_admin_gated_and_audited() {
        let f = fixture();
        let order_id = order_with(&f, PaymentMethod::CashOnDelivery);

        // Non-admin is rejected without mutation
        let err =
            mark_cod_settled(&f.db, &f.gate, &Principal::from("alice"), order_id).unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
        assert_eq!(load(&f, order_id).payment, PaymentStatus::Pending);

        mark_cod_settled(&f.db, &f.gate, &f.staff, order_id).unwrap();
        assert_eq!(load(&f, order_id).status, OrderStatus::Completed);

        let actions = list_actions_for_order(&f.db, &f.gate, &f.staff, order_id).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, "cod_settled");
        assert_eq!(actions[0].actor, "staff");
    }

    #[test]
    fn test_force_complete_overrides_unpaid_order() {
        let f = fixture();
        let order_id = order_with(&f, PaymentMethod::CardPayment);

        force_complete(&f.db, &f.gate, &f.staff, order_id).unwrap();
        let order = load(&f, order_id);
        assert_eq!(order.status, OrderStatus::Completed);
        // Payment state is untouched by the override
        assert_eq!(order.payment, PaymentStatus::Pending);

        let entries = crate::tracking::get_tracking(&f.db, order_id).unwrap();
        assert_eq!(entries.last().unwrap().note, "Order completed by manual override");

        let actions = list_actions_for_order(&f.db, &f.gate, &f.staff, order_id).unwrap();
        assert_eq!(actions[0].action, "force_complete");

        // Second call is a quiet no-op: no extra tracking or audit rows
        force_complete(&f.db, &f.gate, &f.staff, order_id).unwrap();
        assert_eq!(crate::tracking::get_tracking(&f.db, order_id).unwrap().len(), entries.len());
        assert_eq!(
            list_actions_for_order(&f.db, &f.gate, &f.staff, order_id)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_cancel_order_paths() {
        let f = fixture();
        let order_id = order_with(&f, PaymentMethod::CardPayment);

        cancel_order(&f.db, &f.gate, &f.staff, order_id, "out of stock").unwrap();
        let order = load(&f, order_id);
        assert_eq!(order.status, OrderStatus::Canceled);

        // Canceling again is an illegal transition
        let err = cancel_order(&f.db, &f.gate, &f.staff, order_id, "again").unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));

        // Settled orders cannot be canceled
        let paid = order_with(&f, PaymentMethod::CardPayment);
        crate::payment::mark_completed(&f.db, paid, "sess_1", 1200).unwrap();
        let err = cancel_order(&f.db, &f.gate, &f.staff, paid, "too late").unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_settling_canceled_order_is_rejected() {
        let f = fixture();
        let order_id = order_with(&f, PaymentMethod::CashOnDelivery);
        cancel_order(&f.db, &f.gate, &f.staff, order_id, "customer asked").unwrap();

        let err = mark_cod_settled(&f.db, &f.gate, &f.staff, order_id).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_admin_claim_reverified_each_call() {
        let f = fixture();
        let order_id = order_with(&f, PaymentMethod::CashOnDelivery);
        let former = Principal::from("former-staff");
        f.gate
            .assign_role(&f.gate, &f.staff, &former, crate::identity::Role::Admin)
            .unwrap();

        // Demote, then attempt a privileged call: the gate answers from
        // current state, so the demoted principal is rejected.
        f.gate
            .assign_role(&f.gate, &f.staff, &former, crate::identity::Role::User)
            .unwrap();
        let err = mark_cod_settled(&f.db, &f.gate, &former, order_id).unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }
}
