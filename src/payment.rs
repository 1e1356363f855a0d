//! Payment state machine.
//!
//! Tracks settlement per order: `pending -> completed` (terminal) or
//! `pending -> failed` (retryable; a fresh checkout attempt re-enters
//! pending). There is no transition out of `completed` — settlement
//! happens at most once, and repeat attempts hit the idempotence guard.
//!
//! All monetary amounts are integer cents; idempotence comparisons are
//! exact integer equality, never floating point.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{info, warn};
use uuid::Uuid;

use crate::admin;
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::identity::Principal;
use crate::orders::{self, OrderStatus, PaymentMethod, PaymentStatus};
use crate::tracking;

/// Record a settled card payment for an order.
///
/// Idempotent: if the order already completed under the same
/// `session_ref`, this returns success without touching anything, so
/// duplicate poll observations (or a second browser tab) converge on one
/// settlement. A *different* ref on an already-completed order raises
/// [`CoreError::AlreadySettled`] loudly — that shape signals double-charge
/// confusion, not a retry.
///
/// On first settlement the order advances `pending -> confirmed`
/// (an already-confirmed order keeps its status) and a tracking entry is
/// appended.
pub fn mark_completed(
    db: &DbState,
    order_id: i64,
    session_ref: &str,
    amount_cents: i64,
) -> CoreResult<()> {
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| {
        let order = orders::load_order_txn(&conn, order_id)?;

        if let PaymentStatus::Completed {
            session_ref: ref settled_ref,
            ..
        } = order.payment
        {
            if settled_ref == session_ref {
                // Duplicate observation of the same settlement
                return Ok(false);
            }
            return Err(CoreError::AlreadySettled {
                order_id,
                session_ref: settled_ref.clone(),
            });
        }

        if matches!(order.status, OrderStatus::Expired | OrderStatus::Canceled) {
            return Err(CoreError::InvalidStateTransition {
                order_id,
                from: order.status.as_str().into(),
                to: "payment completed".into(),
            });
        }

        write_completed_txn(&conn, order_id, session_ref, amount_cents)?;

        let new_status = if order.status == OrderStatus::Pending {
            orders::set_status_txn(&conn, order_id, OrderStatus::Confirmed)?;
            OrderStatus::Confirmed
        } else {
            order.status
        };
        tracking::append_entry(
            &conn,
            order_id,
            new_status,
            &format!("Payment received (session {session_ref})"),
        )?;
        Ok(true)
    })();

    match result {
        Ok(mutated) => {
            conn.execute_batch("COMMIT")?;
            if mutated {
                info!(order_id, session_ref, amount_cents, "Payment settled");
            } else {
                info!(order_id, session_ref, "Duplicate settlement observation ignored");
            }
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Record a failed payment attempt.
///
/// The order stays `pending` so the customer can retry checkout; only the
/// payment sub-state moves to `failed` with the provider's reason.
pub fn mark_failed(db: &DbState, order_id: i64, reason: &str) -> CoreResult<()> {
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| {
        let order = orders::load_order_txn(&conn, order_id)?;
        if order.payment.is_completed() {
            return Err(CoreError::InvalidStateTransition {
                order_id,
                from: "payment completed".into(),
                to: "payment failed".into(),
            });
        }
        conn.execute(
            "UPDATE orders SET
                payment_status = 'failed',
                payment_failure_reason = ?1,
                payment_amount_cents = NULL,
                payment_session_ref = NULL,
                payment_completed_at = NULL,
                updated_at = ?2
             WHERE id = ?3",
            params![reason, Utc::now().to_rfc3339(), order_id],
        )?;
        tracking::append_entry(
            &conn,
            order_id,
            order.status,
            &format!("Payment failed: {reason}"),
        )?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            warn!(order_id, reason, "Payment failed");
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Settle a cash-on-delivery order. Guarded by the admin module, which
/// re-verifies the caller's admin claim before delegating here.
///
/// COD settlement implies fulfillment confirmation in this domain, so the
/// order advances straight to `completed` with a synthetic session ref and
/// the full order total as the settled amount. The audit row is written
/// in the same transaction as the settlement.
pub(crate) fn settle_cod(db: &DbState, actor: &Principal, order_id: i64) -> CoreResult<String> {
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| {
        let order = orders::load_order_txn(&conn, order_id)?;

        if order.payment_method != PaymentMethod::CashOnDelivery {
            return Err(CoreError::InvalidPaymentMethod(format!(
                "order {order_id} is a card-payment order"
            )));
        }
        if let PaymentStatus::Completed {
            session_ref: ref settled_ref,
            ..
        } = order.payment
        {
            return Err(CoreError::AlreadySettled {
                order_id,
                session_ref: settled_ref.clone(),
            });
        }
        if matches!(order.status, OrderStatus::Expired | OrderStatus::Canceled) {
            return Err(CoreError::InvalidStateTransition {
                order_id,
                from: order.status.as_str().into(),
                to: "cod settled".into(),
            });
        }

        let session_ref = format!("cod-{}", Uuid::new_v4());
        write_completed_txn(&conn, order_id, &session_ref, order.total_price_cents)?;
        orders::set_status_txn(&conn, order_id, OrderStatus::Completed)?;
        tracking::append_entry(
            &conn,
            order_id,
            OrderStatus::Completed,
            "Cash payment collected on delivery",
        )?;
        admin::record_action_txn(
            &conn,
            Some(order_id),
            "cod_settled",
            actor,
            &format!("settled under {session_ref}"),
        )?;
        Ok(session_ref)
    })();

    match result {
        Ok(session_ref) => {
            conn.execute_batch("COMMIT")?;
            info!(order_id, session_ref = %session_ref, "COD order settled");
            Ok(session_ref)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn write_completed_txn(
    conn: &Connection,
    order_id: i64,
    session_ref: &str,
    amount_cents: i64,
) -> CoreResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE orders SET
            payment_status = 'completed',
            payment_amount_cents = ?1,
            payment_session_ref = ?2,
            payment_completed_at = ?3,
            payment_failure_reason = NULL,
            updated_at = ?3
         WHERE id = ?4",
        params![amount_cents, session_ref, now, order_id],
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
    use crate::db::{self, DbState};
    use crate::identity::Principal;
    use crate::orders::{place_order, Order};
    use std::sync::Arc;

    fn fixture(method: PaymentMethod) -> (Arc<DbState>, i64) {
        let db = Arc::new(db::test_db());
        let catalog = StaticCatalog::new().with_product(1, "Basmati Rice 1kg", 5000);
        let lines = vec![CartLine { product_id: 1, quantity: 2 }];
        let order_id =
            place_order(&db, &catalog, &Principal::from("alice"), &lines, method, None).unwrap();
        (db, order_id)
    }

    fn load(db: &DbState, order_id: i64) -> Order {
        let conn = db.lock().unwrap();
        orders::load_order_txn(&conn, order_id).unwrap()
    }

    #[test]
    fn test_settlement_advances_pending_to_confirmed() {
        let (db, order_id) = fixture(PaymentMethod::CardPayment);
        mark_completed(&db, order_id, "sess_1", 10000).unwrap();

        let order = load(&db, order_id);
        assert_eq!(order.status, OrderStatus::Confirmed);
        match &order.payment {
            PaymentStatus::Completed { amount_cents, session_ref, completed_at } => {
                assert_eq!(*amount_cents, 10000);
                assert_eq!(session_ref, "sess_1");
                assert!(!completed_at.is_empty());
            }
            other => panic!("expected completed payment, got {other:?}"),
        }

        let entries = crate::tracking::get_tracking(&db, order_id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.last().unwrap().status, OrderStatus::Confirmed);
    }

    #[test]
    fn test_settlement_is_idempotent_for_same_session() {
        let (db, order_id) = fixture(PaymentMethod::CardPayment);
        mark_completed(&db, order_id, "sess_1", 10000).unwrap();
        let after_first = load(&db, order_id);
        let tracking_after_first = crate::tracking::get_tracking(&db, order_id).unwrap();

        // Second identical call is success without mutation
        mark_completed(&db, order_id, "sess_1", 10000).unwrap();
        assert_eq!(load(&db, order_id), after_first);
        assert_eq!(
            crate::tracking::get_tracking(&db, order_id).unwrap(),
            tracking_after_first
        );
    }

    #[test]
    fn test_mismatched_session_ref_raises_already_settled() {
        let (db, order_id) = fixture(PaymentMethod::CardPayment);
        mark_completed(&db, order_id, "sess_1", 10000).unwrap();
        let before = load(&db, order_id);

        let err = mark_completed(&db, order_id, "sess_2", 10000).unwrap_err();
        match err {
            CoreError::AlreadySettled { session_ref, .. } => {
                assert_eq!(session_ref, "sess_1");
            }
            other => panic!("expected AlreadySettled, got {other:?}"),
        }
        // State unchanged
        assert_eq!(load(&db, order_id), before);
    }

    #[test]
    fn test_settlement_rejected_on_canceled_order() {
        let (db, order_id) = fixture(PaymentMethod::CardPayment);
        {
            let conn = db.lock().unwrap();
            orders::set_status_txn(&conn, order_id, OrderStatus::Canceled).unwrap();
        }
        let err = mark_completed(&db, order_id, "sess_1", 10000).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_failed_payment_keeps_order_pending() {
        let (db, order_id) = fixture(PaymentMethod::CardPayment);
        mark_failed(&db, order_id, "card declined").unwrap();

        let order = load(&db, order_id);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(
            order.payment,
            PaymentStatus::Failed { reason: "card declined".into() }
        );

        // Settlement after a failed attempt still works (retry path)
        mark_completed(&db, order_id, "sess_2", 10000).unwrap();
        assert_eq!(load(&db, order_id).status, OrderStatus::Confirmed);
    }

    #[test]
    fn test_failed_after_completed_is_rejected() {
        let (db, order_id) = fixture(PaymentMethod::CardPayment);
        mark_completed(&db, order_id, "sess_1", 10000).unwrap();
        let err = mark_failed(&db, order_id, "late failure").unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert!(load(&db, order_id).payment.is_completed());
    }

    #[test]
    fn test_cod_settlement_completes_order_with_total() {
        let (db, order_id) = fixture(PaymentMethod::CashOnDelivery);
        let session_ref = settle_cod(&db, &Principal::from("staff"), order_id).unwrap();
        assert!(session_ref.starts_with("cod-"));

        let order = load(&db, order_id);
        assert_eq!(order.status, OrderStatus::Completed);
        match order.payment {
            PaymentStatus::Completed { amount_cents, session_ref: ref sref, .. } => {
                assert_eq!(amount_cents, order.total_price_cents);
                assert_eq!(sref, &session_ref);
            }
            other => panic!("expected completed payment, got {other:?}"),
        }
        let entries = crate::tracking::get_tracking(&db, order_id).unwrap();
        assert_eq!(entries.last().unwrap().status, OrderStatus::Completed);
    }

    #[test]
    fn test_cod_settlement_on_card_order_never_mutates() {
        let (db, order_id) = fixture(PaymentMethod::CardPayment);
        let before = load(&db, order_id);
        let err = settle_cod(&db, &Principal::from("staff"), order_id).unwrap_err();
        assert!(matches!(err, CoreError::InvalidPaymentMethod(_)));
        assert_eq!(load(&db, order_id), before);
    }

    #[test]
    fn test_cod_settlement_twice_is_already_settled() {
        let (db, order_id) = fixture(PaymentMethod::CashOnDelivery);
        settle_cod(&db, &Principal::from("staff"), order_id).unwrap();
        let before = load(&db, order_id);
        let err = settle_cod(&db, &Principal::from("staff"), order_id).unwrap_err();
        assert!(matches!(err, CoreError::AlreadySettled { .. }));
        assert_eq!(load(&db, order_id), before);
    }

    #[test]
    fn test_scenario_cod_order_shape_at_placement() {
        // place order [(productA, 2)] at 5000 each, COD
        let (db, order_id) = fixture(PaymentMethod::CashOnDelivery);
        let order = load(&db, order_id);
        assert_eq!(order.total_price_cents, 10000);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment, PaymentStatus::Pending);
        assert_eq!(crate::tracking::get_tracking(&db, order_id).unwrap().len(), 1);
    }
}
