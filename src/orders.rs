//! Order store: creation from a cart snapshot, lookups, and the legal
//! status transition table.
//!
//! Orders are priced exactly once, at placement, from the catalog
//! collaborator. After that the item snapshot and `total_price_cents` are
//! immutable; later catalog changes never retroactively alter an order.
//! Orders are never deleted — `expired` and `canceled` are terminal
//! states retained for audit.

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cart::{self, CartLine};
use crate::catalog::Catalog;
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::identity::{ensure_admin, AdminGate, Principal};
use crate::tracking;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Customer-visible lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Completed,
    Expired,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Completed => "completed",
            OrderStatus::Expired => "expired",
            OrderStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<OrderStatus> {
        match raw {
            "pending" => Some(OrderStatus::Pending),
            "confirmed" => Some(OrderStatus::Confirmed),
            "completed" => Some(OrderStatus::Completed),
            "expired" => Some(OrderStatus::Expired),
            "canceled" => Some(OrderStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Expired | OrderStatus::Canceled
        )
    }
}

/// Payment method, fixed at order creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CardPayment,
    CashOnDelivery,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::CardPayment => "card",
            PaymentMethod::CashOnDelivery => "cod",
        }
    }

    pub fn parse(raw: &str) -> Option<PaymentMethod> {
        match raw {
            "card" => Some(PaymentMethod::CardPayment),
            "cod" => Some(PaymentMethod::CashOnDelivery),
            _ => None,
        }
    }
}

/// Settlement sub-state of an order, orthogonal to [`OrderStatus`].
///
/// Each variant carries only the fields meaningful to it — no nullable
/// stand-ins for "not applicable".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed {
        /// Settled amount in integer cents.
        amount_cents: i64,
        completed_at: String,
        session_ref: String,
    },
    Failed {
        reason: String,
    },
}

impl PaymentStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, PaymentStatus::Completed { .. })
    }
}

/// One line of the immutable item snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: i64,
    pub name: String,
    pub quantity: i64,
    /// Unit price in cents as of placement time.
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub customer: Principal,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub payment: PaymentStatus,
    pub items: Vec<OrderItem>,
    pub total_price_cents: i64,
    pub pickup_time: Option<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Whether `from -> to` is a sanctioned lifecycle transition.
///
/// `force_complete` in the admin module deliberately bypasses this table;
/// everything else goes through it.
pub(crate) fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Pending, Expired)
            | (Pending, Canceled)
            | (Confirmed, Completed)
            | (Confirmed, Canceled)
    )
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Place an order from an explicit item list.
///
/// Snapshots names and prices from the catalog, writes the order plus its
/// initial tracking entry, and clears the customer's cart — all in one
/// transaction, so no observer sees a cleared cart without an order or
/// vice versa.
pub fn place_order(
    db: &DbState,
    catalog: &dyn Catalog,
    customer: &Principal,
    lines: &[CartLine],
    payment_method: PaymentMethod,
    pickup_time: Option<&str>,
) -> CoreResult<i64> {
    if lines.is_empty() {
        return Err(CoreError::EmptyCart);
    }
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = insert_order_txn(&conn, catalog, customer, lines, payment_method, pickup_time);
    finish_txn(&conn, result)
}

/// Place an order from the customer's current cart (the storefront path).
pub fn place_order_from_cart(
    db: &DbState,
    catalog: &dyn Catalog,
    customer: &Principal,
    payment_method: PaymentMethod,
    pickup_time: Option<&str>,
) -> CoreResult<i64> {
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| {
        let lines = cart::lines_txn(&conn, customer)?;
        if lines.is_empty() {
            return Err(CoreError::EmptyCart);
        }
        insert_order_txn(&conn, catalog, customer, &lines, payment_method, pickup_time)
    })();
    finish_txn(&conn, result)
}

fn finish_txn(conn: &Connection, result: CoreResult<i64>) -> CoreResult<i64> {
    match result {
        Ok(order_id) => {
            conn.execute_batch("COMMIT")?;
            info!(order_id, "Order placed");
            Ok(order_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

fn insert_order_txn(
    conn: &Connection,
    catalog: &dyn Catalog,
    customer: &Principal,
    lines: &[CartLine],
    payment_method: PaymentMethod,
    pickup_time: Option<&str>,
) -> CoreResult<i64> {
    let mut items = Vec::with_capacity(lines.len());
    let mut total_cents: i64 = 0;
    for line in lines {
        if line.quantity <= 0 {
            return Err(CoreError::Pricing(format!(
                "invalid quantity {} for product {}",
                line.quantity, line.product_id
            )));
        }
        let product = catalog.product(line.product_id).ok_or_else(|| {
            CoreError::Pricing(format!("product {} is no longer available", line.product_id))
        })?;
        total_cents += product.price_cents * line.quantity;
        items.push(OrderItem {
            product_id: product.id,
            name: product.name,
            quantity: line.quantity,
            unit_price_cents: product.price_cents,
        });
    }

    let items_json = serde_json::to_string(&items)
        .map_err(|e| CoreError::Internal(format!("serialize item snapshot: {e}")))?;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO orders (
            customer, items, total_price_cents, status, payment_method,
            payment_status, pickup_time, created_at, updated_at
         ) VALUES (?1, ?2, ?3, 'pending', ?4, 'pending', ?5, ?6, ?6)",
        params![
            customer.as_str(),
            items_json,
            total_cents,
            payment_method.as_str(),
            pickup_time,
            now,
        ],
    )?;
    let order_id = conn.last_insert_rowid();

    tracking::append_entry(conn, order_id, OrderStatus::Pending, "Order placed")?;
    cart::clear_cart_txn(conn, customer)?;

    Ok(order_id)
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

const ORDER_COLUMNS: &str = "id, customer, items, total_price_cents, status, payment_method,
     payment_status, payment_amount_cents, payment_session_ref,
     payment_completed_at, payment_failure_reason, pickup_time, created_at";

pub(crate) fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let items_json: String = row.get(2)?;
    let status_raw: String = row.get(4)?;
    let method_raw: String = row.get(5)?;
    let payment_raw: String = row.get(6)?;

    let items: Vec<OrderItem> = serde_json::from_str(&items_json).unwrap_or_default();
    let payment = match payment_raw.as_str() {
        "completed" => PaymentStatus::Completed {
            amount_cents: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
            completed_at: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            session_ref: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        },
        "failed" => PaymentStatus::Failed {
            reason: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        },
        _ => PaymentStatus::Pending,
    };

    Ok(Order {
        id: row.get(0)?,
        customer: Principal::new(row.get::<_, String>(1)?),
        status: OrderStatus::parse(&status_raw).unwrap_or(OrderStatus::Pending),
        payment_method: PaymentMethod::parse(&method_raw).unwrap_or(PaymentMethod::CardPayment),
        payment,
        items,
        total_price_cents: row.get(3)?,
        pickup_time: row.get(11)?,
        created_at: row.get(12)?,
    })
}

/// Load an order without an authorization check (internal).
pub(crate) fn load_order_txn(conn: &Connection, order_id: i64) -> CoreResult<Order> {
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        params![order_id],
        order_from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => CoreError::NotFound(format!("order {order_id}")),
        other => CoreError::Storage(other),
    })
}

/// Fetch one order. The owning customer and admins may read it.
pub fn get_order(
    db: &DbState,
    gate: &dyn AdminGate,
    caller: &Principal,
    order_id: i64,
) -> CoreResult<Order> {
    let order = {
        let conn = db.lock()?;
        load_order_txn(&conn, order_id)?
    };
    // Authorization happens after the lock is released: a RoleGate check
    // reads the same database.
    if &order.customer != caller && !gate.is_admin(caller) {
        return Err(CoreError::Forbidden(format!(
            "{caller} does not own order {order_id}"
        )));
    }
    Ok(order)
}

/// All orders owned by one customer, newest first (ties by id descending).
pub fn list_orders_for_customer(db: &DbState, customer: &Principal) -> CoreResult<Vec<Order>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE customer = ?1
         ORDER BY created_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map(params![customer.as_str()], order_from_row)?;
    let mut orders = Vec::new();
    for row in rows {
        orders.push(row?);
    }
    Ok(orders)
}

/// Every order in the store, newest first. Admin-only.
pub fn list_all_orders(
    db: &DbState,
    gate: &dyn AdminGate,
    caller: &Principal,
) -> CoreResult<Vec<Order>> {
    ensure_admin(gate, caller)?;
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders ORDER BY created_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map([], order_from_row)?;
    let mut orders = Vec::new();
    for row in rows {
        orders.push(row?);
    }
    Ok(orders)
}

// ---------------------------------------------------------------------------
// Status updates
// ---------------------------------------------------------------------------

/// Advance an order through the sanctioned lifecycle. Admin-only.
///
/// `completed` additionally requires a completed payment (COD settlement
/// included) — `force_complete` in the admin module is the only bypass.
pub fn update_status(
    db: &DbState,
    gate: &dyn AdminGate,
    caller: &Principal,
    order_id: i64,
    new_status: OrderStatus,
    note: &str,
) -> CoreResult<()> {
    ensure_admin(gate, caller)?;
    let conn = db.lock()?;
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| {
        let order = load_order_txn(&conn, order_id)?;
        if !can_transition(order.status, new_status) {
            return Err(CoreError::InvalidStateTransition {
                order_id,
                from: order.status.as_str().into(),
                to: new_status.as_str().into(),
            });
        }
        if new_status == OrderStatus::Completed && !order.payment.is_completed() {
            return Err(CoreError::InvalidStateTransition {
                order_id,
                from: order.status.as_str().into(),
                to: "completed (payment still outstanding)".into(),
            });
        }
        set_status_txn(&conn, order_id, new_status)?;
        tracking::append_entry(&conn, order_id, new_status, note)?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            info!(order_id, status = new_status.as_str(), "Order status updated");
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

pub(crate) fn set_status_txn(
    conn: &Connection,
    order_id: i64,
    status: OrderStatus,
) -> CoreResult<()> {
    conn.execute(
        "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), Utc::now().to_rfc3339(), order_id],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::db;
    use crate::identity::RoleGate;
    use std::sync::Arc;

    fn fixture() -> (Arc<DbState>, StaticCatalog, RoleGate) {
        let db = Arc::new(db::test_db());
        let catalog = StaticCatalog::new()
            .with_product(1, "Sourdough Loaf", 650)
            .with_product(2, "Oat Milk", 320);
        let gate = RoleGate::new(db.clone());
        (db, catalog, gate)
    }

    fn alice() -> Principal {
        Principal::from("alice")
    }

    #[test]
    fn test_place_order_snapshot_and_total() {
        let (db, catalog, _gate) = fixture();
        let lines = vec![
            CartLine { product_id: 1, quantity: 2 },
            CartLine { product_id: 2, quantity: 1 },
        ];
        let order_id = place_order(
            &db,
            &catalog,
            &alice(),
            &lines,
            PaymentMethod::CashOnDelivery,
            None,
        )
        .unwrap();

        let orders = list_orders_for_customer(&db, &alice()).unwrap();
        assert_eq!(orders.len(), 1);
        let order = &orders[0];
        assert_eq!(order.id, order_id);
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment, PaymentStatus::Pending);
        assert_eq!(order.total_price_cents, 2 * 650 + 320);
        assert_eq!(order.items[0].name, "Sourdough Loaf");

        // Exactly one tracking entry, matching the current status
        let entries = crate::tracking::get_tracking(&db, order_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, OrderStatus::Pending);
    }

    #[test]
    fn test_empty_cart_rejected() {
        let (db, catalog, _gate) = fixture();
        let err = place_order(
            &db,
            &catalog,
            &alice(),
            &[],
            PaymentMethod::CardPayment,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::EmptyCart));

        let err =
            place_order_from_cart(&db, &catalog, &alice(), PaymentMethod::CardPayment, None)
                .unwrap_err();
        assert!(matches!(err, CoreError::EmptyCart));
    }

    #[test]
    fn test_unknown_product_is_pricing_error_and_keeps_cart() {
        let (db, catalog, _gate) = fixture();
        crate::cart::add_to_cart(&db, &alice(), 1, 1).unwrap();
        crate::cart::add_to_cart(&db, &alice(), 99, 1).unwrap();

        let err =
            place_order_from_cart(&db, &catalog, &alice(), PaymentMethod::CardPayment, None)
                .unwrap_err();
        assert!(matches!(err, CoreError::Pricing(_)));

        // Rolled back: cart untouched, no order created
        assert_eq!(crate::cart::get_cart(&db, &alice()).unwrap().len(), 2);
        assert!(list_orders_for_customer(&db, &alice()).unwrap().is_empty());
    }

    #[test]
    fn test_cart_to_order_handoff_is_atomic() {
        let (db, catalog, _gate) = fixture();
        crate::cart::add_to_cart(&db, &alice(), 1, 3).unwrap();

        let order_id =
            place_order_from_cart(&db, &catalog, &alice(), PaymentMethod::CashOnDelivery, None)
                .unwrap();

        // Cart empty immediately after, order holds the snapshot
        assert!(crate::cart::get_cart(&db, &alice()).unwrap().is_empty());
        let orders = list_orders_for_customer(&db, &alice()).unwrap();
        assert_eq!(orders[0].id, order_id);
        assert_eq!(orders[0].items.len(), 1);
        assert_eq!(orders[0].items[0].quantity, 3);
    }

    #[test]
    fn test_get_order_authorization() {
        let (db, catalog, gate) = fixture();
        let lines = vec![CartLine { product_id: 1, quantity: 1 }];
        let order_id = place_order(
            &db,
            &catalog,
            &alice(),
            &lines,
            PaymentMethod::CardPayment,
            None,
        )
        .unwrap();

        // Owner reads fine
        assert!(get_order(&db, &gate, &alice(), order_id).is_ok());

        // Stranger is forbidden
        let err = get_order(&db, &gate, &Principal::from("bob"), order_id).unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        // Admin reads fine
        let staff = Principal::from("staff");
        gate.bootstrap_admin(&staff).unwrap();
        assert!(get_order(&db, &gate, &staff, order_id).is_ok());

        // Missing order is NotFound before any ownership question
        let err = get_order(&db, &gate, &alice(), 9999).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn test_listing_order_newest_first_ties_by_id() {
        let (db, catalog, gate) = fixture();
        let lines = vec![CartLine { product_id: 1, quantity: 1 }];
        // Same-second timestamps are likely here, so the id tiebreak decides
        let first = place_order(&db, &catalog, &alice(), &lines, PaymentMethod::CardPayment, None)
            .unwrap();
        let second =
            place_order(&db, &catalog, &alice(), &lines, PaymentMethod::CashOnDelivery, None)
                .unwrap();

        let orders = list_orders_for_customer(&db, &alice()).unwrap();
        assert_eq!(orders[0].id, second);
        assert_eq!(orders[1].id, first);

        let staff = Principal::from("staff");
        gate.bootstrap_admin(&staff).unwrap();
        assert_eq!(list_all_orders(&db, &gate, &staff).unwrap().len(), 2);

        let err = list_all_orders(&db, &gate, &alice()).unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[test]
    fn test_update_status_transition_table() {
        let (db, catalog, gate) = fixture();
        let staff = Principal::from("staff");
        gate.bootstrap_admin(&staff).unwrap();
        let lines = vec![CartLine { product_id: 1, quantity: 1 }];
        let order_id = place_order(
            &db,
            &catalog,
            &alice(),
            &lines,
            PaymentMethod::CardPayment,
            None,
        )
        .unwrap();

        // pending -> completed is not sanctioned
        let err = update_status(
            &db,
            &gate,
            &staff,
            order_id,
            OrderStatus::Completed,
            "",
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));

        // pending -> confirmed is, but completed still demands payment
        update_status(&db, &gate, &staff, order_id, OrderStatus::Confirmed, "Accepted").unwrap();
        let err = update_status(
            &db,
            &gate,
            &staff,
            order_id,
            OrderStatus::Completed,
            "",
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));

        // Tracking tail always mirrors the current status
        let entries = crate::tracking::get_tracking(&db, order_id).unwrap();
        assert_eq!(entries.last().unwrap().status, OrderStatus::Confirmed);
    }

    #[test]
    fn test_update_status_requires_admin() {
        let (db, catalog, gate) = fixture();
        let lines = vec![CartLine { product_id: 1, quantity: 1 }];
        let order_id = place_order(
            &db,
            &catalog,
            &alice(),
            &lines,
            PaymentMethod::CardPayment,
            None,
        )
        .unwrap();
        let err = update_status(
            &db,
            &gate,
            &alice(),
            order_id,
            OrderStatus::Confirmed,
            "",
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }
}
