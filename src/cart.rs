//! Per-customer shopping cart.
//!
//! Carts are exclusively owned by their customer principal and stay
//! mutable right up to `place_order`, which snapshots and clears them in
//! one transaction (see `orders.rs`). Quantities are always positive;
//! setting a line to zero removes it.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::identity::Principal;

/// One cart line: product reference and quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: i64,
    pub quantity: i64,
}

/// Add to the caller's cart; quantities accumulate onto existing lines.
pub fn add_to_cart(
    db: &DbState,
    caller: &Principal,
    product_id: i64,
    quantity: i64,
) -> CoreResult<()> {
    if quantity <= 0 {
        return Err(CoreError::Internal(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO carts (customer, product_id, quantity, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(customer, product_id) DO UPDATE SET
            quantity = quantity + excluded.quantity,
            updated_at = excluded.updated_at",
        params![caller.as_str(), product_id, quantity],
    )?;
    Ok(())
}

/// Set the quantity of a line outright. Zero removes the line.
pub fn update_cart_item(
    db: &DbState,
    caller: &Principal,
    product_id: i64,
    quantity: i64,
) -> CoreResult<()> {
    if quantity < 0 {
        return Err(CoreError::Internal(format!(
            "quantity must not be negative, got {quantity}"
        )));
    }
    let conn = db.lock()?;
    if quantity == 0 {
        conn.execute(
            "DELETE FROM carts WHERE customer = ?1 AND product_id = ?2",
            params![caller.as_str(), product_id],
        )?;
    } else {
        conn.execute(
            "INSERT INTO carts (customer, product_id, quantity, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(customer, product_id) DO UPDATE SET
                quantity = excluded.quantity,
                updated_at = excluded.updated_at",
            params![caller.as_str(), product_id, quantity],
        )?;
    }
    Ok(())
}

/// Remove a line entirely.
pub fn remove_from_cart(db: &DbState, caller: &Principal, product_id: i64) -> CoreResult<()> {
    let conn = db.lock()?;
    conn.execute(
        "DELETE FROM carts WHERE customer = ?1 AND product_id = ?2",
        params![caller.as_str(), product_id],
    )?;
    Ok(())
}

/// Empty the caller's cart.
pub fn clear_cart(db: &DbState, caller: &Principal) -> CoreResult<()> {
    let conn = db.lock()?;
    clear_cart_txn(&conn, caller)?;
    Ok(())
}

/// Current cart contents, in product-id order for determinism.
pub fn get_cart(db: &DbState, caller: &Principal) -> CoreResult<Vec<CartLine>> {
    let conn = db.lock()?;
    lines_txn(&conn, caller)
}

// ---------------------------------------------------------------------------
// Transaction-scoped helpers used by place_order
// ---------------------------------------------------------------------------

/// Read cart lines through an already-held connection.
pub(crate) fn lines_txn(conn: &Connection, customer: &Principal) -> CoreResult<Vec<CartLine>> {
    let mut stmt = conn.prepare(
        "SELECT product_id, quantity FROM carts WHERE customer = ?1 ORDER BY product_id",
    )?;
    let rows = stmt.query_map(params![customer.as_str()], |row| {
        Ok(CartLine {
            product_id: row.get(0)?,
            quantity: row.get(1)?,
        })
    })?;
    let mut lines = Vec::new();
    for row in rows {
        lines.push(row?);
    }
    Ok(lines)
}

/// Delete all cart lines through an already-held connection.
pub(crate) fn clear_cart_txn(conn: &Connection, customer: &Principal) -> CoreResult<()> {
    conn.execute(
        "DELETE FROM carts WHERE customer = ?1",
        params![customer.as_str()],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
