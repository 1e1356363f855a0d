//! Append-only order tracking log.
//!
//! Entries back both the customer-facing timeline and the kitchen ticket.
//! `append_entry` is the only mutator and always runs inside the caller's
//! transaction, so readers never observe a status change without its
//! entry (or an entry without its status change). There is no edit API.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::orders::OrderStatus;

/// One immutable audit record of a status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEntry {
    pub seq: i64,
    pub status: OrderStatus,
    pub note: String,
    pub created_at: String,
}

/// Append an entry for an order. Internal: called by the order store,
/// payment state machine, and admin operations inside their transactions.
pub(crate) fn append_entry(
    conn: &Connection,
    order_id: i64,
    status: OrderStatus,
    note: &str,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO order_tracking (order_id, seq, status, note)
         SELECT ?1, COALESCE(MAX(seq), 0) + 1, ?2, ?3
         FROM order_tracking WHERE order_id = ?1",
        params![order_id, status.as_str(), note],
    )?;
    Ok(())
}

/// Full timeline for an order, oldest first.
pub fn get_tracking(db: &DbState, order_id: i64) -> CoreResult<Vec<TrackingEntry>> {
    let conn = db.lock()?;
    entries_txn(&conn, order_id)
}

pub(crate) fn entries_txn(conn: &Connection, order_id: i64) -> CoreResult<Vec<TrackingEntry>> {
    let mut stmt = conn.prepare(
        "SELECT seq, status, note, created_at
         FROM order_tracking WHERE order_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![order_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (seq, status, note, created_at) = row?;
        let status = OrderStatus::parse(&status).ok_or_else(|| {
            CoreError::Internal(format!("unknown status '{status}' in tracking row"))
        })?;
        entries.push(TrackingEntry {
            seq,
            status,
            note,
            created_at,
        });
    }
    Ok(entries)
}

// ===========================================================================
// Tests
// ===========================================================================
