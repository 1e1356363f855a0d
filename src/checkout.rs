//! Checkout session broker.
//!
//! Bridges order creation to the hosted payment provider and translates
//! terminal session states into payment state machine calls. Polling is
//! caller-initiated and caller-paced: the broker itself schedules nothing
//! in the background, and a poll loop abandoned mid-flight (navigation
//! away, timeout) simply leaves the order in its last observed state.

use std::time::Duration;
use tracing::{info, warn};

use chrono::Utc;
use rusqlite::params;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::orders::{self, PaymentMethod, PaymentStatus};
use crate::payment;
use crate::provider::{NewSession, PaymentProvider, SessionStatus};
use crate::tracking;

// ---------------------------------------------------------------------------
// Poll policy
// ---------------------------------------------------------------------------

/// Bounded retry policy for session polling, independent of any UI
/// refresh mechanism.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Delay between observations.
    pub interval: Duration,
    /// Upper bound on observations before the poll is abandoned.
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    /// Every 2 seconds for up to 5 minutes.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 150,
        }
    }
}

/// Terminal result of a bounded poll loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed { amount_cents: i64 },
    Failed { reason: String },
    /// The policy budget ran out with the session still pending. The
    /// session is left as-is and the order remains retryable.
    TimedOut,
}

// ---------------------------------------------------------------------------
// Session creation
// ---------------------------------------------------------------------------

/// Open a checkout session for a card-payment order.
///
/// Preconditions: the order exists, pays by card, and its payment is
/// `pending` or `failed` — a failed attempt re-enters `pending` here.
/// Provider failures propagate unretried; the caller decides whether to
/// try again.
pub async fn create_session(
    db: &DbState,
    provider: &dyn PaymentProvider,
    order_id: i64,
    success_url: &str,
    cancel_url: &str,
) -> CoreResult<NewSession> {
    // Validate and snapshot under the lock, then release it for the
    // provider round-trip.
    let items = {
        let conn = db.lock()?;
        let order = orders::load_order_txn(&conn, order_id)?;

        if order.payment_method != PaymentMethod::CardPayment {
            return Err(CoreError::InvalidPaymentMethod(format!(
                "order {order_id} settles by cash on delivery"
            )));
        }
        if let PaymentStatus::Completed { session_ref, .. } = order.payment {
            return Err(CoreError::AlreadySettled {
                order_id,
                session_ref,
            });
        }
        if order.status.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                order_id,
                from: order.status.as_str().into(),
                to: "checkout".into(),
            });
        }
        order.items
    };

    let session = provider
        .create_checkout_session(&items, success_url, cancel_url)
        .await?;

    // Record the session and, for a retry after failure, re-enter the
    // pending payment state.
    {
        let conn = db.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = (|| {
            let order = orders::load_order_txn(&conn, order_id)?;
            conn.execute(
                "UPDATE orders SET checkout_session_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![session.id, Utc::now().to_rfc3339(), order_id],
            )?;
            if matches!(order.payment, PaymentStatus::Failed { .. }) {
                conn.execute(
                    "UPDATE orders SET
                        payment_status = 'pending',
                        payment_failure_reason = NULL,
                        updated_at = ?1
                     WHERE id = ?2",
                    params![Utc::now().to_rfc3339(), order_id],
                )?;
                tracking::append_entry(
                    &conn,
                    order_id,
                    order.status,
                    "Checkout restarted after failed payment",
                )?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e);
            }
        }
    }

    info!(order_id, session_id = %session.id, "Checkout session created");
    Ok(session)
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Observe the session once and, on a terminal state, drive the payment
/// state machine. Duplicate terminal observations are harmless: the
/// idempotence guarantee lives in the state machine, not here, so a
/// broker re-instantiated mid-poll (page reload) cannot double-settle.
pub async fn poll_session_status(
    db: &DbState,
    provider: &dyn PaymentProvider,
    order_id: i64,
    session_ref: &str,
) -> CoreResult<SessionStatus> {
    let status = provider.get_session_status(session_ref).await?;
    match &status {
        SessionStatus::Completed { amount_cents, .. } => {
            payment::mark_completed(db, order_id, session_ref, *amount_cents)?;
        }
        SessionStatus::Failed { reason } => {
            payment::mark_failed(db, order_id, reason)?;
        }
        SessionStatus::Pending => {}
    }
    Ok(status)
}

/// Poll on a fixed interval until the session resolves or the policy
/// budget runs out.
///
/// Polling stops immediately on the first terminal observation.
/// Provider errors during polling are inconclusive — logged and retried
/// on the same schedule — rather than failing the order.
pub async fn poll_until_terminal(
    db: &DbState,
    provider: &dyn PaymentProvider,
    order_id: i64,
    session_ref: &str,
    policy: PollPolicy,
) -> CoreResult<PollOutcome> {
    for attempt in 1..=policy.max_attempts {
        match poll_session_status(db, provider, order_id, session_ref).await {
            Ok(SessionStatus::Completed { amount_cents, .. }) => {
                return Ok(PollOutcome::Completed { amount_cents });
            }
            Ok(SessionStatus::Failed { reason }) => {
                return Ok(PollOutcome::Failed { reason });
            }
            Ok(SessionStatus::Pending) => {}
            Err(CoreError::Provider(e)) => {
                warn!(order_id, session_ref, attempt, "inconclusive poll: {e}");
            }
            Err(other) => return Err(other),
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    info!(order_id, session_ref, "Poll budget exhausted, session left pending");
    Ok(PollOutcome::TimedOut)
}

// ===========================================================================
// Tests
// ===========================================================================
