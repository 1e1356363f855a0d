//! Error taxonomy for the GreenBasket core.
//!
//! Every operation exposed to the storefront UI or admin tooling returns
//! either a success value or one of these kinds. Validation errors surface
//! directly to the caller for correction; `Provider` errors during session
//! creation surface for caller-driven retry, while the checkout broker
//! treats them as inconclusive during polling.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The requested order, customer, or session does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller is neither the owning customer nor an administrator.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Order placement attempted with no items.
    #[error("cart is empty")]
    EmptyCart,

    /// An item references a product the catalog no longer knows.
    #[error("pricing failure: {0}")]
    Pricing(String),

    /// Operation is not legal for the order's payment method.
    #[error("invalid payment method: {0}")]
    InvalidPaymentMethod(String),

    /// Idempotence guard trip: the order's payment already completed.
    ///
    /// With a matching session ref callers treat this as success; with a
    /// mismatched ref it signals a data-integrity anomaly and must surface.
    #[error("order {order_id} already settled under session {session_ref}")]
    AlreadySettled { order_id: i64, session_ref: String },

    /// External payment provider failure (network, HTTP, malformed payload).
    #[error("payment provider error: {0}")]
    Provider(String),

    /// Catch-all for illegal order status changes.
    #[error("illegal transition for order {order_id}: {from} -> {to}")]
    InvalidStateTransition {
        order_id: i64,
        from: String,
        to: String,
    },

    /// Admin credential failures: not configured, wrong password, lockout.
    #[error("credentials: {0}")]
    Credentials(String),

    /// SQLite error bubbled up unchanged.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Lock poisoning, snapshot serialization failures, and other
    /// conditions the API contract rules out.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
