//! GreenBasket core — order lifecycle and payment reconciliation for a
//! grocery delivery storefront.
//!
//! Given a cart, produce an order, drive it through the payment state
//! machine to completion, and support administrative reconciliation when
//! automatic confirmation is impossible (manual COD settlement, forced
//! completion, cancellation). The product catalog, customer identity,
//! and the payment provider's hosted checkout page are external
//! collaborators consumed through the traits in [`catalog`],
//! [`identity`], and [`provider`].

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod admin;
pub mod auth;
pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod customers;
pub mod db;
pub mod error;
pub mod identity;
pub mod kot;
pub mod orders;
pub mod payment;
pub mod provider;
pub mod tracking;

pub use error::{CoreError, CoreResult};

/// Initialize structured logging (console, plus a daily-rolling file when
/// a log directory is given).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(log_dir: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,greenbasket_core=debug"));

    let file_layer = log_dir.map(|dir| {
        let _ = std::fs::create_dir_all(dir);
        let file_appender = tracing_appender::rolling::daily(dir, "greenbasket");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Keep the guard alive for the process lifetime — dropping it flushes logs.
        std::mem::forget(guard);
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
    });
    let console_layer = fmt::layer().with_target(true);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
