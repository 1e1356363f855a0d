//! Kitchen order ticket (KOT) projection.
//!
//! A read-only, print-oriented view of one order for fulfillment staff:
//! the priced item snapshot, the customer's contact details, and where
//! the payment stands. Consumes the state machine read-only and is not
//! part of it.

use serde::{Deserialize, Serialize};

use crate::customers::{self, Customer};
use crate::db::DbState;
use crate::error::CoreResult;
use crate::identity::{ensure_admin, AdminGate, Principal};
use crate::orders::{self, OrderStatus, PaymentMethod};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketLine {
    pub name: String,
    pub quantity: i64,
    pub line_total_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KitchenTicket {
    pub order_id: i64,
    pub status: OrderStatus,
    pub placed_at: String,
    pub pickup_time: Option<String>,
    /// Profile of the ordering customer, when one is registered.
    pub customer: Option<Customer>,
    pub lines: Vec<TicketLine>,
    pub total_price_cents: i64,
    pub payment_method: PaymentMethod,
    pub payment_settled: bool,
}

/// Build the ticket for one order. Admin-only.
pub fn kitchen_ticket(
    db: &DbState,
    gate: &dyn AdminGate,
    caller: &Principal,
    order_id: i64,
) -> CoreResult<KitchenTicket> {
    ensure_admin(gate, caller)?;
    let order = {
        let conn = db.lock()?;
        orders::load_order_txn(&conn, order_id)?
    };
    // A missing profile is fine: the ticket still prints without contact details
    let customer = customers::get_customer(db, gate, caller, &order.customer).ok();

    let lines = order
        .items
        .iter()
        .map(|item| TicketLine {
            name: item.name.clone(),
            quantity: item.quantity,
            line_total_cents: item.unit_price_cents * item.quantity,
        })
        .collect();

    Ok(KitchenTicket {
        order_id: order.id,
        status: order.status,
        placed_at: order.created_at,
        pickup_time: order.pickup_time,
        customer,
        lines,
        total_price_cents: order.total_price_cents,
        payment_method: order.payment_method,
        payment_settled: order.payment.is_completed(),
    })
}

impl KitchenTicket {
    /// Render the ticket as monospace text for thermal printing.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("ORDER #{}\n", self.order_id));
        out.push_str(&format!("Status: {}\n", self.status.as_str()));
        if let Some(pickup) = &self.pickup_time {
            out.push_str(&format!("Pickup: {pickup}\n"));
        }
        if let Some(customer) = &self.customer {
            out.push_str(&format!("Customer: {}\n", customer.name));
            if !customer.phone_number.is_empty() {
                out.push_str(&format!("Phone: {}\n", customer.phone_number));
            }
            if !customer.pickup_address.is_empty() {
                out.push_str(&format!("Address: {}\n", customer.pickup_address));
            }
        }
        out.push_str("--------------------------------\n");
        for line in &self.lines {
            out.push_str(&format!(
                "{:>2}x {:<20} {:>7}\n",
                line.quantity,
                line.name,
                format_cents(line.line_total_cents)
            ));
        }
        out.push_str("--------------------------------\n");
        out.push_str(&format!(
            "TOTAL {:>26}\n",
            format_cents(self.total_price_cents)
        ));
        let payment = match (self.payment_method, self.payment_settled) {
            (PaymentMethod::CashOnDelivery, false) => "COLLECT CASH ON DELIVERY",
            (PaymentMethod::CashOnDelivery, true) => "Cash collected",
            (PaymentMethod::CardPayment, true) => "Paid by card",
            (PaymentMethod::CardPayment, false) => "Card payment outstanding",
        };
        out.push_str(&format!("{payment}\n"));
        out
    }
}

/// Format integer cents as a decimal string without going through floats.
fn format_cents(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, (cents % 100).abs())
}

// ===========================================================================
// Tests
// ===========================================================================
