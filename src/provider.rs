//! Hosted payment provider client.
//!
//! The provider owns checkout sessions and the hosted payment page; the
//! core only consumes its REST surface. The raw payload's `amount_total`
//! is the authoritative settled amount; a missing or malformed payload
//! becomes [`CoreError::Provider`], never a panic.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::orders::OrderItem;

/// Default timeout for provider requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A freshly created checkout session: opaque id plus the hosted page URL
/// to redirect the customer to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub id: String,
    pub redirect_url: String,
}

/// Session state as observed through one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Pending,
    Completed {
        /// `amount_total` from the provider payload, in integer cents.
        amount_cents: i64,
        /// Raw provider payload, retained for reconciliation tooling.
        raw: Value,
    },
    Failed {
        reason: String,
    },
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Pending)
    }
}

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// Contract consumed from the payment provider collaborator.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Open a hosted checkout session for the given priced items.
    async fn create_checkout_session(
        &self,
        items: &[OrderItem],
        success_url: &str,
        cancel_url: &str,
    ) -> CoreResult<NewSession>;

    /// Observe the current session state. Non-terminal sessions stay
    /// `Pending`; callers poll on their own schedule.
    async fn get_session_status(&self, session_id: &str) -> CoreResult<SessionStatus>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// REST client for the hosted provider.
pub struct HttpPaymentProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentProvider {
    pub fn new(base_url: &str, api_key: &str) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Provider(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_checkout_session(
        &self,
        items: &[OrderItem],
        success_url: &str,
        cancel_url: &str,
    ) -> CoreResult<NewSession> {
        let url = format!("{}/v1/checkout/sessions", self.base_url);
        let line_items: Vec<Value> = items
            .iter()
            .map(|item| {
                serde_json::json!({
                    "name": item.name,
                    "quantity": item.quantity,
                    "unit_amount": item.unit_price_cents,
                })
            })
            .collect();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "line_items": line_items,
                "success_url": success_url,
                "cancel_url": cancel_url,
            }))
            .send()
            .await
            .map_err(|e| friendly_error(&url, &e))?;

        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CoreError::Provider(format!("decode session response: {e}")))?;
        parse_new_session(&body)
    }

    async fn get_session_status(&self, session_id: &str) -> CoreResult<SessionStatus> {
        let url = format!("{}/v1/checkout/sessions/{session_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| friendly_error(&url, &e))?;

        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CoreError::Provider(format!("decode status response: {e}")))?;
        parse_session_payload(&body)
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

pub(crate) fn parse_new_session(body: &Value) -> CoreResult<NewSession> {
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::Provider("session response missing id".into()))?;
    let redirect_url = body
        .get("url")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::Provider("session response missing url".into()))?;
    Ok(NewSession {
        id: id.to_string(),
        redirect_url: redirect_url.to_string(),
    })
}

/// Translate one raw status payload into a [`SessionStatus`].
pub(crate) fn parse_session_payload(body: &Value) -> CoreResult<SessionStatus> {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Provider("status payload missing status field".into()))?;

    match status {
        "open" | "pending" => Ok(SessionStatus::Pending),
        "complete" | "completed" => {
            let amount_cents = body
                .get("amount_total")
                .and_then(Value::as_i64)
                .ok_or_else(|| {
                    CoreError::Provider("completed session missing amount_total".into())
                })?;
            Ok(SessionStatus::Completed {
                amount_cents,
                raw: body.clone(),
            })
        }
        "expired" | "failed" => {
            let reason = body
                .get("failure_reason")
                .and_then(Value::as_str)
                .unwrap_or("payment session did not complete")
                .to_string();
            Ok(SessionStatus::Failed { reason })
        }
        other => Err(CoreError::Provider(format!(
            "unrecognized session status '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a provider error with a usable message.
fn friendly_error(url: &str, err: &reqwest::Error) -> CoreError {
    if err.is_connect() {
        return CoreError::Provider(format!("cannot reach payment provider at {url}"));
    }
    if err.is_timeout() {
        return CoreError::Provider(format!("request to {url} timed out"));
    }
    CoreError::Provider(format!("network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a provider error.
fn status_error(status: StatusCode) -> CoreError {
    match status.as_u16() {
        401 | 403 => CoreError::Provider("provider API key is invalid or expired".into()),
        404 => CoreError::Provider("payment session not found at provider".into()),
        s if s >= 500 => CoreError::Provider(format!("provider server error (HTTP {s})")),
        s => CoreError::Provider(format!("unexpected provider response (HTTP {s})")),
    }
}

/// Normalize the provider base URL: ensure a scheme, strip trailing slashes.
pub(crate) fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ===========================================================================
// Tests
// ===========================================================================
