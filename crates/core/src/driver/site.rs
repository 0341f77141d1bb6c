//! Order site over the storefront's JSON endpoints.
//!
//! Every request carries the account's stored session cookies. The site
//! answers with the same envelope as the account API:
//! `{"success": bool, "message": "...", "data": {...}}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, COOKIE};
use reqwest::{redirect, Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    CartSummary, DriverError, OrderConfirmation, OrderLine, OrderSession, OrderSite,
    PaymentInstruction,
};
use crate::store::{AccountCredential, Address};
use crate::workflow::StepOutcome;

/// The `[order]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSiteConfig {
    /// Storefront origin, e.g. `https://shop.example`.
    pub base_url: String,

    #[serde(default)]
    pub endpoints: OrderEndpoints,

    #[serde(default = "super::checkpoint::default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Endpoint paths, relative to `base_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderEndpoints {
    /// GET, answers with the logged-in user.
    pub session: String,
    /// POST `{"address_id": ...}`.
    pub select_address: String,
    /// GET for the summary, DELETE to empty it.
    pub cart: String,
    /// POST `{"product_id", "url", "quantity"}`.
    pub cart_items: String,
    /// POST the payment instruction.
    pub checkout: String,
}

impl Default for OrderEndpoints {
    fn default() -> Self {
        Self {
            session: "/api/user/session".to_string(),
            select_address: "/api/cart/address".to_string(),
            cart: "/api/cart".to_string(),
            cart_items: "/api/cart/items".to_string(),
            checkout: "/api/cart/checkout".to_string(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

impl OrderSiteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            endpoints: OrderEndpoints::default(),
            user_agent: super::checkpoint::default_user_agent(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Opens cookie sessions against the storefront.
pub struct HttpOrderSite {
    client: Client,
    config: OrderSiteConfig,
}

impl HttpOrderSite {
    pub fn new(config: OrderSiteConfig) -> Result<Self, DriverError> {
        // A 302 to the login page has to reach the status mapping
        let client = Client::builder()
            .timeout(config.request_timeout())
            .redirect(redirect::Policy::none())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DriverError::Setup(e.to_string()))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl OrderSite for HttpOrderSite {
    async fn open_session(
        &self,
        credential: &AccountCredential,
    ) -> Result<Box<dyn OrderSession>, DriverError> {
        if !credential.has_session() {
            return Err(DriverError::SessionExpired(format!(
                "account {} has no stored session",
                credential.account_id
            )));
        }
        Ok(Box::new(HttpOrderSession {
            client: self.client.clone(),
            config: self.config.clone(),
            account_id: credential.account_id,
            cookie: credential.cookie_header(),
            last_exchange: None,
        }))
    }
}

/// One account's cookie session.
struct HttpOrderSession {
    client: Client,
    config: OrderSiteConfig,
    account_id: u64,
    cookie: String,
    /// Last request and how it ended, kept for failure diagnostics.
    last_exchange: Option<String>,
}

impl HttpOrderSession {
    async fn send(&mut self, method: Method, path: &str, body: Option<Value>) -> Exchange {
        let url = self.config.url(path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(COOKIE, &self.cookie)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let exchange = match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(body) => Exchange::Response { status, body },
                    Err(e) => Exchange::Failed(request_error(e)),
                }
            }
            Err(e) => Exchange::Failed(request_error(e)),
        };

        let summary = match &exchange {
            Exchange::Response { status, .. } => format!("{} {} -> HTTP {}", method, path, status),
            Exchange::Failed(e) => format!("{} {} -> {}", method, path, e),
        };
        debug!(account_id = self.account_id, "{}", summary);
        self.last_exchange = Some(summary);
        exchange
    }
}

enum Exchange {
    Response { status: u16, body: String },
    Failed(String),
}

impl Exchange {
    fn parse<T>(self, parse: impl FnOnce(u16, &str) -> StepOutcome<T>) -> StepOutcome<T> {
        match self {
            Exchange::Response { status, body } => parse(status, &body),
            Exchange::Failed(message) => StepOutcome::Retryable(message),
        }
    }
}

fn request_error(e: reqwest::Error) -> String {
    if e.is_timeout() {
        "site request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    }
}

fn payment_body(payment: &PaymentInstruction) -> Value {
    match payment {
        PaymentInstruction::CashOnDelivery => json!({ "mode": "cod" }),
        PaymentInstruction::Upi => json!({ "mode": "upi" }),
        PaymentInstruction::Card(card) => json!({
            "mode": "card",
            "card": {
                "holder_name": card.holder_name,
                "number": card.number,
                "expiry": card.expiry,
                "cvv": card.cvv,
            }
        }),
    }
}

#[async_trait]
impl OrderSession for HttpOrderSession {
    async fn authenticate(&mut self) -> StepOutcome<()> {
        let path = self.config.endpoints.session.clone();
        self.send(Method::GET, &path, None)
            .await
            .parse(parse_ack_response)
    }

    async fn select_address(&mut self, address: &Address) -> StepOutcome<()> {
        let path = self.config.endpoints.select_address.clone();
        self.send(Method::POST, &path, Some(json!({ "address_id": address.id })))
            .await
            .parse(parse_ack_response)
    }

    async fn populate_cart(&mut self, lines: &[OrderLine]) -> StepOutcome<CartSummary> {
        let cart = self.config.endpoints.cart.clone();
        let items = self.config.endpoints.cart_items.clone();

        // Leftovers from an earlier run would change the total
        let cleared = self
            .send(Method::DELETE, &cart, None)
            .await
            .parse(parse_ack_response);
        if let Some(failed) = failure(cleared) {
            return failed;
        }

        for line in lines {
            let body = json!({
                "product_id": line.product.id,
                "url": line.product.url,
                "quantity": line.quantity,
            });
            let added = self
                .send(Method::POST, &items, Some(body))
                .await
                .parse(parse_ack_response);
            if let Some(failed) = failure(added) {
                return failed;
            }
        }

        self.send(Method::GET, &cart, None)
            .await
            .parse(parse_cart_response)
    }

    async fn checkout(&mut self, payment: &PaymentInstruction) -> StepOutcome<OrderConfirmation> {
        let path = self.config.endpoints.checkout.clone();
        self.send(Method::POST, &path, Some(payment_body(payment)))
            .await
            .parse(parse_checkout_response)
    }

    async fn capture_diagnostics(&mut self, step: &str) -> Option<String> {
        self.last_exchange
            .as_ref()
            .map(|exchange| format!("{}: {}", step, exchange))
    }

    async fn close(&mut self) {
        debug!(account_id = self.account_id, "Order session closed");
    }
}

/// Carry a failed outcome over to another success type.
fn failure<T, U>(outcome: StepOutcome<T>) -> Option<StepOutcome<U>> {
    match outcome {
        StepOutcome::Success(_) => None,
        StepOutcome::Retryable(m) => Some(StepOutcome::Retryable(m)),
        StepOutcome::Terminal(m) => Some(StepOutcome::Terminal(m)),
        StepOutcome::SessionExpired(m) => Some(StepOutcome::SessionExpired(m)),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartData {
    total: Option<f64>,
    #[serde(default)]
    item_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutData {
    order_id: Option<String>,
    total: Option<f64>,
}

/// Map the HTTP status, then unwrap the envelope.
///
/// 401, 403 and 302 mean the session is gone. 408, 429 and 5xx are worth
/// another attempt. Any other non-2xx status, a malformed body or
/// `success: false` is terminal.
fn parse_envelope<T: DeserializeOwned>(status: u16, body: &str) -> StepOutcome<Option<T>> {
    match status {
        401 | 403 | 302 => {
            return StepOutcome::SessionExpired(format!("site returned HTTP {}", status))
        }
        408 | 429 | 500..=599 => {
            return StepOutcome::Retryable(format!("site returned HTTP {}", status))
        }
        200..=299 => {}
        _ => return StepOutcome::Terminal(format!("site returned HTTP {}", status)),
    }

    let envelope: Envelope<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => return StepOutcome::Terminal(format!("malformed JSON: {}", e)),
    };
    if !envelope.success {
        return StepOutcome::Terminal(
            envelope
                .message
                .unwrap_or_else(|| "site reported failure".to_string()),
        );
    }
    StepOutcome::Success(envelope.data)
}

/// Map a response whose only content is success or failure.
pub fn parse_ack_response(status: u16, body: &str) -> StepOutcome<()> {
    parse_envelope::<Value>(status, body).map(|_| ())
}

/// Map the cart summary response.
pub fn parse_cart_response(status: u16, body: &str) -> StepOutcome<CartSummary> {
    match parse_envelope::<CartData>(status, body) {
        StepOutcome::Success(Some(CartData {
            total: Some(total),
            item_count,
        })) => StepOutcome::Success(CartSummary { total, item_count }),
        StepOutcome::Success(_) => StepOutcome::Terminal("cart total missing".to_string()),
        StepOutcome::Retryable(m) => StepOutcome::Retryable(m),
        StepOutcome::Terminal(m) => StepOutcome::Terminal(m),
        StepOutcome::SessionExpired(m) => StepOutcome::SessionExpired(m),
    }
}

/// Map the checkout response. Without an order id there is no order.
pub fn parse_checkout_response(status: u16, body: &str) -> StepOutcome<OrderConfirmation> {
    match parse_envelope::<CheckoutData>(status, body) {
        StepOutcome::Success(Some(CheckoutData {
            order_id: Some(order_number),
            total,
        })) if !order_number.is_empty() => {
            if total.is_none() {
                warn!(order_number = %order_number, "Checkout response carries no total");
            }
            StepOutcome::Success(OrderConfirmation {
                order_number,
                total: total.unwrap_or_default(),
            })
        }
        StepOutcome::Success(_) => StepOutcome::Terminal("order id missing".to_string()),
        StepOutcome::Retryable(m) => StepOutcome::Retryable(m),
        StepOutcome::Terminal(m) => StepOutcome::Terminal(m),
        StepOutcome::SessionExpired(m) => StepOutcome::SessionExpired(m),
    }
}
