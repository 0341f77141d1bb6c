//! Order placement through an interactive site session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AccountDriver, DriverError, TaskContext};
use crate::batch::BatchMode;
use crate::store::{AccountCredential, Address, Card, Product};
use crate::task::{ErrorKind, Outcome, TaskPayload};
use crate::workflow::{StepName, StepOutcome, StepRunner, WorkflowState};

/// One product line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product: Product,
    pub quantity: u32,
}

/// How checkout pays.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentInstruction {
    CashOnDelivery,
    Upi,
    Card(Card),
}

/// Everything an order task needs, resolved once per batch.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPlan {
    pub lines: Vec<OrderLine>,
    pub address: Address,
    pub payment: PaymentInstruction,
    pub max_cart_value: Option<f64>,
}

impl OrderPlan {
    /// Reject an empty cart or one over the configured ceiling.
    pub fn check_cart(&self, total: f64) -> Result<(), String> {
        if total.is_nan() || total <= 0.0 {
            return Err(format!("cart total {:.2} is not positive", total));
        }
        match self.max_cart_value {
            Some(max) if total > max => Err(format!(
                "cart total {:.2} exceeds limit {:.2}",
                total, max
            )),
            _ => Ok(()),
        }
    }
}

/// Cart contents after population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartSummary {
    pub total: f64,
    pub item_count: u32,
}

/// What the site returns for a placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order_number: String,
    pub total: f64,
}

/// Opens interactive sessions for accounts.
#[async_trait]
pub trait OrderSite: Send + Sync {
    async fn open_session(
        &self,
        credential: &AccountCredential,
    ) -> Result<Box<dyn OrderSession>, DriverError>;
}

/// One account's live session, one operation per workflow step.
#[async_trait]
pub trait OrderSession: Send {
    async fn authenticate(&mut self) -> StepOutcome<()>;

    async fn select_address(&mut self, address: &Address) -> StepOutcome<()>;

    async fn populate_cart(&mut self, lines: &[OrderLine]) -> StepOutcome<CartSummary>;

    async fn checkout(&mut self, payment: &PaymentInstruction) -> StepOutcome<OrderConfirmation>;

    /// Capture an artifact describing the session state, e.g. a screenshot path.
    async fn capture_diagnostics(&mut self, step: &str) -> Option<String>;

    async fn close(&mut self);
}

/// Places one order per task.
pub struct OrderDriver {
    site: Arc<dyn OrderSite>,
    plan: Arc<OrderPlan>,
    runner: StepRunner,
}

impl OrderDriver {
    pub fn new(site: Arc<dyn OrderSite>, plan: OrderPlan, runner: StepRunner) -> Self {
        Self {
            site,
            plan: Arc::new(plan),
            runner,
        }
    }

    pub fn plan(&self) -> &OrderPlan {
        &self.plan
    }
}

#[async_trait]
impl AccountDriver for OrderDriver {
    fn mode(&self) -> BatchMode {
        BatchMode::Order
    }

    async fn run(&self, ctx: &TaskContext) -> Outcome {
        let mut session = match self.site.open_session(&ctx.credential).await {
            Ok(session) => session,
            Err(e) => return e.into_outcome().at_step(StepName::Init.as_str()),
        };

        let report = self
            .runner
            .run(session.as_mut(), &self.plan, &ctx.events)
            .await;
        session.close().await;

        if let Some(failure) = report.failure {
            return Outcome::failed(failure.kind, failure.message).at_step(failure.step.as_str());
        }
        match (report.final_state, report.confirmation) {
            (WorkflowState::Done, Some(confirmation)) => Outcome::success(TaskPayload::Order {
                order_number: confirmation.order_number,
                total: confirmation.total,
            }),
            _ => Outcome::failed(ErrorKind::Rejected, "no order confirmation received")
                .at_step(StepName::Checkout.as_str()),
        }
    }
}
