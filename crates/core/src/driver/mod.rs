//! Account session drivers.
//!
//! A driver performs one account's work and reports an [`Outcome`]. The
//! engine never looks past that contract:
//! - [`CheckpointDriver`] makes one request per account to read its points
//! - [`OrderDriver`] runs an interactive session through the order workflow,
//!   against the storefront through [`HttpOrderSite`]

mod checkpoint;
mod http;
mod order;
mod site;

pub use checkpoint::{AccountApi, AccountSnapshot, CheckpointConfig, CheckpointDriver};
pub use http::{parse_account_response, HttpAccountApi};
pub use order::{
    CartSummary, OrderConfirmation, OrderDriver, OrderLine, OrderPlan, OrderSession, OrderSite,
    PaymentInstruction,
};
pub use site::{
    parse_ack_response, parse_cart_response, parse_checkout_response, HttpOrderSite,
    OrderEndpoints, OrderSiteConfig,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::batch::{BatchId, BatchMode};
use crate::events::EventScope;
use crate::store::AccountCredential;
use crate::task::{ErrorKind, Outcome, TaskId};

/// Errors raised by external account collaborators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("client setup failed: {0}")]
    Setup(String),
}

impl DriverError {
    /// Error kind recorded on the task.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::SessionExpired(_) => ErrorKind::SessionExpired,
            DriverError::Transient(_) | DriverError::InvalidResponse(_) => {
                ErrorKind::TransientExternal
            }
            DriverError::Rejected(_) => ErrorKind::Rejected,
            DriverError::Setup(_) => ErrorKind::InternalFault,
        }
    }

    /// Convert into a failed outcome.
    pub fn into_outcome(self) -> Outcome {
        Outcome::failed(self.kind(), self.to_string())
    }
}

/// Everything a driver gets to run one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub batch_id: BatchId,
    pub task_id: TaskId,
    pub account_id: u64,
    pub repetition: u32,
    pub credential: AccountCredential,
    /// Event sink bound to this task.
    pub events: EventScope,
}

/// Performs one account's work for a batch mode.
///
/// Implementations turn every failure into an [`Outcome`]; `run` never
/// returns an error.
#[async_trait]
pub trait AccountDriver: Send + Sync {
    /// Batch mode this driver serves.
    fn mode(&self) -> BatchMode;

    async fn run(&self, ctx: &TaskContext) -> Outcome;
}
