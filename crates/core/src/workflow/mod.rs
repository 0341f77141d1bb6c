//! Order placement workflow.
//!
//! An order session moves through `Init -> AddressSelect -> CartPopulate ->
//! Checkout -> Done`. Each step runs under its own bounded retry policy, and
//! a session expiry at any step fails the workflow immediately.

mod config;
mod retry;
mod runner;
mod types;

pub use config::{StepSettings, WorkflowConfig};
pub use retry::next_action;
pub use runner::StepRunner;
pub use types::*;
