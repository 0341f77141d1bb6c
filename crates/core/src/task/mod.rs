//! Task model: one (account, repetition) unit of work and its terminal outcome.

mod types;

pub use types::*;
