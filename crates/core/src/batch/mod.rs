//! Batch lifecycle: validation, task creation, scheduling and stop.

mod config;
mod controller;
mod registry;
mod types;

pub use config::*;
pub use controller::{BatchController, DriverBackends};
pub use registry::{AdmissionError, BatchHandle, BatchRegistry, Completion, StopTransition};
pub use types::*;
