//! HTTP and WebSocket shell around the cartpilot engine.

pub mod api;
pub mod metrics;
pub mod state;
