//! Resilient multi-provider AI request dispatcher.
//!
//! A [`Dispatcher`](dispatch::Dispatcher) admits each request through a
//! per-caller rate limiter, then walks providers in priority order (each behind
//! its own circuit breaker and retry policy), then the response cache, and
//! finally answers with an offline reply. A per-session cost governor picks the
//! model tier for every request.

pub mod backends;
pub mod cache;
pub mod config;
pub mod cost;
pub mod dispatch;
pub mod logging;
pub mod resilience;
pub mod server;
pub mod types;

pub use dispatch::{DispatchRequest, DispatchResponse, Dispatcher};
pub use types::{DispatchError, Result};
