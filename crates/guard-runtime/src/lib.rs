//! Host-facing entry point: loads the guard configuration and exposes one
//! [`OutboundGuard`] handle over the policy engine, limiter and batches.

pub mod config;
pub mod guard;
pub mod reply;

pub use config::{GuardConfig, DEFAULT_LOCK_TIMEOUT_MS};
pub use guard::{default_worker_id, OutboundGuard};
pub use reply::Rejection;
