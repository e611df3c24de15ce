//! Read-only access to lending-vault contract state and token prices over unreliable RPC nodes
//! and price APIs: cached, rate limited, retried within time budgets and rotated across endpoints.

pub mod amount;
pub mod cache;
pub mod chain;
pub mod config;
pub mod context;
pub mod contracts;
pub mod errors;
pub mod fsutil;
pub mod lending;
pub mod paths;
pub mod pool;
pub mod prices;
pub mod rate_limit;
pub mod retry;
pub mod store;

pub use context::Vaultscope;
pub use errors::{ErrorClass, UpstreamError};
