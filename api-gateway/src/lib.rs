pub mod app;
pub mod auth;
pub mod circuit_breaker;
pub mod error;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod rate_limit;
pub mod router;

#[cfg(test)]
mod test_support;

pub use app::{build_router, AppState};
pub use error::GatewayError;
