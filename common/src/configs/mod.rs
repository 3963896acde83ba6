mod gateway_config;
mod log_config;
pub mod rate_limit_config;
pub mod routes_config;

pub use gateway_config::*;
pub use log_config::*;
pub use rate_limit_config::*;
pub use routes_config::*;
