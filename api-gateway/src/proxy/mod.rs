pub mod service_proxy;
pub mod utils;

pub use service_proxy::{ProxyOutcome, ProxyRequest, ServiceProxy};
