pub mod request_logger;

pub use request_logger::{client_ip, RequestLoggerLayer, RequestId};
