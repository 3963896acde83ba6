pub mod config;
pub mod configs;
pub mod error;
pub mod logging;
pub mod service;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
