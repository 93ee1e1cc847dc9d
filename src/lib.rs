mod error;

pub mod gateway;
pub mod utils;

pub use error::{ApiRouterError, Result};
