//! HTTP API for the AS2 gateway
//!
//! The AS2 wire endpoints (`/as2`, `/as2/mdn`) and the JSON admin API under
//! `/api/v1`.

pub mod error;
pub mod handlers;
mod rest;
pub mod types;

pub use error::{ApiError, ErrorCode};
pub use rest::*;
