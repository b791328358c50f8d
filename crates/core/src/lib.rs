//! # benchrig-core
//!
//! Error types, the `Result` alias, and the scoped configuration store shared
//! by every benchrig crate.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod error;
pub mod result;

pub use config::{Config, Scope};
pub use error::Error;
pub use result::{Result, ResultExt};
