//! Shared error type and small helpers

pub mod error;

pub use error::{Error, Result};
