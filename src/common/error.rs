//! Error types for the pilot

use std::io;
use thiserror::Error;

/// Pilot error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Record is malformed for its protocol (names the offending field).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Malformed URI or subscription entry.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Probe/fetch timeout or connection failure.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Engine rejected an assembled tunnel configuration.
    #[error("Tunnel start error: {0}")]
    TunnelStart(String),

    /// Store constraint violation (e.g. duplicate group name).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Error::Network(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn tunnel_start<S: Into<String>>(msg: S) -> Self {
        Error::TunnelStart(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        Error::Store(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Missing-field validation error with a uniform message shape.
    pub fn missing_field(protocol: &str, field: &str) -> Self {
        Error::Validation(format!("{protocol}: missing required field '{field}'"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
