//! Error type shared by code that doesn't sit behind an HTTP response
//! boundary (e.g. the provider key store, the JWT primitives). Handler-level
//! code maps into `gateway::errors::GatewayError` instead, which carries the
//! HTTP status / envelope mapping.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, CommonError>;
