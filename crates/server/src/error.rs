//! Server-side error taxonomy (section 7): typed per-crate error enum.
//! `anyhow::Context` stays out of this module and every other library
//! module in this crate; it is only used in `main.rs`.

use thiserror::Error;

use crate::pending::PendingError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pending(#[from] PendingError),

    #[error("session receive queue overloaded")]
    Overloaded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
