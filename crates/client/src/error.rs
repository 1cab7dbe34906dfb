//! Client-side error taxonomy (section 7): typed per-crate error enum.
//! `anyhow::Context` stays out of this module and every other library
//! module in this crate; it is only used in `main.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("no such device")]
    NoDevice,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<ClientError> for common::Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Usb(e) => common::Error::Usb(e.to_string()),
            ClientError::NoDevice => common::Error::Usb("no such device".to_string()),
            ClientError::Protocol(e) => common::Error::Network(e.to_string()),
            ClientError::Io(e) => common::Error::Io(e),
            ClientError::Config(s) => common::Error::Config(s),
        }
    }
}
