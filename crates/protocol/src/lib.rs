//! Wire protocol for the USB-over-network bridge.
//!
//! This crate owns the framing codec (the fixed 16-byte header plus
//! per-command payload layout) and the message/type vocabulary shared by
//! the server's session manager and the client's URB dispatcher. The wire
//! layout is a manual fixed binary encoding, not a serde-derived format:
//! field order, width, and byte order are a contract between peers and
//! must not depend on any serialization crate's internal conventions.

pub mod codec;
pub mod constants;
pub mod error;
pub mod header;
pub mod messages;
pub mod status;
pub mod types;
pub mod version;

pub use codec::{decode_message, encode_message};
pub use constants::*;
pub use error::{ProtocolError, Result};
pub use header::{Command, FrameHeader};
pub use messages::Message;
pub use status::StatusCode;
pub use types::{
    DeviceInfo, DeviceSpeed, Direction, LocalDeviceId, RemoteDeviceId, SessionId, SetupPacket,
    TransferType, UrbCompletion, UrbId, UrbRequest,
};
pub use version::{CURRENT_VERSION, version_compatible};

#[cfg(feature = "async")]
pub use codec::{read_frame_async, write_frame_async};
