//! Full-frame encode/decode: [`crate::header::FrameHeader`] plus payload.
//!
//! A frame is read in two stages per §4.1: the fixed 16-byte header first
//! (which carries `payload_len`), then exactly that many payload bytes.
//! Request and response share a command code, so callers that can read
//! either (e.g. a session's receive loop) pass `is_response` themselves,
//! typically based on whether the echoed sequence number matches an
//! outstanding request.

use std::io::{Read, Write};

use crate::constants::MAX_PAYLOAD;
use crate::error::{ProtocolError, Result};
use crate::header::FrameHeader;
use crate::messages::{decode_payload, encode_payload, Message};

/// Encode `message` into a complete frame (header + payload) ready to
/// write to a socket.
pub fn encode_message(message: &Message, sequence: u32) -> Result<Vec<u8>> {
    let payload = encode_payload(message)?;
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    let command = message.command().ok_or_else(|| {
        ProtocolError::InvalidPayload("cannot encode an Unknown message".to_string())
    })?;
    let header = FrameHeader::new(command, payload.len() as u32, sequence);
    let mut buf = Vec::with_capacity(FrameHeader::SIZE + payload.len());
    header.write_to(&mut buf)?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Read and decode one complete frame from `r`. A command code outside
/// the known table is not a decode error (§9): it decodes to
/// [`Message::Unknown`] so the caller's dispatcher can answer with an
/// `ERROR` frame instead of the connection dying silently.
pub fn decode_message<R: Read>(r: &mut R, is_response: bool) -> Result<(FrameHeader, Message)> {
    let header = FrameHeader::read_from(r)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    r.read_exact(&mut payload)?;
    let message = match crate::header::Command::from_wire(header.command) {
        Some(command) => decode_payload(command, is_response, &payload)?,
        None => Message::Unknown { code: header.command },
    };
    Ok((header, message))
}

/// Write a single frame to a synchronous `Write` implementation.
pub fn write_frame<W: Write>(w: &mut W, message: &Message, sequence: u32) -> Result<()> {
    let buf = encode_message(message, sequence)?;
    w.write_all(&buf)?;
    Ok(())
}

/// Read a single frame from a synchronous `Read` implementation.
pub fn read_frame<R: Read>(r: &mut R, is_response: bool) -> Result<(FrameHeader, Message)> {
    decode_message(r, is_response)
}

#[cfg(feature = "async")]
mod async_io {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Write a single frame to an async sink.
    pub async fn write_frame_async<W: AsyncWrite + Unpin>(
        w: &mut W,
        message: &Message,
        sequence: u32,
    ) -> Result<()> {
        let buf = encode_message(message, sequence)?;
        w.write_all(&buf).await?;
        Ok(())
    }

    /// Read a single frame from an async source.
    ///
    /// Reads the fixed-size header first so the payload length is known
    /// before the (single) payload read, matching the synchronous path.
    pub async fn read_frame_async<R: AsyncRead + Unpin>(
        r: &mut R,
        is_response: bool,
    ) -> Result<(FrameHeader, Message)> {
        let mut header_buf = [0u8; FrameHeader::SIZE];
        r.read_exact(&mut header_buf).await?;
        let header = FrameHeader::read_from(&mut &header_buf[..])?;

        let mut payload = vec![0u8; header.payload_len as usize];
        r.read_exact(&mut payload).await?;

        let message = match crate::header::Command::from_wire(header.command) {
            Some(command) => decode_payload(command, is_response, &payload)?,
            None => Message::Unknown { code: header.command },
        };
        Ok((header, message))
    }
}

#[cfg(feature = "async")]
pub use async_io::{read_frame_async, write_frame_async};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = Message::Ping;
        let buf = encode_message(&msg, 5).unwrap();
        let (header, decoded) = decode_message(&mut &buf[..], false).unwrap();
        assert_eq!(header.sequence, 5);
        assert!(matches!(decoded, Message::Ping));
    }

    #[test]
    fn test_connect_resp_roundtrip_is_response() {
        let msg = Message::ConnectResp {
            status: StatusCode::Success,
            server_version: crate::version::CURRENT_VERSION as u32,
            caps: 0,
            session_id: 7,
        };
        let buf = encode_message(&msg, 1).unwrap();
        let (_header, decoded) = decode_message(&mut &buf[..], true).unwrap();
        match decoded {
            Message::ConnectResp { session_id, .. } => assert_eq!(session_id, 7),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_unknown_command_decodes_to_unknown_variant() {
        let mut buf = Vec::new();
        let header = FrameHeader {
            command: 0x9999,
            payload_len: 0,
            sequence: 0,
        };
        header.write_to(&mut buf).unwrap();
        let (_header, decoded) = decode_message(&mut &buf[..], false).unwrap();
        assert!(matches!(decoded, Message::Unknown { code: 0x9999 }));
    }

    #[test]
    fn test_unknown_message_cannot_be_encoded() {
        let err = encode_message(&Message::Unknown { code: 0x9999 }, 1).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn test_truncated_payload_is_io_error() {
        let msg = Message::DeviceDetach { local_device_id: 1 };
        let mut buf = encode_message(&msg, 1).unwrap();
        buf.truncate(buf.len() - 1);
        let err = decode_message(&mut &buf[..], false).unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }
}
