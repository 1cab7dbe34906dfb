//! Frame header encode/decode (§4.1).
//!
//! Mirrors the manual byteorder-based framing used for this bridge's
//! companion USB/IP wire structures, except little-endian throughout, per
//! the design's frame layout.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::constants::{HEADER_SIZE, MAGIC, MAX_PAYLOAD, PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result};

/// Wire command codes (§4.1). A request and its response share a code;
/// they are disambiguated by direction and the echoed sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Connect = 0x0001,
    Disconnect = 0x0002,
    Ping = 0x0003,
    Pong = 0x0004,
    DeviceAttach = 0x0010,
    DeviceDetach = 0x0011,
    DeviceList = 0x0012,
    SubmitUrb = 0x0020,
    UrbComplete = 0x0021,
    CancelUrb = 0x0022,
    Error = 0x00FF,
}

impl Command {
    pub fn from_wire(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Command::Connect),
            0x0002 => Some(Command::Disconnect),
            0x0003 => Some(Command::Ping),
            0x0004 => Some(Command::Pong),
            0x0010 => Some(Command::DeviceAttach),
            0x0011 => Some(Command::DeviceDetach),
            0x0012 => Some(Command::DeviceList),
            0x0020 => Some(Command::SubmitUrb),
            0x0021 => Some(Command::UrbComplete),
            0x0022 => Some(Command::CancelUrb),
            0x00FF => Some(Command::Error),
            _ => None,
        }
    }
}

/// The 16-byte frame header prefixing every message (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: u16,
    pub payload_len: u32,
    pub sequence: u32,
}

impl FrameHeader {
    pub const SIZE: usize = HEADER_SIZE;

    pub fn new(command: Command, payload_len: u32, sequence: u32) -> Self {
        Self {
            command: command as u16,
            payload_len,
            sequence,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(MAGIC)?;
        w.write_u16::<LittleEndian>(PROTOCOL_VERSION)?;
        w.write_u16::<LittleEndian>(self.command)?;
        w.write_u32::<LittleEndian>(self.payload_len)?;
        w.write_u32::<LittleEndian>(self.sequence)?;
        Ok(())
    }

    /// Read and validate a header. Magic/version mismatch and an
    /// over-large `payload_len` are fatal per §4.1 step 1-2.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = r.read_u16::<LittleEndian>()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let command = r.read_u16::<LittleEndian>()?;
        let payload_len = r.read_u32::<LittleEndian>()?;
        if payload_len as usize > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len as usize,
                max: MAX_PAYLOAD,
            });
        }
        let sequence = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            command,
            payload_len,
            sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(Command::Ping, 0, 42);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), FrameHeader::SIZE);

        let decoded = FrameHeader::read_from(&mut &buf[..]).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut buf = vec![0u8; FrameHeader::SIZE];
        buf[0..4].copy_from_slice(&0u32.to_le_bytes());
        let err = FrameHeader::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, ProtocolError::BadMagic(0)));
    }

    #[test]
    fn test_oversized_payload_is_fatal() {
        let header = FrameHeader::new(Command::SubmitUrb, 1_000_000, 1);
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let err = FrameHeader::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_command_round_trips_through_wire_codes() {
        for cmd in [
            Command::Connect,
            Command::Disconnect,
            Command::Ping,
            Command::Pong,
            Command::DeviceAttach,
            Command::DeviceDetach,
            Command::DeviceList,
            Command::SubmitUrb,
            Command::UrbComplete,
            Command::CancelUrb,
            Command::Error,
        ] {
            assert_eq!(Command::from_wire(cmd as u16), Some(cmd));
        }
        assert_eq!(Command::from_wire(0x9999), None);
    }
}
