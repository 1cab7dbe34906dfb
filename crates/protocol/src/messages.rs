//! Per-command message payloads and their wire encoding (§4.1, §6).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{ProtocolError, Result};
use crate::header::Command;
use crate::status::StatusCode;
use crate::types::DeviceInfo;

const CLIENT_NAME_LEN: usize = 64;
const ERROR_MESSAGE_LEN: usize = 256;
const DEVICE_STRING_LEN: usize = 64;

/// Fail if a wire-declared length claims more bytes than actually remain
/// in the payload, before that length is used to size an allocation.
/// Untrusted `u32` length fields (descriptor/list/transfer lengths) are
/// independent of the frame's own `payload_len` bound, so a short frame
/// carrying a huge declared length must be rejected here rather than at
/// the `read_exact` that would otherwise allocate first.
fn check_remaining(remaining: usize, needed: usize, what: &str) -> Result<()> {
    if needed > remaining {
        return Err(ProtocolError::InvalidPayload(format!(
            "{what} length {needed} exceeds {remaining} remaining payload bytes"
        )));
    }
    Ok(())
}

fn write_fixed_str<W: Write>(w: &mut W, s: &str, len: usize) -> io::Result<()> {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    w.write_all(&bytes[..n])?;
    let pad = vec![0u8; len - n];
    w.write_all(&pad)
}

fn read_fixed_str<R: Read>(r: &mut R, len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Wire payload of `SUBMIT_URB` (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrbSubmitHeader {
    pub device_id: u32,
    pub urb_id: u32,
    pub endpoint_address: u8,
    pub transfer_type: u8,
    pub direction: u8,
    pub reserved: u8,
    pub transfer_flags: u32,
    pub buf_len: u32,
    pub interval: u32,
    pub setup_packet: [u8; 8],
}

impl UrbSubmitHeader {
    pub const SIZE: usize = 32;

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.device_id)?;
        w.write_u32::<LittleEndian>(self.urb_id)?;
        w.write_u8(self.endpoint_address)?;
        w.write_u8(self.transfer_type)?;
        w.write_u8(self.direction)?;
        w.write_u8(self.reserved)?;
        w.write_u32::<LittleEndian>(self.transfer_flags)?;
        w.write_u32::<LittleEndian>(self.buf_len)?;
        w.write_u32::<LittleEndian>(self.interval)?;
        w.write_all(&self.setup_packet)
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let device_id = r.read_u32::<LittleEndian>()?;
        let urb_id = r.read_u32::<LittleEndian>()?;
        let endpoint_address = r.read_u8()?;
        let transfer_type = r.read_u8()?;
        let direction = r.read_u8()?;
        let reserved = r.read_u8()?;
        let transfer_flags = r.read_u32::<LittleEndian>()?;
        let buf_len = r.read_u32::<LittleEndian>()?;
        let interval = r.read_u32::<LittleEndian>()?;
        let mut setup_packet = [0u8; 8];
        r.read_exact(&mut setup_packet)?;
        Ok(Self {
            device_id,
            urb_id,
            endpoint_address,
            transfer_type,
            direction,
            reserved,
            transfer_flags,
            buf_len,
            interval,
            setup_packet,
        })
    }
}

/// Wire payload of `URB_COMPLETE` (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrbCompleteHeader {
    pub device_id: u32,
    pub urb_id: u32,
    pub status: u32,
    pub actual_length: u32,
    pub error_count: u32,
}

impl UrbCompleteHeader {
    pub const SIZE: usize = 20;

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.device_id)?;
        w.write_u32::<LittleEndian>(self.urb_id)?;
        w.write_u32::<LittleEndian>(self.status)?;
        w.write_u32::<LittleEndian>(self.actual_length)?;
        w.write_u32::<LittleEndian>(self.error_count)
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            device_id: r.read_u32::<LittleEndian>()?,
            urb_id: r.read_u32::<LittleEndian>()?,
            status: r.read_u32::<LittleEndian>()?,
            actual_length: r.read_u32::<LittleEndian>()?,
            error_count: r.read_u32::<LittleEndian>()?,
        })
    }
}

fn write_device_info<W: Write>(w: &mut W, info: &DeviceInfo) -> io::Result<()> {
    w.write_u16::<LittleEndian>(info.vendor_id)?;
    w.write_u16::<LittleEndian>(info.product_id)?;
    w.write_u8(info.device_class)?;
    w.write_u8(info.device_subclass)?;
    w.write_u8(info.device_protocol)?;
    w.write_u8(info.speed as u8)?;
    w.write_u8(info.num_configurations)?;
    w.write_u8(info.num_interfaces)?;
    write_fixed_str(w, &info.manufacturer, DEVICE_STRING_LEN)?;
    write_fixed_str(w, &info.product, DEVICE_STRING_LEN)?;
    write_fixed_str(w, &info.serial_number, DEVICE_STRING_LEN)
}

fn read_device_info<R: Read>(r: &mut R) -> io::Result<DeviceInfo> {
    use crate::types::DeviceSpeed;
    let vendor_id = r.read_u16::<LittleEndian>()?;
    let product_id = r.read_u16::<LittleEndian>()?;
    let device_class = r.read_u8()?;
    let device_subclass = r.read_u8()?;
    let device_protocol = r.read_u8()?;
    let speed = DeviceSpeed::from_wire(r.read_u8()?);
    let num_configurations = r.read_u8()?;
    let num_interfaces = r.read_u8()?;
    let manufacturer = read_fixed_str(r, DEVICE_STRING_LEN)?;
    let product = read_fixed_str(r, DEVICE_STRING_LEN)?;
    let serial_number = read_fixed_str(r, DEVICE_STRING_LEN)?;
    Ok(DeviceInfo {
        vendor_id,
        product_id,
        device_class,
        device_subclass,
        device_protocol,
        speed,
        num_configurations,
        num_interfaces,
        manufacturer,
        product,
        serial_number,
    })
}

/// Size in bytes of an encoded [`DeviceInfo`] on the wire.
pub const DEVICE_INFO_SIZE: usize = 2 + 2 + 1 + 1 + 1 + 1 + 1 + 1 + DEVICE_STRING_LEN * 3;

/// A decoded protocol message.
#[derive(Debug, Clone)]
pub enum Message {
    Connect {
        client_version: u32,
        caps: u32,
        client_name: String,
    },
    ConnectResp {
        status: StatusCode,
        server_version: u32,
        caps: u32,
        session_id: u32,
    },
    Disconnect,
    Ping,
    Pong,
    DeviceAttach {
        info: DeviceInfo,
        descriptors: Vec<u8>,
    },
    DeviceAttachResp {
        status: StatusCode,
        local_device_id: u32,
    },
    DeviceDetach {
        local_device_id: u32,
    },
    DeviceList,
    DeviceListResp {
        status: StatusCode,
        devices: Vec<(u32, DeviceInfo)>,
    },
    SubmitUrb {
        header: UrbSubmitHeader,
        data_out: Option<Vec<u8>>,
    },
    UrbComplete {
        header: UrbCompleteHeader,
        data_in: Option<Vec<u8>>,
    },
    CancelUrb {
        device: u32,
        urb_id: u32,
    },
    Error {
        code: u32,
        orig_command: u16,
        orig_sequence: u32,
        message: String,
    },
    /// A well-formed frame whose command code is not in the table (§4.1:
    /// "all others reserved"). Decoding this is not itself fatal — per
    /// §9's discriminated-command note, it is routed to this arm so the
    /// session dispatcher can reply with an `ERROR` frame and close.
    Unknown { code: u16 },
}

impl Message {
    /// The wire command code this message is framed under, or `None` for
    /// [`Message::Unknown`] — which carries a reserved code and is never
    /// itself re-encoded, only ever produced by decode.
    pub fn command(&self) -> Option<Command> {
        match self {
            Message::Connect { .. } | Message::ConnectResp { .. } => Some(Command::Connect),
            Message::Disconnect => Some(Command::Disconnect),
            Message::Ping => Some(Command::Ping),
            Message::Pong => Some(Command::Pong),
            Message::DeviceAttach { .. } | Message::DeviceAttachResp { .. } => {
                Some(Command::DeviceAttach)
            }
            Message::DeviceDetach { .. } => Some(Command::DeviceDetach),
            Message::DeviceList | Message::DeviceListResp { .. } => Some(Command::DeviceList),
            Message::SubmitUrb { .. } => Some(Command::SubmitUrb),
            Message::UrbComplete { .. } => Some(Command::UrbComplete),
            Message::CancelUrb { .. } => Some(Command::CancelUrb),
            Message::Error { .. } => Some(Command::Error),
            Message::Unknown { .. } => None,
        }
    }
}

/// Encode a message's payload (without the frame header).
pub fn encode_payload(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match message {
        Message::Connect {
            client_version,
            caps,
            client_name,
        } => {
            buf.write_u32::<LittleEndian>(*client_version)?;
            buf.write_u32::<LittleEndian>(*caps)?;
            write_fixed_str(&mut buf, client_name, CLIENT_NAME_LEN)?;
        }
        Message::ConnectResp {
            status,
            server_version,
            caps,
            session_id,
        } => {
            buf.write_u32::<LittleEndian>(*status as u32)?;
            buf.write_u32::<LittleEndian>(*server_version)?;
            buf.write_u32::<LittleEndian>(*caps)?;
            buf.write_u32::<LittleEndian>(*session_id)?;
        }
        Message::Disconnect | Message::Ping | Message::Pong | Message::DeviceList => {}
        Message::DeviceAttach { info, descriptors } => {
            write_device_info(&mut buf, info)?;
            buf.write_u32::<LittleEndian>(descriptors.len() as u32)?;
            buf.write_all(descriptors)?;
        }
        Message::DeviceAttachResp {
            status,
            local_device_id,
        } => {
            buf.write_u32::<LittleEndian>(*status as u32)?;
            buf.write_u32::<LittleEndian>(*local_device_id)?;
        }
        Message::DeviceDetach { local_device_id } => {
            buf.write_u32::<LittleEndian>(*local_device_id)?;
        }
        Message::DeviceListResp { status, devices } => {
            buf.write_u32::<LittleEndian>(*status as u32)?;
            buf.write_u32::<LittleEndian>(devices.len() as u32)?;
            for (local_id, info) in devices {
                buf.write_u32::<LittleEndian>(*local_id)?;
                write_device_info(&mut buf, info)?;
            }
        }
        Message::SubmitUrb { header, data_out } => {
            header.write_to(&mut buf)?;
            if let Some(data) = data_out {
                buf.write_all(data)?;
            }
        }
        Message::UrbComplete { header, data_in } => {
            header.write_to(&mut buf)?;
            if let Some(data) = data_in {
                buf.write_all(data)?;
            }
        }
        Message::CancelUrb { device, urb_id } => {
            buf.write_u32::<LittleEndian>(*device)?;
            buf.write_u32::<LittleEndian>(*urb_id)?;
        }
        Message::Error {
            code,
            orig_command,
            orig_sequence,
            message,
        } => {
            buf.write_u32::<LittleEndian>(*code)?;
            buf.write_u32::<LittleEndian>(*orig_command as u32)?;
            buf.write_u32::<LittleEndian>(*orig_sequence)?;
            write_fixed_str(&mut buf, message, ERROR_MESSAGE_LEN)?;
        }
        Message::Unknown { code } => {
            return Err(ProtocolError::InvalidPayload(format!(
                "cannot encode an Unknown message (code {code:#06x})"
            )));
        }
    }
    Ok(buf)
}

/// Decode a message payload given the command it was framed under and
/// whether this peer is decoding it as a request or a response (needed
/// only for the codes shared between the two, per §4.1).
pub fn decode_payload(command: Command, is_response: bool, payload: &[u8]) -> Result<Message> {
    let mut r = payload;
    let msg = match command {
        Command::Connect if !is_response => Message::Connect {
            client_version: r.read_u32::<LittleEndian>()?,
            caps: r.read_u32::<LittleEndian>()?,
            client_name: read_fixed_str(&mut r, CLIENT_NAME_LEN)?,
        },
        Command::Connect => Message::ConnectResp {
            status: StatusCode::from_wire(r.read_u32::<LittleEndian>()?),
            server_version: r.read_u32::<LittleEndian>()?,
            caps: r.read_u32::<LittleEndian>()?,
            session_id: r.read_u32::<LittleEndian>()?,
        },
        Command::Disconnect => Message::Disconnect,
        Command::Ping => Message::Ping,
        Command::Pong => Message::Pong,
        Command::DeviceAttach if !is_response => {
            let info = read_device_info(&mut r)?;
            let desc_len = r.read_u32::<LittleEndian>()? as usize;
            check_remaining(r.len(), desc_len, "descriptor")?;
            let mut descriptors = vec![0u8; desc_len];
            r.read_exact(&mut descriptors)?;
            Message::DeviceAttach { info, descriptors }
        }
        Command::DeviceAttach => Message::DeviceAttachResp {
            status: StatusCode::from_wire(r.read_u32::<LittleEndian>()?),
            local_device_id: r.read_u32::<LittleEndian>()?,
        },
        Command::DeviceDetach => Message::DeviceDetach {
            local_device_id: r.read_u32::<LittleEndian>()?,
        },
        Command::DeviceList if !is_response => Message::DeviceList,
        Command::DeviceList => {
            let status = StatusCode::from_wire(r.read_u32::<LittleEndian>()?);
            let count = r.read_u32::<LittleEndian>()? as usize;
            let entry_size = 4 + DEVICE_INFO_SIZE;
            let needed = count
                .checked_mul(entry_size)
                .ok_or_else(|| ProtocolError::InvalidPayload("device count overflow".to_string()))?;
            check_remaining(r.len(), needed, "device list")?;
            let mut devices = Vec::with_capacity(count);
            for _ in 0..count {
                let local_id = r.read_u32::<LittleEndian>()?;
                let info = read_device_info(&mut r)?;
                devices.push((local_id, info));
            }
            Message::DeviceListResp { status, devices }
        }
        Command::SubmitUrb => {
            let header = UrbSubmitHeader::read_from(&mut r)?;
            let data_out = if header.direction == 0 && header.buf_len > 0 {
                let buf_len = header.buf_len as usize;
                check_remaining(r.len(), buf_len, "urb data_out")?;
                let mut data = vec![0u8; buf_len];
                r.read_exact(&mut data)?;
                Some(data)
            } else {
                None
            };
            Message::SubmitUrb { header, data_out }
        }
        Command::UrbComplete => {
            let header = UrbCompleteHeader::read_from(&mut r)?;
            let data_in = if header.actual_length > 0 && !r.is_empty() {
                let actual_length = header.actual_length as usize;
                check_remaining(r.len(), actual_length, "urb data_in")?;
                let mut data = vec![0u8; actual_length];
                r.read_exact(&mut data)?;
                Some(data)
            } else {
                None
            };
            Message::UrbComplete { header, data_in }
        }
        Command::CancelUrb => Message::CancelUrb {
            device: r.read_u32::<LittleEndian>()?,
            urb_id: r.read_u32::<LittleEndian>()?,
        },
        Command::Error => Message::Error {
            code: r.read_u32::<LittleEndian>()?,
            orig_command: r.read_u32::<LittleEndian>()? as u16,
            orig_sequence: r.read_u32::<LittleEndian>()?,
            message: read_fixed_str(&mut r, ERROR_MESSAGE_LEN)?,
        },
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceSpeed;

    fn sample_device_info() -> DeviceInfo {
        DeviceInfo {
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_class: 0xFF,
            device_subclass: 0x00,
            device_protocol: 0x00,
            speed: DeviceSpeed::High,
            num_configurations: 1,
            num_interfaces: 1,
            manufacturer: "Acme".to_string(),
            product: "Widget".to_string(),
            serial_number: "SN001".to_string(),
        }
    }

    #[test]
    fn test_connect_roundtrip() {
        let msg = Message::Connect {
            client_version: 0x0001_0000,
            caps: 0,
            client_name: "t".to_string(),
        };
        let encoded = encode_payload(&msg).unwrap();
        let decoded = decode_payload(Command::Connect, false, &encoded).unwrap();
        match decoded {
            Message::Connect {
                client_version,
                caps,
                client_name,
            } => {
                assert_eq!(client_version, 0x0001_0000);
                assert_eq!(caps, 0);
                assert_eq!(client_name, "t");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_device_attach_roundtrip() {
        let msg = Message::DeviceAttach {
            info: sample_device_info(),
            descriptors: vec![0x12, 0x01, 0x00, 0x02],
        };
        let encoded = encode_payload(&msg).unwrap();
        let decoded = decode_payload(Command::DeviceAttach, false, &encoded).unwrap();
        match decoded {
            Message::DeviceAttach { info, descriptors } => {
                assert_eq!(info.vendor_id, 0x1234);
                assert_eq!(info.product_id, 0x5678);
                assert_eq!(descriptors, vec![0x12, 0x01, 0x00, 0x02]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_submit_urb_out_roundtrip() {
        let header = UrbSubmitHeader {
            device_id: 1,
            urb_id: 7,
            endpoint_address: 0x01,
            transfer_type: 2,
            direction: 0,
            reserved: 0,
            transfer_flags: 0,
            buf_len: 4,
            interval: 0,
            setup_packet: [0; 8],
        };
        let msg = Message::SubmitUrb {
            header: header.clone(),
            data_out: Some(vec![1, 2, 3, 4]),
        };
        let encoded = encode_payload(&msg).unwrap();
        let decoded = decode_payload(Command::SubmitUrb, false, &encoded).unwrap();
        match decoded {
            Message::SubmitUrb { header: h, data_out } => {
                assert_eq!(h, header);
                assert_eq!(data_out, Some(vec![1, 2, 3, 4]));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_submit_urb_in_has_no_trailing_data() {
        let header = UrbSubmitHeader {
            device_id: 1,
            urb_id: 7,
            endpoint_address: 0x81,
            transfer_type: 2,
            direction: 1,
            reserved: 0,
            transfer_flags: 0,
            buf_len: 64,
            interval: 0,
            setup_packet: [0; 8],
        };
        let msg = Message::SubmitUrb {
            header,
            data_out: None,
        };
        let encoded = encode_payload(&msg).unwrap();
        assert_eq!(encoded.len(), UrbSubmitHeader::SIZE);
    }

    #[test]
    fn test_urb_complete_in_roundtrip() {
        let header = UrbCompleteHeader {
            device_id: 1,
            urb_id: 7,
            status: StatusCode::Success as u32,
            actual_length: 8,
            error_count: 0,
        };
        let data = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01, 0x02, 0x03];
        let msg = Message::UrbComplete {
            header: header.clone(),
            data_in: Some(data.clone()),
        };
        let encoded = encode_payload(&msg).unwrap();
        let decoded = decode_payload(Command::UrbComplete, false, &encoded).unwrap();
        match decoded {
            Message::UrbComplete { header: h, data_in } => {
                assert_eq!(h, header);
                assert_eq!(data_in, Some(data));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_device_list_resp_roundtrip() {
        let msg = Message::DeviceListResp {
            status: StatusCode::Success,
            devices: vec![(1, sample_device_info())],
        };
        let encoded = encode_payload(&msg).unwrap();
        let decoded = decode_payload(Command::DeviceList, true, &encoded).unwrap();
        match decoded {
            Message::DeviceListResp { status, devices } => {
                assert_eq!(status, StatusCode::Success);
                assert_eq!(devices.len(), 1);
                assert_eq!(devices[0].0, 1);
                assert_eq!(devices[0].1.vendor_id, 0x1234);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_error_message_roundtrip() {
        let msg = Message::Error {
            code: 1,
            orig_command: Command::DeviceAttach as u16,
            orig_sequence: 9,
            message: "bad descriptor".to_string(),
        };
        let encoded = encode_payload(&msg).unwrap();
        let decoded = decode_payload(Command::Error, true, &encoded).unwrap();
        match decoded {
            Message::Error {
                code,
                orig_command,
                orig_sequence,
                message,
            } => {
                assert_eq!(code, 1);
                assert_eq!(orig_command, Command::DeviceAttach as u16);
                assert_eq!(orig_sequence, 9);
                assert_eq!(message, "bad descriptor");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_oversized_descriptor_length_rejected_without_allocating() {
        let info = sample_device_info();
        let mut buf = Vec::new();
        write_device_info(&mut buf, &info).unwrap();
        buf.write_u32::<LittleEndian>(u32::MAX).unwrap();
        // no descriptor bytes actually follow
        let err = decode_payload(Command::DeviceAttach, false, &buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn test_oversized_device_list_count_rejected() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(StatusCode::Success as u32).unwrap();
        buf.write_u32::<LittleEndian>(u32::MAX).unwrap();
        let err = decode_payload(Command::DeviceList, true, &buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn test_oversized_submit_urb_data_out_rejected() {
        let header = UrbSubmitHeader {
            device_id: 1,
            urb_id: 1,
            endpoint_address: 0x01,
            transfer_type: 2,
            direction: 0,
            reserved: 0,
            transfer_flags: 0,
            buf_len: u32::MAX,
            interval: 0,
            setup_packet: [0; 8],
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        // no trailing data_out bytes actually follow
        let err = decode_payload(Command::SubmitUrb, false, &buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn test_oversized_urb_complete_data_in_rejected() {
        let header = UrbCompleteHeader {
            device_id: 1,
            urb_id: 1,
            status: StatusCode::Success as u32,
            actual_length: u32::MAX,
            error_count: 0,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        buf.push(0); // one trailing byte, nowhere near actual_length
        let err = decode_payload(Command::UrbComplete, false, &buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn test_unknown_message_rejected_by_encode_payload() {
        let err = encode_payload(&Message::Unknown { code: 0x1234 }).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }
}
