//! Data model shared by both sides of the bridge (§3 of the design).
//!
//! These are the in-memory shapes the codec encodes/decodes to and from;
//! the wire layout itself lives in [`crate::messages`].

/// The client-chosen id carried in attach messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteDeviceId(pub u32);

/// The server-assigned id; also the registry slot index (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalDeviceId(pub u32);

/// Monotonically assigned per device on the submitter side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UrbId(pub u32);

/// Server-assigned session identifier, echoed in `CONNECT_RESP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

/// USB device speed, as carried in [`DeviceInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceSpeed {
    Unknown = 0,
    Low = 1,
    Full = 2,
    High = 3,
    Super = 4,
    SuperPlus = 5,
}

impl DeviceSpeed {
    pub fn from_wire(code: u8) -> Self {
        match code {
            1 => DeviceSpeed::Low,
            2 => DeviceSpeed::Full,
            3 => DeviceSpeed::High,
            4 => DeviceSpeed::Super,
            5 => DeviceSpeed::SuperPlus,
            _ => DeviceSpeed::Unknown,
        }
    }
}

/// USB transfer type, as carried in [`crate::messages::UrbSubmitHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(TransferType::Control),
            1 => Some(TransferType::Isochronous),
            2 => Some(TransferType::Bulk),
            3 => Some(TransferType::Interrupt),
            _ => None,
        }
    }
}

/// Transfer direction. Bit 7 of a USB endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn from_endpoint(endpoint: u8) -> Self {
        if endpoint & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn from_wire(code: u8) -> Self {
        if code != 0 { Direction::In } else { Direction::Out }
    }
}

/// The 8-byte control transfer setup packet, carried verbatim (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

/// Summary device view exchanged over the wire (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub speed: DeviceSpeed,
    pub num_configurations: u8,
    pub num_interfaces: u8,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

/// Internal, submitter-supplied URB request (§3).
#[derive(Debug, Clone)]
pub struct UrbRequest {
    pub device: u32,
    pub urb_id: UrbId,
    pub endpoint: u8,
    pub transfer_type: TransferType,
    pub direction: Direction,
    pub flags: u32,
    pub buf_len: u32,
    pub interval: u32,
    pub setup: SetupPacket,
    pub data_out: Option<Vec<u8>>,
}

/// Completion of a [`UrbRequest`] (§3).
#[derive(Debug, Clone)]
pub struct UrbCompletion {
    pub device: u32,
    pub urb_id: UrbId,
    pub status: crate::status::StatusCode,
    pub actual_length: u32,
    pub data_in: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_endpoint() {
        assert_eq!(Direction::from_endpoint(0x81), Direction::In);
        assert_eq!(Direction::from_endpoint(0x01), Direction::Out);
        assert_eq!(Direction::from_endpoint(0x00), Direction::Out);
    }

    #[test]
    fn test_device_speed_roundtrip() {
        for code in 0u8..=5 {
            let speed = DeviceSpeed::from_wire(code);
            assert_eq!(speed as u8, code);
        }
    }

    #[test]
    fn test_transfer_type_unknown_code() {
        assert!(TransferType::from_wire(0).is_some());
        assert!(TransferType::from_wire(4).is_none());
    }
}
