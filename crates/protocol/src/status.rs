//! Status codes carried on the wire (§6).

/// Result status carried in responses and URB completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Success = 0,
    Pending = 1,
    Error = 2,
    Stall = 3,
    Timeout = 4,
    Cancelled = 5,
    NoDevice = 6,
    InvalidParam = 7,
    NoMemory = 8,
    NotSupported = 9,
    Disconnected = 10,
}

impl StatusCode {
    pub fn from_wire(code: u32) -> Self {
        match code {
            0 => StatusCode::Success,
            1 => StatusCode::Pending,
            2 => StatusCode::Error,
            3 => StatusCode::Stall,
            4 => StatusCode::Timeout,
            5 => StatusCode::Cancelled,
            6 => StatusCode::NoDevice,
            7 => StatusCode::InvalidParam,
            8 => StatusCode::NoMemory,
            9 => StatusCode::NotSupported,
            10 => StatusCode::Disconnected,
            _ => StatusCode::Error,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for code in 0u32..=10 {
            assert_eq!(StatusCode::from_wire(code) as u32, code);
        }
    }

    #[test]
    fn test_unknown_code_maps_to_error() {
        assert_eq!(StatusCode::from_wire(999), StatusCode::Error);
    }
}
