//! Protocol-wide constants (§6 of the design).

/// Magic value identifying a frame header ("VUSB" read as a little-endian u32).
pub const MAGIC: u32 = 0x5655_5342;

/// Wire protocol version (major.minor packed as a u16: 0x0100 = 1.0).
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Size in bytes of the fixed frame header.
pub const HEADER_SIZE: usize = 16;

/// Maximum total frame size (header + payload).
pub const MAX_FRAME_SIZE: usize = 65_536;

/// Maximum payload size (MAX_FRAME_SIZE - HEADER_SIZE).
pub const MAX_PAYLOAD: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Default TCP port the server listens on.
pub const DEFAULT_PORT: u16 = 7575;

/// Maximum number of device slots in a server-side registry.
pub const MAX_DEVICES: usize = 16;

/// Default URB completion deadline for control/bulk/interrupt transfers.
pub const DEFAULT_URB_TIMEOUT_MS: u64 = 5_000;

/// Bound on outstanding frames in a session's send lane before backpressure applies.
pub const SEND_LANE_CAPACITY: usize = 256;

/// Bound on parsed-but-undispatched messages in a session's receive queue.
pub const RECEIVE_QUEUE_CAPACITY: usize = 256;
