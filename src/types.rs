/// CAN ID type
pub type CanId = u32;

/// Generic frame data type
pub type FrameData = Vec<u8>;

/// Timestamp in milliseconds
pub type Timestamp = u64;

/// Raw CAN message as exchanged with the hardware driver.
///
/// Created at the hardware boundary on receive, or synthesized by a protocol
/// layer before transmit. A frame is immutable once enqueued and consumed
/// exactly once by a FIFO pop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u8,
    pub id: CanId,
    pub data: FrameData,
    pub timestamp: Timestamp,
    pub is_extended: bool,
    pub is_remote: bool,
    pub is_fd: bool,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            channel: 0,
            id: 0,
            data: Vec::new(),
            timestamp: 0,
            is_extended: false,
            is_remote: false,
            is_fd: false,
        }
    }
}

/// Configuration trait that must be implemented by all protocol configurations
pub trait Config {
    fn validate(&self) -> crate::error::Result<()>;
}
