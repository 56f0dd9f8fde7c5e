//! External collaborator seams.
//!
//! The stack does not program CAN controller registers or manage bus-off
//! recovery itself; it talks to the hardware through the [`CanDriver`] trait
//! and expects the integration glue to forward the driver's receive/sent/
//! bus-off callbacks into the stack's entry points. Network management state
//! history is persisted through the single-slot [`NvStore`] trait.

pub mod mock;

use crate::error::Result;
use crate::types::Frame;

/// CAN hardware driver contract.
pub trait CanDriver {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Queues one frame for transmission. The driver confirms completion
    /// asynchronously via the host glue calling `EcuStack::on_msg_sent`.
    fn send_message(&mut self, frame: &Frame) -> Result<()>;
    /// Returns the next received frame, or `None` if the hardware queue is
    /// empty.
    fn get_next_message(&mut self) -> Option<Frame>;
}

/// Single-slot non-volatile storage used for the NM state history.
pub trait NvStore {
    /// Reads the persisted slot. `None` if nothing was ever stored.
    fn load(&mut self) -> Option<u8>;
    /// Overwrites the persisted slot.
    fn store(&mut self, value: u8);
}
