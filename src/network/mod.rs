//! Network layer: cooperative bus wake/sleep management.

pub mod nm;

pub use nm::{NetworkManager, NmConfig, NmControlBits, NmPdu, NmState, WakeReason};
