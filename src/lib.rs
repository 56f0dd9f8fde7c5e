// Layered protocol modules
pub mod diagnostic; // UDS service dispatcher
pub mod network; // CAN network management
pub mod transport; // ISO 15765-2 transport protocol

// Infrastructure shared by all modules
pub mod driver;
pub mod queue;
pub mod sched;
pub mod stack;

// Re-exports for convenience
pub use diagnostic::uds;
pub use network::nm;
pub use stack::{EcuStack, StackConfig};
pub use transport::cantp;

// Common types and traits
pub mod error;
pub mod types;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
