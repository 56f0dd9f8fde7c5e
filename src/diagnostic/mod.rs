//! Application layer: UDS diagnostic services.

pub mod uds;

pub use uds::{
    nrc, RoutineHandler, RoutineOutcome, SecurityLevel, SecurityMask, SessionMask, UdsAction,
    UdsConfig, UdsServer, UdsSession,
};
