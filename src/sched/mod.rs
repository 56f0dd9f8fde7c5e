//! Scheduling primitives shared by every protocol module.
//!
//! Two cooperating pieces:
//! - [`timer`] - a millisecond tick-driven, deadline-sorted timer list;
//!   everything else in the stack schedules work through it.
//! - [`service`] - the event-flag "pseudo-task" abstraction: interrupt and
//!   timer context raise flags, a cooperative host loop runs the handlers.
//!
//! No operation here blocks; all waiting is expressed as arming a timer and
//! returning.

pub mod service;
pub mod timer;

pub use service::{EventMask, ServiceHost, ServiceId};
pub use timer::{TimerId, TimerList};
