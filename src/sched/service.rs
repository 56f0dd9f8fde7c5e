//! Cooperative "pseudo-task" primitive.
//!
//! Each service holds an atomically-ORed bitmask of pending event flags.
//! Setting a flag - from interrupt or timer context - marks the service
//! runnable; the host loop invokes the handler of every service with a
//! non-zero mask. Handlers test-and-clear the flags they recognize and
//! return; preemption happens only at host-loop granularity.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Event flags pending on a service.
    ///
    /// The three low bits are reserved; modules allocate their own flags
    /// starting at [`EventMask::FIRST_USER_BIT`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const INIT = 1 << 0;
        const RE_INIT = 1 << 1;
        const TRIGGER_SHUTDOWN = 1 << 2;
        // Module-specific flags live in the remaining bits.
        const _ = !0;
    }
}

impl EventMask {
    /// First bit index available for module-specific events.
    pub const FIRST_USER_BIT: u32 = 3;

    /// Convenience constructor for a module-specific flag.
    pub const fn user(bit: u32) -> Self {
        Self::from_bits_retain(1 << (Self::FIRST_USER_BIT + bit))
    }
}

/// Handle identifying a service registered with a [`ServiceHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceId(usize);

struct ServiceSlot {
    events: AtomicU32,
    terminated: AtomicBool,
}

/// Ordered collection of services sharing one cooperative host loop.
///
/// Event mutation is lock-free: `set_event` may be called from interrupt or
/// timer context while a handler is running in service context.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<ServiceSlot>,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new service. The INIT event starts out pending so the
    /// handler runs its init action on the first host invocation.
    pub fn register(&mut self) -> ServiceId {
        self.services.push(ServiceSlot {
            events: AtomicU32::new(EventMask::INIT.bits()),
            terminated: AtomicBool::new(false),
        });
        ServiceId(self.services.len() - 1)
    }

    /// ORs `mask` into the service's pending events.
    pub fn set_event(&self, id: ServiceId, mask: EventMask) {
        self.services[id.0].events.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    /// Atomically clears `mask` from the pending events and returns whether
    /// any bit in `mask` was set.
    pub fn check_clear_event(&self, id: ServiceId, mask: EventMask) -> bool {
        let prev = self.services[id.0]
            .events
            .fetch_and(!mask.bits(), Ordering::AcqRel);
        prev & mask.bits() != 0
    }

    /// Currently pending events of a service. Snapshot only; flags may be
    /// set concurrently.
    pub fn pending(&self, id: ServiceId) -> EventMask {
        EventMask::from_bits_retain(self.services[id.0].events.load(Ordering::Acquire))
    }

    /// True if any registered service has a pending event.
    pub fn any_pending(&self) -> bool {
        self.services
            .iter()
            .any(|s| s.events.load(Ordering::Acquire) != 0)
    }

    /// Sets the shutdown flag on every hosted service.
    pub fn trigger_shutdown(&self) {
        for slot in &self.services {
            slot.events
                .fetch_or(EventMask::TRIGGER_SHUTDOWN.bits(), Ordering::AcqRel);
        }
    }

    /// Marks a service as terminated. Called by the service itself after it
    /// observed the shutdown flag and completed cleanup.
    pub fn terminate(&self, id: ServiceId) {
        self.services[id.0].terminated.store(true, Ordering::Release);
    }

    /// True once every hosted service has terminated.
    pub fn is_terminated(&self) -> bool {
        self.services
            .iter()
            .all(|s| s.terminated.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_pending_after_register() {
        let mut host = ServiceHost::new();
        let id = host.register();
        assert!(host.pending(id).contains(EventMask::INIT));
        assert!(host.check_clear_event(id, EventMask::INIT));
        assert!(host.pending(id).is_empty());
    }

    #[test]
    fn test_check_clear_only_removes_requested_bits() {
        let mut host = ServiceHost::new();
        let id = host.register();
        host.check_clear_event(id, EventMask::INIT);

        let ev_a = EventMask::user(0);
        let ev_b = EventMask::user(1);
        host.set_event(id, ev_a | ev_b);

        assert!(host.check_clear_event(id, ev_a));
        assert!(!host.check_clear_event(id, ev_a));
        assert_eq!(host.pending(id), ev_b);
    }

    #[test]
    fn test_check_clear_reports_any_bit() {
        let mut host = ServiceHost::new();
        let id = host.register();
        host.check_clear_event(id, EventMask::INIT);

        host.set_event(id, EventMask::user(2));
        // A mask covering set and unset bits still reports true.
        assert!(host.check_clear_event(id, EventMask::user(2) | EventMask::user(5)));
        assert!(host.pending(id).is_empty());
    }

    #[test]
    fn test_shutdown_and_termination() {
        let mut host = ServiceHost::new();
        let a = host.register();
        let b = host.register();

        host.trigger_shutdown();
        assert!(host.pending(a).contains(EventMask::TRIGGER_SHUTDOWN));
        assert!(host.pending(b).contains(EventMask::TRIGGER_SHUTDOWN));
        assert!(!host.is_terminated());

        host.terminate(a);
        assert!(!host.is_terminated());
        host.terminate(b);
        assert!(host.is_terminated());
    }

    #[test]
    fn test_set_event_from_other_thread() {
        let mut host = ServiceHost::new();
        let id = host.register();
        host.check_clear_event(id, EventMask::INIT);

        let host = std::sync::Arc::new(host);
        let producer = std::sync::Arc::clone(&host);
        let handle = std::thread::spawn(move || {
            for _ in 0..1000 {
                producer.set_event(id, EventMask::user(0));
            }
        });
        handle.join().unwrap();
        assert!(host.check_clear_event(id, EventMask::user(0)));
    }
}
