//! Millisecond tick-driven deadline list.
//!
//! Timers are kept sorted by absolute deadline over a wrapping 32-bit
//! millisecond counter. `tick()` is expected to run once per millisecond in
//! the highest-priority execution context; all list mutation happens there.
//! Queries from other contexts are eventually consistent only.
//!
//! Expiry does not invoke a callback directly: each timer carries the
//! identity of the service it belongs to plus the event flags to raise, and
//! `tick()` delivers those through the [`ServiceHost`]. This keeps the tick
//! path free of re-entrant module mutation.

use super::service::{EventMask, ServiceHost, ServiceId};

/// Handle identifying a timer created in a [`TimerList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(usize);

/// Half the 32-bit range; distances below this count as "due or past".
const WRAP_HALF: u32 = 0x8000_0000;

struct TimerSlot {
    running: bool,
    deadline: u32,
    period_ms: u32,
    service: ServiceId,
    events: EventMask,
}

/// Time-ordered list of one-shot and periodic deadlines.
pub struct TimerList {
    now_ms: u32,
    uptime_ms: u64,
    slots: Vec<TimerSlot>,
    /// Active timers, sorted by time-to-deadline ascending.
    active: Vec<TimerId>,
}

impl TimerList {
    pub fn new() -> Self {
        Self {
            now_ms: 0,
            uptime_ms: 0,
            slots: Vec::new(),
            active: Vec::new(),
        }
    }

    /// Allocates a timer that, on expiry, raises `events` on `service`.
    pub fn create(&mut self, service: ServiceId, events: EventMask) -> TimerId {
        self.slots.push(TimerSlot {
            running: false,
            deadline: 0,
            period_ms: 0,
            service,
            events,
        });
        TimerId(self.slots.len() - 1)
    }

    /// Starts a timer `timeout_ms` from now; `period_ms != 0` makes it
    /// periodic after the first expiry.
    ///
    /// Returns `false` without touching the list if `timeout_ms` is zero or
    /// the timer is already running.
    pub fn start(&mut self, id: TimerId, timeout_ms: u32, period_ms: u32) -> bool {
        if timeout_ms == 0 || self.slots[id.0].running {
            return false;
        }
        let deadline = self.now_ms.wrapping_add(timeout_ms);
        let slot = &mut self.slots[id.0];
        slot.running = true;
        slot.deadline = deadline;
        slot.period_ms = period_ms;
        self.insert_sorted(id);
        true
    }

    /// Stops a timer. Idempotent; stopping an inactive timer is a no-op.
    pub fn stop(&mut self, id: TimerId) {
        if !self.slots[id.0].running {
            return;
        }
        self.slots[id.0].running = false;
        self.active.retain(|&t| t != id);
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.slots[id.0].running
    }

    /// Remaining time of a running timer, saturating at 0 once the deadline
    /// has passed. `None` if the timer is stopped.
    pub fn time_left_ms(&self, id: TimerId) -> Option<u32> {
        let slot = &self.slots[id.0];
        if !slot.running {
            return None;
        }
        let left = slot.deadline.wrapping_sub(self.now_ms);
        Some(if left >= WRAP_HALF { 0 } else { left })
    }

    /// Milliseconds elapsed since construction.
    pub fn uptime_ms(&self) -> u64 {
        self.uptime_ms
    }

    /// Advances time by one millisecond and delivers every expired timer's
    /// events through `host`.
    ///
    /// Periodic timers re-arm at `old_deadline + period`, not `now + period`,
    /// so the cadence does not drift.
    pub fn tick(&mut self, host: &ServiceHost) {
        self.now_ms = self.now_ms.wrapping_add(1);
        self.uptime_ms += 1;

        while let Some(&head) = self.active.first() {
            let due = self.now_ms.wrapping_sub(self.slots[head.0].deadline) < WRAP_HALF;
            if !due {
                break;
            }
            self.active.remove(0);
            let (service, events) = {
                let slot = &mut self.slots[head.0];
                if slot.period_ms != 0 {
                    slot.deadline = slot.deadline.wrapping_add(slot.period_ms);
                } else {
                    slot.running = false;
                }
                (slot.service, slot.events)
            };
            if self.slots[head.0].running {
                self.insert_sorted(head);
            }
            host.set_event(service, events);
        }
    }

    fn insert_sorted(&mut self, id: TimerId) {
        let distance = |t: TimerId, now: u32, slots: &[TimerSlot]| {
            slots[t.0].deadline.wrapping_sub(now)
        };
        let d = distance(id, self.now_ms, &self.slots);
        let pos = self
            .active
            .iter()
            .position(|&t| distance(t, self.now_ms, &self.slots) > d)
            .unwrap_or(self.active.len());
        self.active.insert(pos, id);
    }

    #[cfg(test)]
    fn set_now(&mut self, now_ms: u32) {
        self.now_ms = now_ms;
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (TimerList, ServiceHost, ServiceId) {
        let mut host = ServiceHost::new();
        let svc = host.register();
        host.check_clear_event(svc, EventMask::INIT);
        (TimerList::new(), host, svc)
    }

    fn run_ms(timers: &mut TimerList, host: &ServiceHost, ms: u32) {
        for _ in 0..ms {
            timers.tick(host);
        }
    }

    #[test]
    fn test_start_zero_timeout_fails() {
        let (mut timers, _host, svc) = fixture();
        let t = timers.create(svc, EventMask::user(0));
        assert!(!timers.start(t, 0, 0));
        assert!(!timers.is_running(t));
    }

    #[test]
    fn test_start_while_running_fails() {
        let (mut timers, _host, svc) = fixture();
        let t = timers.create(svc, EventMask::user(0));
        assert!(timers.start(t, 10, 0));
        assert!(!timers.start(t, 20, 0));
        assert_eq!(timers.time_left_ms(t), Some(10));
    }

    #[test]
    fn test_one_shot_fires_once_at_deadline() {
        let (mut timers, host, svc) = fixture();
        let t = timers.create(svc, EventMask::user(0));
        timers.start(t, 5, 0);

        run_ms(&mut timers, &host, 4);
        assert!(host.pending(svc).is_empty());

        timers.tick(&host);
        assert!(host.check_clear_event(svc, EventMask::user(0)));
        assert!(!timers.is_running(t));

        run_ms(&mut timers, &host, 20);
        assert!(host.pending(svc).is_empty());
    }

    #[test]
    fn test_periodic_rearm_does_not_drift() {
        let (mut timers, host, svc) = fixture();
        let t = timers.create(svc, EventMask::user(0));
        timers.start(t, 5, 10);

        let mut expiries = Vec::new();
        for tick in 1..=40u64 {
            timers.tick(&host);
            if host.check_clear_event(svc, EventMask::user(0)) {
                expiries.push(tick);
            }
        }
        assert_eq!(expiries, vec![5, 15, 25, 35]);
        assert!(timers.is_running(t));
    }

    #[test]
    fn test_expiry_in_deadline_order() {
        let (mut timers, host, svc) = fixture();
        let slow = timers.create(svc, EventMask::user(1));
        let fast = timers.create(svc, EventMask::user(0));
        timers.start(slow, 8, 0);
        timers.start(fast, 3, 0);

        run_ms(&mut timers, &host, 3);
        assert!(host.check_clear_event(svc, EventMask::user(0)));
        assert!(!host.check_clear_event(svc, EventMask::user(1)));

        run_ms(&mut timers, &host, 5);
        assert!(host.check_clear_event(svc, EventMask::user(1)));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut timers, host, svc) = fixture();
        let t = timers.create(svc, EventMask::user(0));
        timers.start(t, 5, 0);
        timers.stop(t);
        timers.stop(t);
        run_ms(&mut timers, &host, 10);
        assert!(host.pending(svc).is_empty());
    }

    #[test]
    fn test_deadline_across_counter_wrap() {
        let (mut timers, host, svc) = fixture();
        timers.set_now(u32::MAX - 2);
        let t = timers.create(svc, EventMask::user(0));
        timers.start(t, 5, 0);
        assert_eq!(timers.time_left_ms(t), Some(5));

        run_ms(&mut timers, &host, 4);
        assert!(host.pending(svc).is_empty());
        timers.tick(&host);
        assert!(host.check_clear_event(svc, EventMask::user(0)));
    }
}
