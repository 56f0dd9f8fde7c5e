//! CAN network management: cooperative bus wake/sleep coordination.
//!
//! Event-driven state machine over the states POWER_OFF, SLEEP,
//! REPEAT_MESSAGE, NORMAL, READY_SLEEP and PREPARE_SLEEP. While awake the
//! node broadcasts its NM PDU on a fixed cycle; leaving the bus goes through
//! the ready-sleep / prepare-sleep handshake so every participant observes
//! the same quiet period before transmission stops.
//!
//! Each committed transition is mirrored into a single-slot non-volatile
//! store. After an unexpected reset the node resumes the sleep handshake
//! from PREPARE_SLEEP instead of waking the whole bus again.

use bitflags::bitflags;
use tracing::{debug, info, trace, warn};

use crate::driver::{CanDriver, NvStore};
use crate::error::{Result, StackError};
use crate::queue::Fifo;
use crate::sched::{EventMask, ServiceHost, ServiceId, TimerId, TimerList};
use crate::types::{CanId, Config, Frame};

// Service events
const EV_RX_PDU: EventMask = EventMask::user(0);
const EV_TX_CONFIRM: EventMask = EventMask::user(1);
const EV_NET_REQUEST: EventMask = EventMask::user(2);
const EV_NET_RELEASE: EventMask = EventMask::user(3);
const EV_TIMER_CYCLE: EventMask = EventMask::user(4);
const EV_TIMER_ACK: EventMask = EventMask::user(5);
const EV_TIMER_REPEAT: EventMask = EventMask::user(6);
const EV_TIMER_NM_TIMEOUT: EventMask = EventMask::user(7);
const EV_TIMER_WAIT_SLEEP: EventMask = EventMask::user(8);

bitflags! {
    /// Why the node is (or wants to be) awake. Reasons OR-combine and are
    /// cleared independently; the aggregate gates leaving SLEEP.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WakeReason: u8 {
        /// Wakeup originated on this node (application, local input).
        const LOCAL = 1 << 0;
        /// Wakeup caused by NM traffic from another node.
        const REMOTE = 1 << 1;
    }
}

bitflags! {
    /// Control bits in byte 1 of the NM PDU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NmControlBits: u8 {
        const REPEAT_MESSAGE_REQUEST = 1 << 0;
        const COORDINATOR_SLEEP = 1 << 3;
        const ACTIVE_WAKEUP = 1 << 4;
        const PARTIAL_NETWORK = 1 << 6;
    }
}

/// On-wire NM PDU: byte 0 node id, byte 1 control bits, bytes 2-7 user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmPdu {
    pub node_id: u8,
    pub control: NmControlBits,
    pub user_data: [u8; 6],
}

impl NmPdu {
    pub fn encode(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.node_id;
        bytes[1] = self.control.bits();
        bytes[2..8].copy_from_slice(&self.user_data);
        bytes
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let mut user_data = [0u8; 6];
        user_data.copy_from_slice(&data[2..8]);
        Some(Self {
            node_id: data[0],
            control: NmControlBits::from_bits_truncate(data[1]),
            user_data,
        })
    }
}

/// Network management state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmState {
    PowerOff,
    Sleep,
    RepeatMessage,
    Normal,
    ReadySleep,
    PrepareSleep,
}

impl NmState {
    fn to_nv(self) -> u8 {
        match self {
            NmState::PowerOff => 0,
            NmState::Sleep => 1,
            NmState::RepeatMessage => 2,
            NmState::Normal => 3,
            NmState::ReadySleep => 4,
            NmState::PrepareSleep => 5,
        }
    }

    fn from_nv(value: u8) -> Option<Self> {
        match value {
            0 => Some(NmState::PowerOff),
            1 => Some(NmState::Sleep),
            2 => Some(NmState::RepeatMessage),
            3 => Some(NmState::Normal),
            4 => Some(NmState::ReadySleep),
            5 => Some(NmState::PrepareSleep),
            _ => None,
        }
    }
}

/// Events driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NmEvent {
    PowerOn,
    /// Bus activity or an application network request.
    Start,
    /// Application released the network.
    Release,
    /// Peer asked everybody to (re)enter REPEAT_MESSAGE.
    KeepRepeat,
    /// Repeat-message state duration elapsed.
    RepeatTimeout,
    /// Quiet period in READY_SLEEP elapsed.
    PrepareSleep,
    /// Quiet period in PREPARE_SLEEP elapsed.
    GoToSleep,
}

/// Network management configuration.
#[derive(Debug, Clone)]
pub struct NmConfig {
    pub channel: u8,
    /// Own node identifier, also the offset of the tx identifier.
    pub node_id: u8,
    /// Base of the NM identifier range; this node transmits on
    /// `base_id + node_id` and listens on the whole range.
    pub base_id: CanId,
    /// NM PDU transmission period while awake.
    pub cycle_ms: u32,
    /// Window for the driver to confirm an NM PDU transmission.
    pub ack_timeout_ms: u32,
    /// Duration of the REPEAT_MESSAGE state.
    pub repeat_ms: u32,
    /// Bus-silence supervision window while participating.
    pub nm_timeout_ms: u32,
    /// Quiet period observed in READY_SLEEP and again in PREPARE_SLEEP.
    pub wait_sleep_ms: u32,
    pub rx_queue_depth: usize,
    pub partial_network: bool,
    pub coordinator_sleep: bool,
}

impl Default for NmConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            node_id: 0x10,
            base_id: 0x500,
            cycle_ms: 500,
            ack_timeout_ms: 100,
            repeat_ms: 1600,
            nm_timeout_ms: 2000,
            wait_sleep_ms: 1500,
            rx_queue_depth: 8,
            partial_network: false,
            coordinator_sleep: false,
        }
    }
}

impl Config for NmConfig {
    fn validate(&self) -> Result<()> {
        if self.cycle_ms == 0
            || self.repeat_ms == 0
            || self.nm_timeout_ms == 0
            || self.wait_sleep_ms == 0
            || self.rx_queue_depth == 0
        {
            return Err(StackError::InvalidParameter);
        }
        Ok(())
    }
}

/// One network management node instance.
pub struct NetworkManager<N: NvStore> {
    config: NmConfig,
    service: ServiceId,
    state: NmState,
    network_requested: bool,
    wake_reasons: WakeReason,
    /// Request the REPEAT_MESSAGE bit in outgoing PDUs.
    repeat_request: bool,
    user_data: [u8; 6],
    rx_fifo: Fifo<Frame>,
    awaiting_confirm: Option<CanId>,
    nv: N,
    tx_error_count: u32,
    t_cycle: TimerId,
    t_ack: TimerId,
    t_repeat: TimerId,
    t_nm_timeout: TimerId,
    t_wait_sleep: TimerId,
}

impl<N: NvStore> NetworkManager<N> {
    pub fn new(
        config: NmConfig,
        nv: N,
        host: &mut ServiceHost,
        timers: &mut TimerList,
    ) -> Result<Self> {
        config.validate()?;
        let service = host.register();
        let rx_fifo = Fifo::new(config.rx_queue_depth, false);
        Ok(Self {
            t_cycle: timers.create(service, EV_TIMER_CYCLE),
            t_ack: timers.create(service, EV_TIMER_ACK),
            t_repeat: timers.create(service, EV_TIMER_REPEAT),
            t_nm_timeout: timers.create(service, EV_TIMER_NM_TIMEOUT),
            t_wait_sleep: timers.create(service, EV_TIMER_WAIT_SLEEP),
            config,
            service,
            state: NmState::PowerOff,
            network_requested: false,
            wake_reasons: WakeReason::empty(),
            repeat_request: false,
            user_data: [0; 6],
            rx_fifo,
            awaiting_confirm: None,
            nv,
            tx_error_count: 0,
        })
    }

    pub fn service_id(&self) -> ServiceId {
        self.service
    }

    pub fn state(&self) -> NmState {
        self.state
    }

    pub fn wake_reasons(&self) -> WakeReason {
        self.wake_reasons
    }

    pub fn network_requested(&self) -> bool {
        self.network_requested
    }

    pub fn tx_error_count(&self) -> u32 {
        self.tx_error_count
    }

    /// The backing history store.
    pub fn nv(&self) -> &N {
        &self.nv
    }

    /// Opaque user bytes carried in every outgoing PDU.
    pub fn set_user_data(&mut self, data: [u8; 6]) {
        self.user_data = data;
    }

    /// Asks all nodes (including this one) to re-enter REPEAT_MESSAGE.
    pub fn set_repeat_request(&mut self, request: bool) {
        self.repeat_request = request;
    }

    pub fn set_wake_reason(&mut self, reason: WakeReason) {
        self.wake_reasons |= reason;
    }

    pub fn clear_wake_reason(&mut self, reason: WakeReason) {
        self.wake_reasons &= !reason;
    }

    /// Application wants the bus kept awake.
    pub fn request_network(&mut self, host: &ServiceHost) {
        self.network_requested = true;
        host.set_event(self.service, EV_NET_REQUEST);
    }

    /// Application no longer needs the bus.
    pub fn release_network(&mut self, host: &ServiceHost) {
        self.network_requested = false;
        host.set_event(self.service, EV_NET_RELEASE);
    }

    /// Dispatch predicate: frames in the NM identifier range, except our own.
    pub fn accepts_frame(&self, frame: &Frame) -> bool {
        frame.channel == self.config.channel
            && !frame.is_remote
            && frame.id & !0xFF == self.config.base_id
            && frame.id != self.config.base_id + self.config.node_id as CanId
    }

    /// Interrupt-side entry: queues a received NM frame.
    pub fn on_frame(&mut self, frame: Frame, host: &ServiceHost) {
        if !self.rx_fifo.push(frame) {
            warn!(
                channel = self.config.channel,
                "nm rx queue overflow, clearing {} frames",
                self.rx_fifo.len()
            );
            self.rx_fifo.clear();
        }
        host.set_event(self.service, EV_RX_PDU);
    }

    /// Interrupt-side entry: the driver confirmed transmission of `id`.
    pub fn on_tx_confirm(&mut self, id: CanId, host: &ServiceHost) -> bool {
        if self.awaiting_confirm == Some(id) {
            self.awaiting_confirm = None;
            host.set_event(self.service, EV_TX_CONFIRM);
            true
        } else {
            false
        }
    }

    /// Service handler.
    pub fn service(
        &mut self,
        host: &ServiceHost,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<()> {
        if host.check_clear_event(self.service, EventMask::TRIGGER_SHUTDOWN) {
            self.stop_all_timers(timers);
            self.enter(NmState::PowerOff, timers, driver)?;
            host.terminate(self.service);
            return Ok(());
        }

        if host.check_clear_event(self.service, EventMask::INIT | EventMask::RE_INIT) {
            self.boot(timers, driver)?;
        }

        if host.check_clear_event(self.service, EV_TX_CONFIRM) {
            timers.stop(self.t_ack);
            self.restart_bus_supervision(timers);
        }

        if host.check_clear_event(self.service, EV_TIMER_ACK) {
            self.tx_error_count += 1;
            self.awaiting_confirm = None;
            warn!(
                channel = self.config.channel,
                errors = self.tx_error_count,
                "nm pdu transmission not confirmed"
            );
        }

        if host.check_clear_event(self.service, EV_RX_PDU) {
            while let Some(frame) = self.rx_fifo.pop() {
                self.handle_rx_pdu(&frame, timers, driver)?;
            }
        }

        if host.check_clear_event(self.service, EV_NET_REQUEST) {
            self.dispatch(NmEvent::Start, timers, driver)?;
        }

        if host.check_clear_event(self.service, EV_NET_RELEASE) {
            self.dispatch(NmEvent::Release, timers, driver)?;
        }

        if host.check_clear_event(self.service, EV_TIMER_CYCLE) {
            if matches!(self.state, NmState::RepeatMessage | NmState::Normal) {
                self.send_pdu(timers, driver)?;
            }
        }

        if host.check_clear_event(self.service, EV_TIMER_REPEAT) {
            self.dispatch(NmEvent::RepeatTimeout, timers, driver)?;
        }

        if host.check_clear_event(self.service, EV_TIMER_NM_TIMEOUT) {
            // Nobody (including us) produced NM traffic for a whole window.
            warn!(channel = self.config.channel, state = ?self.state, "nm message timeout");
            if matches!(self.state, NmState::RepeatMessage | NmState::Normal) {
                timers.start(self.t_nm_timeout, self.config.nm_timeout_ms, 0);
            }
        }

        if host.check_clear_event(self.service, EV_TIMER_WAIT_SLEEP) {
            match self.state {
                NmState::ReadySleep => self.dispatch(NmEvent::PrepareSleep, timers, driver)?,
                NmState::PrepareSleep => self.dispatch(NmEvent::GoToSleep, timers, driver)?,
                _ => {}
            }
        }

        Ok(())
    }

    /// Power-up: read the persisted state once, resume the sleep handshake
    /// if the reset interrupted it, otherwise start out asleep.
    fn boot(&mut self, timers: &mut TimerList, driver: &mut dyn CanDriver) -> Result<()> {
        let resumed = self
            .nv
            .load()
            .and_then(NmState::from_nv)
            .filter(|&s| s == NmState::PrepareSleep);
        match resumed {
            Some(state) => {
                info!(channel = self.config.channel, "resuming sleep handshake after reset");
                self.enter(state, timers, driver)
            }
            None => self.dispatch(NmEvent::PowerOn, timers, driver),
        }
    }

    fn handle_rx_pdu(
        &mut self,
        frame: &Frame,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<()> {
        let Some(pdu) = NmPdu::decode(&frame.data) else {
            warn!(channel = self.config.channel, "short nm pdu rejected");
            return Ok(());
        };
        trace!(
            channel = self.config.channel,
            node = pdu.node_id,
            control = pdu.control.bits(),
            "nm pdu received"
        );
        self.restart_bus_supervision(timers);

        if self.state == NmState::Sleep {
            self.wake_reasons |= WakeReason::REMOTE;
        }
        if pdu.control.contains(NmControlBits::REPEAT_MESSAGE_REQUEST) {
            self.dispatch(NmEvent::KeepRepeat, timers, driver)?;
        }
        match self.state {
            // Traffic wakes a sleeping node and interrupts the handshake.
            NmState::Sleep | NmState::PrepareSleep => {
                self.dispatch(NmEvent::Start, timers, driver)?;
            }
            // Peers still talking: extend the quiet period before sleeping.
            NmState::ReadySleep => {
                timers.stop(self.t_wait_sleep);
                timers.start(self.t_wait_sleep, self.config.wait_sleep_ms, 0);
            }
            _ => {}
        }
        Ok(())
    }

    /// Evaluates the transition table for `event` in the current state.
    /// Events with no entry for the current state are ignored.
    fn dispatch(
        &mut self,
        event: NmEvent,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<()> {
        let next = match (self.state, event) {
            (NmState::PowerOff, NmEvent::PowerOn) => Some(NmState::Sleep),
            (NmState::Sleep, NmEvent::Start) => {
                if self.wake_reasons.is_empty() {
                    trace!(channel = self.config.channel, "start without wake reason ignored");
                    None
                } else {
                    Some(NmState::RepeatMessage)
                }
            }
            (NmState::RepeatMessage, NmEvent::RepeatTimeout) => {
                if self.network_requested {
                    Some(NmState::Normal)
                } else {
                    Some(NmState::ReadySleep)
                }
            }
            (NmState::Normal, NmEvent::Release) => Some(NmState::ReadySleep),
            (NmState::Normal, NmEvent::KeepRepeat) => Some(NmState::RepeatMessage),
            (NmState::ReadySleep, NmEvent::KeepRepeat) => Some(NmState::RepeatMessage),
            (NmState::ReadySleep, NmEvent::Start) => Some(NmState::Normal),
            (NmState::ReadySleep, NmEvent::PrepareSleep) => Some(NmState::PrepareSleep),
            (NmState::PrepareSleep, NmEvent::Start) => Some(NmState::RepeatMessage),
            (NmState::PrepareSleep, NmEvent::GoToSleep) => Some(NmState::Sleep),
            _ => None,
        };
        match next {
            Some(next) if next != self.state => self.enter(next, timers, driver),
            _ => Ok(()),
        }
    }

    /// Commits a transition: persist, log, run the entry actions.
    fn enter(
        &mut self,
        next: NmState,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<()> {
        info!(channel = self.config.channel, from = ?self.state, to = ?next, "nm transition");
        self.state = next;
        self.nv.store(next.to_nv());

        match next {
            NmState::RepeatMessage => {
                timers.stop(self.t_wait_sleep);
                timers.stop(self.t_repeat);
                timers.start(self.t_repeat, self.config.repeat_ms, 0);
                self.restart_bus_supervision(timers);
                if !timers.is_running(self.t_cycle) {
                    timers.start(self.t_cycle, self.config.cycle_ms, self.config.cycle_ms);
                    // First PDU goes out immediately, the cycle paces the rest.
                    self.send_pdu(timers, driver)?;
                }
            }
            NmState::Normal => {
                timers.stop(self.t_repeat);
                timers.stop(self.t_wait_sleep);
            }
            NmState::ReadySleep => {
                timers.stop(self.t_cycle);
                timers.stop(self.t_repeat);
                timers.stop(self.t_wait_sleep);
                timers.start(self.t_wait_sleep, self.config.wait_sleep_ms, 0);
            }
            NmState::PrepareSleep => {
                timers.stop(self.t_nm_timeout);
                timers.stop(self.t_wait_sleep);
                timers.start(self.t_wait_sleep, self.config.wait_sleep_ms, 0);
            }
            NmState::Sleep | NmState::PowerOff => {
                self.stop_all_timers(timers);
                self.wake_reasons = WakeReason::empty();
                self.repeat_request = false;
                debug!(channel = self.config.channel, "bus communication stopped");
            }
        }
        Ok(())
    }

    fn restart_bus_supervision(&mut self, timers: &mut TimerList) {
        if matches!(
            self.state,
            NmState::RepeatMessage | NmState::Normal | NmState::ReadySleep
        ) {
            timers.stop(self.t_nm_timeout);
            timers.start(self.t_nm_timeout, self.config.nm_timeout_ms, 0);
        }
    }

    fn stop_all_timers(&mut self, timers: &mut TimerList) {
        timers.stop(self.t_cycle);
        timers.stop(self.t_ack);
        timers.stop(self.t_repeat);
        timers.stop(self.t_nm_timeout);
        timers.stop(self.t_wait_sleep);
        self.awaiting_confirm = None;
    }

    fn send_pdu(&mut self, timers: &mut TimerList, driver: &mut dyn CanDriver) -> Result<()> {
        let mut control = NmControlBits::empty();
        if self.repeat_request {
            control |= NmControlBits::REPEAT_MESSAGE_REQUEST;
        }
        if self.wake_reasons.contains(WakeReason::LOCAL) {
            control |= NmControlBits::ACTIVE_WAKEUP;
        }
        if self.config.partial_network {
            control |= NmControlBits::PARTIAL_NETWORK;
        }
        if self.config.coordinator_sleep {
            control |= NmControlBits::COORDINATOR_SLEEP;
        }
        let pdu = NmPdu {
            node_id: self.config.node_id,
            control,
            user_data: self.user_data,
        };
        let frame = Frame {
            channel: self.config.channel,
            id: self.config.base_id + self.config.node_id as CanId,
            data: pdu.encode().to_vec(),
            ..Default::default()
        };
        trace!(channel = self.config.channel, control = control.bits(), "nm pdu sent");
        self.awaiting_confirm = Some(frame.id);
        driver.send_message(&frame)?;
        timers.stop(self.t_ack);
        timers.start(self.t_ack, self.config.ack_timeout_ms, 0);
        Ok(())
    }
}
