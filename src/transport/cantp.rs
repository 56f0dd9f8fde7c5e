//! ISO 15765-2 transport protocol state machine (server side, normal-fixed
//! addressing).
//!
//! One [`CanTp`] instance serves one logical CAN channel. Frames arrive
//! through a bounded FIFO filled from interrupt context; all protocol work
//! happens in the service handler. Multi-step transfers never block: every
//! wait (flow control, consecutive frame, separation time) is a timer armed
//! through the shared [`TimerList`], and expiry aborts the transfer back to
//! READY with no retry at this layer.

use tracing::{debug, trace, warn};

use crate::driver::CanDriver;
use crate::error::{Result, StackError};
use crate::queue::Fifo;
use crate::sched::{EventMask, ServiceHost, ServiceId, TimerId, TimerList};
use crate::types::{CanId, Config, Frame};

// PCI frame types (high nibble of the first payload byte)
const PCI_SINGLE_FRAME: u8 = 0x00;
const PCI_FIRST_FRAME: u8 = 0x10;
const PCI_CONSECUTIVE_FRAME: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

// Flow status values carried in a FlowControl frame
const FC_STATUS_CONTINUE: u8 = 0x00;
const FC_STATUS_WAIT: u8 = 0x01;
const FC_STATUS_OVERFLOW: u8 = 0x02;

/// Payload bytes of a SingleFrame under normal-fixed addressing.
pub const SINGLE_FRAME_MAX_LEN: usize = 7;
/// Payload bytes carried by a FirstFrame.
const FIRST_FRAME_DATA_LEN: usize = 6;
/// Payload bytes carried by a ConsecutiveFrame.
const CONSECUTIVE_FRAME_DATA_LEN: usize = 7;
/// Upper bound of the 12-bit FirstFrame length field.
const FF_LENGTH_MAX: usize = 0x0FFF;

// Normal-fixed addressing: 29-bit ID 0x18DAttss (physical) / 0x18DBttss
// (functional), tt = target address, ss = source address.
const NORMAL_FIXED_PHYS_PREFIX: u32 = 0x18DA_0000;
const NORMAL_FIXED_FUNC_PREFIX: u32 = 0x18DB_0000;
const NORMAL_FIXED_PREFIX_MASK: u32 = 0x1FFF_0000;

// Service events
const EV_RX_FRAME: EventMask = EventMask::user(0);
const EV_TX_REQUEST: EventMask = EventMask::user(1);
const EV_TX_CONFIRM: EventMask = EventMask::user(2);
/// N_As / N_Ar: own frame transmission timed out.
const EV_TIMER_TRANS: EventMask = EventMask::user(3);
/// N_Bs: FlowControl from the peer overdue.
const EV_TIMER_FC: EventMask = EventMask::user(4);
/// N_Cr: ConsecutiveFrame from the peer overdue.
const EV_TIMER_CF: EventMask = EventMask::user(5);
/// Separation-time gap elapsed; next ConsecutiveFrame may go out.
const EV_TIMER_STMIN: EventMask = EventMask::user(6);

/// Builds a normal-fixed 29-bit identifier.
pub fn encode_can_id(functional: bool, target: u8, source: u8) -> CanId {
    let prefix = if functional {
        NORMAL_FIXED_FUNC_PREFIX
    } else {
        NORMAL_FIXED_PHYS_PREFIX
    };
    prefix | (target as u32) << 8 | source as u32
}

/// Splits a normal-fixed identifier into (functional, target, source).
pub fn decode_can_id(id: CanId) -> Option<(bool, u8, u8)> {
    let functional = match id & NORMAL_FIXED_PREFIX_MASK {
        NORMAL_FIXED_PHYS_PREFIX => false,
        NORMAL_FIXED_FUNC_PREFIX => true,
        _ => return None,
    };
    Some((functional, (id >> 8) as u8, id as u8))
}

/// Converts a wire SeparationTimeMinimum byte to the 1 ms timer resolution.
///
/// 0x00-0x7F are milliseconds; 0xF1-0xF9 (100-900 us) round up to 1 ms;
/// reserved values fall back to the maximum of 127 ms per ISO 15765-2.
fn st_min_to_ms(raw: u8) -> u32 {
    match raw {
        0x00..=0x7F => raw as u32,
        0xF1..=0xF9 => 1,
        _ => 0x7F,
    }
}

/// ISO-TP N-timer windows (in milliseconds)
#[derive(Debug, Clone)]
pub struct CanTpTiming {
    /// N_As/N_Ar: transmission of an own frame must be confirmed within this.
    pub n_as: u32,
    /// N_Bs: FlowControl wait after a FirstFrame.
    pub n_bs: u32,
    /// N_Cr: ConsecutiveFrame wait during reassembly.
    pub n_cr: u32,
}

impl Default for CanTpTiming {
    fn default() -> Self {
        Self {
            n_as: 1000,
            n_bs: 1000,
            n_cr: 1000,
        }
    }
}

/// CAN TP channel configuration
#[derive(Debug, Clone)]
pub struct CanTpConfig {
    pub channel: u8,
    /// Own physical address (source of everything this instance sends).
    pub physical_address: u8,
    /// Functional address this instance additionally listens on.
    pub functional_address: u8,
    /// BlockSize advertised in outgoing FlowControl frames (0 = unlimited).
    pub block_size: u8,
    /// SeparationTimeMinimum advertised in outgoing FlowControl frames.
    pub st_min: u8,
    /// Largest reassembled message accepted or sent.
    pub max_message_len: usize,
    pub rx_queue_depth: usize,
    pub timing: CanTpTiming,
    pub use_padding: bool,
    pub padding_value: u8,
}

impl Default for CanTpConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            physical_address: 0x10,
            functional_address: 0x33,
            block_size: 0,
            st_min: 0,
            max_message_len: 1344,
            rx_queue_depth: 8,
            timing: CanTpTiming::default(),
            use_padding: false,
            padding_value: 0x00,
        }
    }
}

impl Config for CanTpConfig {
    fn validate(&self) -> Result<()> {
        if self.max_message_len <= SINGLE_FRAME_MAX_LEN || self.max_message_len > FF_LENGTH_MAX {
            return Err(StackError::InvalidParameter);
        }
        if self.rx_queue_depth == 0 || self.physical_address == self.functional_address {
            return Err(StackError::InvalidParameter);
        }
        Ok(())
    }
}

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanTpState {
    Init,
    Ready,
    Recv,
    Send,
}

/// What the last transmitted frame was; drives the confirm handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxPhase {
    None,
    SingleFrame,
    FirstFrame,
    Consecutive,
    FlowControl,
}

/// Reassembled (or to-be-segmented) diagnostic message buffer.
///
/// Invariant: `remaining() == length - rw_idx` at all observation points,
/// and `is_finished()` holds exactly when the cursor has consumed or
/// produced all `length` bytes.
#[derive(Debug, Default)]
struct PduBuffer {
    source: u8,
    target: u8,
    functional: bool,
    data: Vec<u8>,
    length: usize,
    rw_idx: usize,
    finished: bool,
    rx_multi: bool,
    tx_multi: bool,
}

impl PduBuffer {
    fn reset(&mut self) {
        self.source = 0;
        self.target = 0;
        self.functional = false;
        self.data.clear();
        self.length = 0;
        self.rw_idx = 0;
        self.finished = false;
        self.rx_multi = false;
        self.tx_multi = false;
    }

    fn remaining(&self) -> usize {
        self.length - self.rw_idx
    }
}

/// Flow-control parameters negotiated with the peer for the current send.
#[derive(Debug, Default, Clone, Copy)]
struct FlowCtrlStatus {
    block_size: u8,
    st_min_ms: u32,
    /// Consecutive frames left before the next FlowControl is required
    /// (meaningless when `block_size == 0`).
    blocks_left: u8,
}

/// A queued transmit request from the layer above.
#[derive(Debug)]
struct TxRequest {
    target: u8,
    payload: Vec<u8>,
}

/// Complete protocol data unit handed to the diagnostic layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpMessage {
    pub channel: u8,
    pub source: u8,
    pub target: u8,
    pub functional: bool,
    pub data: Vec<u8>,
}

/// One CAN transport protocol channel.
pub struct CanTp {
    config: CanTpConfig,
    service: ServiceId,
    state: CanTpState,
    pdu: PduBuffer,
    /// Next expected (rx) or next to send (tx) sequence number, mod 16.
    seq: u8,
    /// ConsecutiveFrames received since the last FlowControl we sent.
    rx_block_count: u8,
    fc: FlowCtrlStatus,
    tx_phase: TxPhase,
    awaiting_confirm: Option<CanId>,
    rx_fifo: Fifo<Frame>,
    tx_requests: Fifo<TxRequest>,
    t_trans: TimerId,
    t_fc: TimerId,
    t_cf: TimerId,
    t_stmin: TimerId,
}

impl CanTp {
    pub fn new(
        config: CanTpConfig,
        host: &mut ServiceHost,
        timers: &mut TimerList,
    ) -> Result<Self> {
        config.validate()?;
        let service = host.register();
        let rx_fifo = Fifo::new(config.rx_queue_depth, false);
        Ok(Self {
            t_trans: timers.create(service, EV_TIMER_TRANS),
            t_fc: timers.create(service, EV_TIMER_FC),
            t_cf: timers.create(service, EV_TIMER_CF),
            t_stmin: timers.create(service, EV_TIMER_STMIN),
            config,
            service,
            state: CanTpState::Init,
            pdu: PduBuffer::default(),
            seq: 0,
            rx_block_count: 0,
            fc: FlowCtrlStatus::default(),
            tx_phase: TxPhase::None,
            awaiting_confirm: None,
            rx_fifo,
            tx_requests: Fifo::new(4, false),
        })
    }

    pub fn service_id(&self) -> ServiceId {
        self.service
    }

    pub fn state(&self) -> CanTpState {
        self.state
    }

    pub fn channel(&self) -> u8 {
        self.config.channel
    }

    pub fn is_rx_multi_frame(&self) -> bool {
        self.pdu.rx_multi
    }

    pub fn is_tx_multi_frame(&self) -> bool {
        self.pdu.tx_multi
    }

    /// True once the most recent transfer ran to completion. Cleared when a
    /// new transfer starts or the channel aborts.
    pub fn is_finished(&self) -> bool {
        self.pdu.finished
    }

    /// True if any of the instance's deadline timers is armed.
    pub fn has_armed_timers(&self, timers: &TimerList) -> bool {
        timers.is_running(self.t_trans)
            || timers.is_running(self.t_fc)
            || timers.is_running(self.t_cf)
            || timers.is_running(self.t_stmin)
    }

    /// Message-ID dispatch predicate: does this frame belong to this channel?
    pub fn accepts_frame(&self, frame: &Frame) -> bool {
        if frame.channel != self.config.channel || !frame.is_extended || frame.is_remote {
            return false;
        }
        match decode_can_id(frame.id) {
            Some((false, target, _)) => target == self.config.physical_address,
            Some((true, target, _)) => target == self.config.functional_address,
            None => false,
        }
    }

    /// Interrupt-side entry: queues a received frame and marks the service
    /// runnable.
    ///
    /// On overflow the whole queue is cleared before the new frame is kept,
    /// trading data loss for forward progress in interrupt context.
    pub fn on_frame(&mut self, frame: Frame, host: &ServiceHost) {
        if !self.rx_fifo.push(frame) {
            warn!(
                channel = self.config.channel,
                "rx frame queue overflow, clearing {} frames",
                self.rx_fifo.len()
            );
            self.rx_fifo.clear();
            // Cannot fail on an empty queue; drop the pushed frame above.
        }
        host.set_event(self.service, EV_RX_FRAME);
    }

    /// Interrupt-side entry: the driver confirmed transmission of `id`.
    /// Returns whether the confirmation belonged to this instance.
    pub fn on_tx_confirm(&mut self, id: CanId, host: &ServiceHost) -> bool {
        if self.awaiting_confirm == Some(id) {
            self.awaiting_confirm = None;
            host.set_event(self.service, EV_TX_CONFIRM);
            true
        } else {
            false
        }
    }

    /// Queues a message for segmentation and transmission to `target`.
    pub fn request_send(
        &mut self,
        target: u8,
        payload: &[u8],
        host: &ServiceHost,
    ) -> Result<()> {
        if self.state == CanTpState::Init {
            return Err(StackError::NotInitialized);
        }
        if payload.is_empty() || payload.len() > self.config.max_message_len {
            return Err(StackError::InvalidParameter);
        }
        let ok = self.tx_requests.push(TxRequest {
            target,
            payload: payload.to_vec(),
        });
        if !ok {
            return Err(StackError::QueueFull);
        }
        host.set_event(self.service, EV_TX_REQUEST);
        Ok(())
    }

    /// Aborts any in-progress transfer: all timers stopped, multi-frame
    /// flags cleared, state back to READY. No retry at this layer.
    pub fn abort(&mut self, timers: &mut TimerList) {
        if self.pdu.rx_multi || self.pdu.tx_multi || self.state != CanTpState::Ready {
            debug!(channel = self.config.channel, state = ?self.state, "aborting transfer");
        }
        timers.stop(self.t_trans);
        timers.stop(self.t_fc);
        timers.stop(self.t_cf);
        timers.stop(self.t_stmin);
        self.pdu.reset();
        self.seq = 0;
        self.rx_block_count = 0;
        self.tx_phase = TxPhase::None;
        self.awaiting_confirm = None;
        if self.state != CanTpState::Init {
            self.state = CanTpState::Ready;
        }
    }

    /// Service handler. Processes pending events and returns any messages
    /// whose reassembly completed.
    pub fn service(
        &mut self,
        host: &ServiceHost,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<Vec<TpMessage>> {
        let mut completed = Vec::new();

        if host.check_clear_event(self.service, EventMask::TRIGGER_SHUTDOWN) {
            self.abort(timers);
            self.state = CanTpState::Init;
            host.terminate(self.service);
            return Ok(completed);
        }

        if host.check_clear_event(self.service, EventMask::INIT | EventMask::RE_INIT) {
            self.abort(timers);
            self.rx_fifo.clear();
            self.tx_requests.clear();
            self.state = CanTpState::Ready;
            debug!(channel = self.config.channel, "transport channel ready");
        }

        // Deadline expiries: every N-timer is a hard abort, no retry.
        if host.check_clear_event(self.service, EV_TIMER_TRANS) {
            warn!(channel = self.config.channel, "N_As/N_Ar timeout");
            self.abort(timers);
        }
        if host.check_clear_event(self.service, EV_TIMER_FC) {
            warn!(channel = self.config.channel, "N_Bs timeout waiting for flow control");
            self.abort(timers);
        }
        if host.check_clear_event(self.service, EV_TIMER_CF) {
            warn!(channel = self.config.channel, "N_Cr timeout waiting for consecutive frame");
            self.abort(timers);
        }

        if host.check_clear_event(self.service, EV_TX_CONFIRM) {
            self.handle_tx_confirm(host, timers)?;
        }

        if host.check_clear_event(self.service, EV_TIMER_STMIN)
            && self.state == CanTpState::Send
            && self.tx_phase == TxPhase::None
        {
            self.send_consecutive_frame(timers, driver)?;
        }

        if host.check_clear_event(self.service, EV_RX_FRAME) {
            while let Some(frame) = self.rx_fifo.pop() {
                if let Some(msg) = self.handle_rx_frame(&frame, timers, driver)? {
                    completed.push(msg);
                }
            }
        }

        host.check_clear_event(self.service, EV_TX_REQUEST);
        if self.state == CanTpState::Ready && !self.tx_requests.is_empty() {
            self.kick_tx(timers, driver)?;
        }

        Ok(completed)
    }

    /// Starts the next queued transmit request. Caller checked READY.
    fn kick_tx(&mut self, timers: &mut TimerList, driver: &mut dyn CanDriver) -> Result<()> {
        let Some(req) = self.tx_requests.pop() else {
            return Ok(());
        };

        self.pdu.reset();
        self.pdu.source = self.config.physical_address;
        self.pdu.target = req.target;
        self.pdu.length = req.payload.len();
        self.pdu.data = req.payload;
        self.state = CanTpState::Send;

        if self.pdu.length <= SINGLE_FRAME_MAX_LEN {
            trace!(
                channel = self.config.channel,
                len = self.pdu.length,
                "sending single frame"
            );
            let mut payload = vec![PCI_SINGLE_FRAME | self.pdu.length as u8];
            payload.extend_from_slice(&self.pdu.data);
            self.pdu.rw_idx = self.pdu.length;
            self.tx_phase = TxPhase::SingleFrame;
            self.send_data_frame(req.target, payload, timers, driver)?;
        } else {
            trace!(
                channel = self.config.channel,
                len = self.pdu.length,
                "sending first frame"
            );
            let mut payload = vec![
                PCI_FIRST_FRAME | ((self.pdu.length >> 8) as u8 & 0x0F),
                self.pdu.length as u8,
            ];
            payload.extend_from_slice(&self.pdu.data[..FIRST_FRAME_DATA_LEN]);
            self.pdu.rw_idx = FIRST_FRAME_DATA_LEN;
            self.pdu.tx_multi = true;
            self.seq = 1;
            self.tx_phase = TxPhase::FirstFrame;
            self.send_data_frame(req.target, payload, timers, driver)?;
            // Peer must answer with a FlowControl within N_Bs.
            timers.start(self.t_fc, self.config.timing.n_bs, 0);
        }
        Ok(())
    }

    fn handle_tx_confirm(&mut self, host: &ServiceHost, timers: &mut TimerList) -> Result<()> {
        timers.stop(self.t_trans);
        let phase = self.tx_phase;
        self.tx_phase = TxPhase::None;
        match phase {
            TxPhase::SingleFrame => self.finish_tx(host, timers),
            TxPhase::FirstFrame => {
                // Nothing more to do until the peer's FlowControl (N_Bs runs).
            }
            TxPhase::Consecutive => {
                if self.pdu.remaining() == 0 {
                    self.finish_tx(host, timers);
                } else if self.fc.block_size != 0 && self.fc.blocks_left == 0 {
                    // Block exhausted: wait for the next FlowControl.
                    timers.start(self.t_fc, self.config.timing.n_bs, 0);
                } else if self.fc.st_min_ms == 0 {
                    host.set_event(self.service, EV_TIMER_STMIN);
                } else {
                    timers.start(self.t_stmin, self.fc.st_min_ms, 0);
                }
            }
            TxPhase::FlowControl | TxPhase::None => {}
        }
        Ok(())
    }

    fn finish_tx(&mut self, host: &ServiceHost, timers: &mut TimerList) {
        debug!(
            channel = self.config.channel,
            len = self.pdu.length,
            "transmission finished"
        );
        self.pdu.rw_idx = self.pdu.length;
        self.pdu.finished = true;
        self.pdu.tx_multi = false;
        timers.stop(self.t_trans);
        timers.stop(self.t_fc);
        timers.stop(self.t_stmin);
        self.state = CanTpState::Ready;
        if !self.tx_requests.is_empty() {
            host.set_event(self.service, EV_TX_REQUEST);
        }
    }

    fn send_consecutive_frame(
        &mut self,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<()> {
        let chunk = self.pdu.remaining().min(CONSECUTIVE_FRAME_DATA_LEN);
        let mut payload = vec![PCI_CONSECUTIVE_FRAME | self.seq];
        payload.extend_from_slice(&self.pdu.data[self.pdu.rw_idx..self.pdu.rw_idx + chunk]);
        self.pdu.rw_idx += chunk;
        self.seq = (self.seq + 1) & 0x0F;
        if self.fc.block_size != 0 {
            self.fc.blocks_left -= 1;
        }
        self.tx_phase = TxPhase::Consecutive;
        let target = self.pdu.target;
        self.send_data_frame(target, payload, timers, driver)
    }

    /// Transmits one frame and arms the N_As/N_Ar supervision timer.
    fn send_data_frame(
        &mut self,
        target: u8,
        mut payload: Vec<u8>,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<()> {
        if self.config.use_padding {
            while payload.len() < 8 {
                payload.push(self.config.padding_value);
            }
        }
        let frame = Frame {
            channel: self.config.channel,
            id: encode_can_id(false, target, self.config.physical_address),
            data: payload,
            timestamp: 0,
            is_extended: true,
            is_remote: false,
            is_fd: false,
        };
        self.awaiting_confirm = Some(frame.id);
        driver.send_message(&frame)?;
        timers.start(self.t_trans, self.config.timing.n_as, 0);
        Ok(())
    }

    fn handle_rx_frame(
        &mut self,
        frame: &Frame,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<Option<TpMessage>> {
        let Some((functional, target, source)) = decode_can_id(frame.id) else {
            trace!(id = frame.id, "frame without normal-fixed addressing, dropped");
            return Ok(None);
        };
        let Some(&pci) = frame.data.first() else {
            warn!(channel = self.config.channel, "empty frame payload");
            return Ok(None);
        };

        match pci & 0xF0 {
            PCI_SINGLE_FRAME => self.handle_single_frame(frame, functional, target, source, timers),
            PCI_FIRST_FRAME => {
                self.handle_first_frame(frame, functional, target, source, timers, driver)
            }
            PCI_CONSECUTIVE_FRAME => self.handle_consecutive_frame(frame, timers, driver),
            PCI_FLOW_CONTROL => {
                self.handle_flow_control(frame, timers, driver)?;
                Ok(None)
            }
            _ => {
                warn!(
                    channel = self.config.channel,
                    pci = format_args!("{pci:#04x}"),
                    "unknown PCI type, frame rejected"
                );
                Ok(None)
            }
        }
    }

    fn handle_single_frame(
        &mut self,
        frame: &Frame,
        functional: bool,
        target: u8,
        source: u8,
        timers: &mut TimerList,
    ) -> Result<Option<TpMessage>> {
        let len = (frame.data[0] & 0x0F) as usize;
        if len == 0 || len > SINGLE_FRAME_MAX_LEN || len > frame.data.len() - 1 {
            warn!(
                channel = self.config.channel,
                len, "invalid single frame length, frame rejected"
            );
            return Ok(None);
        }
        if self.state != CanTpState::Ready {
            // A new transfer terminates whatever was in progress.
            warn!(channel = self.config.channel, "single frame during active transfer");
            self.abort(timers);
        }
        // Single frames complete in one reassembly step.
        self.pdu.reset();
        self.pdu.source = source;
        self.pdu.target = target;
        self.pdu.functional = functional;
        self.pdu.length = len;
        self.pdu.rw_idx = len;
        self.pdu.finished = true;
        trace!(channel = self.config.channel, len, "single frame received");
        Ok(Some(TpMessage {
            channel: self.config.channel,
            source,
            target,
            functional,
            data: frame.data[1..=len].to_vec(),
        }))
    }

    fn handle_first_frame(
        &mut self,
        frame: &Frame,
        functional: bool,
        target: u8,
        source: u8,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<Option<TpMessage>> {
        if functional {
            warn!(
                channel = self.config.channel,
                "first frame on functional address rejected"
            );
            return Ok(None);
        }
        if frame.data.len() < 2 + FIRST_FRAME_DATA_LEN {
            warn!(channel = self.config.channel, "truncated first frame rejected");
            return Ok(None);
        }
        let length = ((frame.data[0] as usize & 0x0F) << 8) | frame.data[1] as usize;
        if length <= SINGLE_FRAME_MAX_LEN {
            // Would have fit a single frame: protocol violation, ignored.
            // Overflow is reserved for genuine buffer exhaustion.
            warn!(
                channel = self.config.channel,
                length, "first frame length fits a single frame, rejected"
            );
            return Ok(None);
        }
        if self.state != CanTpState::Ready {
            warn!(channel = self.config.channel, "first frame during active transfer");
            self.abort(timers);
        }
        if length > self.config.max_message_len {
            warn!(
                channel = self.config.channel,
                length, "first frame exceeds receive capacity, sending overflow"
            );
            self.send_flow_control(source, FC_STATUS_OVERFLOW, timers, driver)?;
            return Ok(None);
        }

        self.pdu.reset();
        self.pdu.source = source;
        self.pdu.target = target;
        self.pdu.functional = false;
        self.pdu.length = length;
        self.pdu.data.extend_from_slice(&frame.data[2..2 + FIRST_FRAME_DATA_LEN]);
        self.pdu.rw_idx = FIRST_FRAME_DATA_LEN;
        self.pdu.rx_multi = true;
        self.seq = 1;
        self.rx_block_count = 0;
        self.state = CanTpState::Recv;
        debug!(channel = self.config.channel, length, "multi-frame reception started");

        self.send_flow_control(source, FC_STATUS_CONTINUE, timers, driver)?;
        timers.start(self.t_cf, self.config.timing.n_cr, 0);
        Ok(None)
    }

    fn handle_consecutive_frame(
        &mut self,
        frame: &Frame,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<Option<TpMessage>> {
        if self.state != CanTpState::Recv || !self.pdu.rx_multi {
            warn!(
                channel = self.config.channel,
                "stray consecutive frame, rejected"
            );
            return Ok(None);
        }
        let seq = frame.data[0] & 0x0F;
        if seq != self.seq {
            warn!(
                channel = self.config.channel,
                expected = self.seq,
                got = seq,
                "sequence number mismatch, aborting transfer"
            );
            self.abort(timers);
            return Ok(None);
        }
        timers.stop(self.t_cf);
        let chunk = self.pdu.remaining().min(CONSECUTIVE_FRAME_DATA_LEN);
        if frame.data.len() < 1 + chunk {
            warn!(channel = self.config.channel, "truncated consecutive frame, aborting");
            self.abort(timers);
            return Ok(None);
        }
        self.pdu.data.extend_from_slice(&frame.data[1..1 + chunk]);
        self.pdu.rw_idx += chunk;
        self.seq = (self.seq + 1) & 0x0F;

        if self.pdu.remaining() == 0 {
            self.pdu.finished = true;
            self.pdu.rx_multi = false;
            self.state = CanTpState::Ready;
            debug!(
                channel = self.config.channel,
                len = self.pdu.length,
                "multi-frame reception finished"
            );
            let msg = TpMessage {
                channel: self.config.channel,
                source: self.pdu.source,
                target: self.pdu.target,
                functional: self.pdu.functional,
                data: std::mem::take(&mut self.pdu.data),
            };
            return Ok(Some(msg));
        }

        // More to come: supervise the next frame and refresh the block.
        timers.start(self.t_cf, self.config.timing.n_cr, 0);
        if self.config.block_size != 0 {
            self.rx_block_count += 1;
            if self.rx_block_count == self.config.block_size {
                self.rx_block_count = 0;
                let source = self.pdu.source;
                self.send_flow_control(source, FC_STATUS_CONTINUE, timers, driver)?;
            }
        }
        Ok(None)
    }

    fn handle_flow_control(
        &mut self,
        frame: &Frame,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<()> {
        if self.state != CanTpState::Send || !self.pdu.tx_multi {
            warn!(channel = self.config.channel, "stray flow control, rejected");
            return Ok(());
        }
        if frame.data.len() < 3 {
            warn!(channel = self.config.channel, "truncated flow control, aborting");
            self.abort(timers);
            return Ok(());
        }
        match frame.data[0] & 0x0F {
            FC_STATUS_CONTINUE => {
                timers.stop(self.t_fc);
                self.fc.block_size = frame.data[1];
                self.fc.st_min_ms = st_min_to_ms(frame.data[2]);
                self.fc.blocks_left = frame.data[1];
                trace!(
                    channel = self.config.channel,
                    block_size = self.fc.block_size,
                    st_min_ms = self.fc.st_min_ms,
                    "flow control: continue to send"
                );
                self.send_consecutive_frame(timers, driver)?;
            }
            FC_STATUS_WAIT => {
                trace!(channel = self.config.channel, "flow control: wait");
                timers.stop(self.t_fc);
                timers.start(self.t_fc, self.config.timing.n_bs, 0);
            }
            FC_STATUS_OVERFLOW => {
                warn!(channel = self.config.channel, "flow control: peer overflow, aborting");
                self.abort(timers);
            }
            other => {
                warn!(
                    channel = self.config.channel,
                    status = other,
                    "invalid flow status, aborting"
                );
                self.abort(timers);
            }
        }
        Ok(())
    }

    /// Sends a FlowControl frame advertising this side's receive parameters.
    fn send_flow_control(
        &mut self,
        target: u8,
        status: u8,
        timers: &mut TimerList,
        driver: &mut dyn CanDriver,
    ) -> Result<()> {
        let payload = vec![
            PCI_FLOW_CONTROL | status,
            self.config.block_size,
            self.config.st_min,
        ];
        self.tx_phase = TxPhase::FlowControl;
        self.send_data_frame(target, payload, timers, driver)
    }
}
