//! UDS (ISO 14229-1) diagnostic service dispatcher.
//!
//! Requests arrive as reassembled transport messages; every request that
//! passes basic validation produces either a positive response, a negative
//! response with a specific NRC, or enters asynchronous processing with
//! ResponsePending (NRC 0x78) keep-alives paced by the P2/P2*/P4 timers.
//! A tester never observes a silent hang: the dispatcher either answers or
//! aborts at P4.
//!
//! The dispatcher itself holds no transport handle; it emits [`UdsAction`]
//! values that the stack glue forwards to the transport channel.

use std::collections::HashMap;

use bitflags::bitflags;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, StackError};
use crate::sched::{EventMask, ServiceHost, ServiceId, TimerId, TimerList};
use crate::transport::TpMessage;
use crate::types::Config;

pub const SID_DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
pub const SID_ECU_RESET: u8 = 0x11;
pub const SID_READ_DATA_BY_IDENTIFIER: u8 = 0x22;
pub const SID_SECURITY_ACCESS: u8 = 0x27;
pub const SID_ROUTINE_CONTROL: u8 = 0x31;
pub const SID_TESTER_PRESENT: u8 = 0x3E;

/// Negative response codes used by the dispatcher.
pub mod nrc {
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x11;
    pub const SUB_FUNCTION_NOT_SUPPORTED: u8 = 0x12;
    pub const INCORRECT_MESSAGE_LENGTH: u8 = 0x13;
    pub const BUSY_REPEAT_REQUEST: u8 = 0x21;
    pub const REQUEST_SEQUENCE_ERROR: u8 = 0x24;
    pub const REQUEST_OUT_OF_RANGE: u8 = 0x31;
    pub const SECURITY_ACCESS_DENIED: u8 = 0x33;
    pub const INVALID_KEY: u8 = 0x35;
    pub const EXCEEDED_NUMBER_OF_ATTEMPTS: u8 = 0x36;
    pub const RESPONSE_PENDING: u8 = 0x78;
    pub const SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION: u8 = 0x7F;
}

const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
const SUPPRESS_POS_RSP_BIT: u8 = 0x80;

/// NRCs that a functionally addressed request must not answer.
const FUNCTIONAL_SUPPRESSED_NRCS: [u8; 3] = [
    nrc::SERVICE_NOT_SUPPORTED,
    nrc::SUB_FUNCTION_NOT_SUPPORTED,
    nrc::REQUEST_OUT_OF_RANGE,
];

// Service events
const EV_DONE: EventMask = EventMask::user(0);
const EV_TIMER_RCRP: EventMask = EventMask::user(1);
const EV_TIMER_P4: EventMask = EventMask::user(2);
const EV_TIMER_S3: EventMask = EventMask::user(3);

/// Diagnostic session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdsSession {
    Default,
    Programming,
    Extended,
}

impl UdsSession {
    fn from_sub_function(sub: u8) -> Option<Self> {
        match sub {
            0x01 => Some(UdsSession::Default),
            0x02 => Some(UdsSession::Programming),
            0x03 => Some(UdsSession::Extended),
            _ => None,
        }
    }

    fn sub_function(self) -> u8 {
        match self {
            UdsSession::Default => 0x01,
            UdsSession::Programming => 0x02,
            UdsSession::Extended => 0x03,
        }
    }

    fn mask(self) -> SessionMask {
        match self {
            UdsSession::Default => SessionMask::DEFAULT,
            UdsSession::Programming => SessionMask::PROGRAMMING,
            UdsSession::Extended => SessionMask::EXTENDED,
        }
    }
}

/// Security access state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    Locked,
    Unlocked,
}

impl SecurityLevel {
    fn mask(self) -> SecurityMask {
        match self {
            SecurityLevel::Locked => SecurityMask::LOCKED,
            SecurityLevel::Unlocked => SecurityMask::UNLOCKED,
        }
    }
}

bitflags! {
    /// Sessions a service is allowed in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionMask: u8 {
        const DEFAULT = 1 << 0;
        const PROGRAMMING = 1 << 1;
        const EXTENDED = 1 << 2;
    }
}

bitflags! {
    /// Security states a service is allowed in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecurityMask: u8 {
        const LOCKED = 1 << 0;
        const UNLOCKED = 1 << 1;
    }
}

impl SessionMask {
    const ANY: SessionMask = SessionMask::all();
    const NON_DEFAULT: SessionMask =
        SessionMask::PROGRAMMING.union(SessionMask::EXTENDED);
}

impl SecurityMask {
    const ANY: SecurityMask = SecurityMask::all();
}

/// Static per-service dispatch entry.
struct ServiceDesc {
    sid: u8,
    has_sub_function: bool,
    min_len: usize,
    sessions: SessionMask,
    security: SecurityMask,
}

const SERVICE_TABLE: &[ServiceDesc] = &[
    ServiceDesc {
        sid: SID_DIAGNOSTIC_SESSION_CONTROL,
        has_sub_function: true,
        min_len: 2,
        sessions: SessionMask::ANY,
        security: SecurityMask::ANY,
    },
    ServiceDesc {
        sid: SID_ECU_RESET,
        has_sub_function: true,
        min_len: 2,
        sessions: SessionMask::NON_DEFAULT,
        security: SecurityMask::ANY,
    },
    ServiceDesc {
        sid: SID_READ_DATA_BY_IDENTIFIER,
        has_sub_function: false,
        min_len: 3,
        sessions: SessionMask::ANY,
        security: SecurityMask::ANY,
    },
    ServiceDesc {
        sid: SID_SECURITY_ACCESS,
        has_sub_function: true,
        min_len: 2,
        sessions: SessionMask::NON_DEFAULT,
        security: SecurityMask::ANY,
    },
    ServiceDesc {
        sid: SID_ROUTINE_CONTROL,
        has_sub_function: true,
        min_len: 4,
        sessions: SessionMask::EXTENDED,
        security: SecurityMask::ANY,
    },
    ServiceDesc {
        sid: SID_TESTER_PRESENT,
        has_sub_function: true,
        min_len: 2,
        sessions: SessionMask::ANY,
        security: SecurityMask::ANY,
    },
];

/// Outcome of a routine handler invocation.
pub enum RoutineOutcome {
    /// Finished synchronously; bytes are the routine status record.
    Done(Vec<u8>),
    /// Still running; completion arrives later via `processing_done`.
    Pending,
    /// Rejected with the given NRC.
    Nrc(u8),
}

/// Routine handler: (routine control type, option record) -> outcome.
pub type RoutineHandler = Box<dyn FnMut(u8, &[u8]) -> RoutineOutcome + Send>;

/// What the stack glue must do on the transport channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsAction {
    Send { target: u8, data: Vec<u8> },
    /// P4 elapsed: tear down whatever the transport still has in flight.
    AbortTransport,
}

/// Timing parameters per ISO 14229-2.
#[derive(Debug, Clone)]
pub struct UdsConfig {
    /// Initial response deadline; first RCR-RP goes out here.
    pub p2_ms: u32,
    /// Enhanced deadline between subsequent RCR-RPs.
    pub p2_star_ms: u32,
    /// Absolute bound on one request; expiry aborts unconditionally.
    pub p4_ms: u32,
    /// Non-default session timeout.
    pub s3_ms: u32,
    pub security_attempt_limit: u8,
    /// Seed handed out by SecurityAccess requestSeed.
    pub security_seed: u32,
}

impl Default for UdsConfig {
    fn default() -> Self {
        Self {
            p2_ms: 50,
            p2_star_ms: 5000,
            p4_ms: 90_000,
            s3_ms: 5000,
            security_attempt_limit: 3,
            security_seed: 0x5AA5_1234,
        }
    }
}

impl Config for UdsConfig {
    fn validate(&self) -> Result<()> {
        if self.p2_ms == 0 || self.p2_ms >= self.p2_star_ms || self.p2_star_ms >= self.p4_ms {
            return Err(StackError::InvalidParameter);
        }
        if self.s3_ms == 0 || self.security_attempt_limit == 0 {
            return Err(StackError::InvalidParameter);
        }
        Ok(())
    }
}

/// In-flight request container; its presence is the busy sentinel.
#[derive(Debug, Clone)]
struct InFlight {
    sid: u8,
    source: u8,
    functional: bool,
    suppress_response: bool,
}

/// Per-service handler result before response assembly.
enum Outcome {
    /// Positive response payload (everything after the SID+0x40 byte).
    Positive(Vec<u8>),
    Negative(u8),
    Pending,
}

/// UDS server instance.
pub struct UdsServer {
    config: UdsConfig,
    service: ServiceId,
    session: UdsSession,
    security: SecurityLevel,
    in_flight: Option<InFlight>,
    /// Completion delivered by `processing_done`, consumed in the handler.
    pending_result: Option<std::result::Result<Vec<u8>, u8>>,
    dids: HashMap<u16, Vec<u8>>,
    routines: HashMap<u16, RoutineHandler>,
    pending_seed: Option<u32>,
    failed_key_attempts: u8,
    reset_requested: bool,
    t_rcrp: TimerId,
    t_p4: TimerId,
    t_s3: TimerId,
}

impl UdsServer {
    pub fn new(
        config: UdsConfig,
        host: &mut ServiceHost,
        timers: &mut TimerList,
    ) -> Result<Self> {
        config.validate()?;
        let service = host.register();
        Ok(Self {
            t_rcrp: timers.create(service, EV_TIMER_RCRP),
            t_p4: timers.create(service, EV_TIMER_P4),
            t_s3: timers.create(service, EV_TIMER_S3),
            config,
            service,
            session: UdsSession::Default,
            security: SecurityLevel::Locked,
            in_flight: None,
            pending_result: None,
            dids: HashMap::new(),
            routines: HashMap::new(),
            pending_seed: None,
            failed_key_attempts: 0,
            reset_requested: false,
        })
    }

    pub fn service_id(&self) -> ServiceId {
        self.service
    }

    pub fn session(&self) -> UdsSession {
        self.session
    }

    pub fn security(&self) -> SecurityLevel {
        self.security
    }

    /// True while an asynchronous request is outstanding.
    pub fn is_processing(&self) -> bool {
        self.in_flight.is_some()
    }

    /// True once an EcuReset request was accepted; the host performs the
    /// actual reset.
    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// Registers (or replaces) the data record behind a DID.
    pub fn register_did(&mut self, did: u16, data: Vec<u8>) {
        self.dids.insert(did, data);
    }

    /// Registers (or replaces) a routine handler.
    pub fn register_routine(&mut self, routine_id: u16, handler: RoutineHandler) {
        self.routines.insert(routine_id, handler);
    }

    /// Delivers the completion of an asynchronous service. `Ok` carries the
    /// positive response payload, `Err` the NRC.
    pub fn processing_done(
        &mut self,
        result: std::result::Result<Vec<u8>, u8>,
        host: &ServiceHost,
    ) {
        if self.in_flight.is_none() {
            warn!("completion delivered with no request in flight");
            return;
        }
        self.pending_result = Some(result);
        host.set_event(self.service, EV_DONE);
    }

    /// Request indication from the transport layer.
    pub fn on_request(&mut self, msg: &TpMessage, timers: &mut TimerList) -> Vec<UdsAction> {
        let mut actions = Vec::new();
        let Some(&sid) = msg.data.first() else {
            return actions;
        };
        trace!(sid = format_args!("{sid:#04x}"), len = msg.data.len(), "uds request");

        if self.in_flight.is_some() {
            actions.push(negative(msg.source, sid, nrc::BUSY_REPEAT_REQUEST));
            return actions;
        }

        let Some(desc) = SERVICE_TABLE.iter().find(|d| d.sid == sid) else {
            self.push_negative(&mut actions, msg, sid, nrc::SERVICE_NOT_SUPPORTED);
            return actions;
        };
        if msg.data.len() < desc.min_len {
            self.push_negative(&mut actions, msg, sid, nrc::INCORRECT_MESSAGE_LENGTH);
            return actions;
        }
        if !desc.sessions.contains(self.session.mask()) {
            self.push_negative(
                &mut actions,
                msg,
                sid,
                nrc::SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION,
            );
            return actions;
        }
        if !desc.security.contains(self.security.mask()) {
            self.push_negative(&mut actions, msg, sid, nrc::SECURITY_ACCESS_DENIED);
            return actions;
        }

        let (sub, suppress) = if desc.has_sub_function {
            let raw = msg.data[1];
            (raw & !SUPPRESS_POS_RSP_BIT, raw & SUPPRESS_POS_RSP_BIT != 0)
        } else {
            (0, false)
        };

        self.in_flight = Some(InFlight {
            sid,
            source: msg.source,
            functional: msg.functional,
            suppress_response: suppress,
        });
        // S3 supervises tester inactivity between requests; it does not run
        // while one is being processed.
        timers.stop(self.t_s3);

        let outcome = match sid {
            SID_DIAGNOSTIC_SESSION_CONTROL => self.session_control(sub, timers),
            SID_ECU_RESET => self.ecu_reset(sub),
            SID_READ_DATA_BY_IDENTIFIER => self.read_data_by_identifier(&msg.data[1..]),
            SID_SECURITY_ACCESS => self.security_access(sub, &msg.data[2..]),
            SID_ROUTINE_CONTROL => self.routine_control(sub, &msg.data[2..]),
            SID_TESTER_PRESENT => self.tester_present(sub),
            _ => Outcome::Negative(nrc::SERVICE_NOT_SUPPORTED),
        };

        match outcome {
            Outcome::Positive(payload) => self.complete(Ok(payload), &mut actions, timers),
            Outcome::Negative(code) => self.complete(Err(code), &mut actions, timers),
            Outcome::Pending => {
                debug!(sid = format_args!("{sid:#04x}"), "request entered async processing");
                timers.start(self.t_rcrp, self.config.p2_ms, 0);
                timers.start(self.t_p4, self.config.p4_ms, 0);
            }
        }
        actions
    }

    /// Service handler: async completions and timer-driven behavior.
    pub fn service(&mut self, host: &ServiceHost, timers: &mut TimerList) -> Vec<UdsAction> {
        let mut actions = Vec::new();

        if host.check_clear_event(self.service, EventMask::TRIGGER_SHUTDOWN) {
            self.abort_request(timers);
            timers.stop(self.t_s3);
            host.terminate(self.service);
            return actions;
        }

        if host.check_clear_event(self.service, EventMask::INIT | EventMask::RE_INIT) {
            self.abort_request(timers);
            timers.stop(self.t_s3);
            self.session = UdsSession::Default;
            self.security = SecurityLevel::Locked;
            self.pending_seed = None;
            self.failed_key_attempts = 0;
            self.reset_requested = false;
        }

        if host.check_clear_event(self.service, EV_DONE) {
            if let Some(result) = self.pending_result.take() {
                if self.in_flight.is_some() {
                    timers.stop(self.t_rcrp);
                    timers.stop(self.t_p4);
                    self.complete(result, &mut actions, timers);
                }
            }
        }

        if host.check_clear_event(self.service, EV_TIMER_RCRP) {
            if let Some(req) = &self.in_flight {
                trace!(sid = format_args!("{:#04x}", req.sid), "response pending sent");
                actions.push(negative(req.source, req.sid, nrc::RESPONSE_PENDING));
                if !timers.is_running(self.t_rcrp) {
                    // P2 elapsed; subsequent keep-alives pace at P2*.
                    timers.start(self.t_rcrp, self.config.p2_star_ms, self.config.p2_star_ms);
                }
            }
        }

        if host.check_clear_event(self.service, EV_TIMER_P4) {
            if let Some(req) = self.in_flight.take() {
                warn!(
                    sid = format_args!("{:#04x}", req.sid),
                    "P4 expired, aborting request"
                );
                self.pending_result = None;
                timers.stop(self.t_rcrp);
                actions.push(UdsAction::AbortTransport);
                self.restart_s3(timers);
            }
        }

        if host.check_clear_event(self.service, EV_TIMER_S3) {
            info!("S3 expired, falling back to default session");
            self.session = UdsSession::Default;
            self.security = SecurityLevel::Locked;
            self.pending_seed = None;
        }

        actions
    }

    /// Drops the in-flight request and all of its timers.
    fn abort_request(&mut self, timers: &mut TimerList) {
        self.in_flight = None;
        self.pending_result = None;
        timers.stop(self.t_rcrp);
        timers.stop(self.t_p4);
    }

    /// Completion bookkeeping shared by sync and async paths: response
    /// assembly, in-flight teardown, S3 restart.
    fn complete(
        &mut self,
        result: std::result::Result<Vec<u8>, u8>,
        actions: &mut Vec<UdsAction>,
        timers: &mut TimerList,
    ) {
        let Some(req) = self.in_flight.take() else {
            return;
        };
        match result {
            Ok(payload) => {
                if !req.suppress_response {
                    let mut data = vec![req.sid + POSITIVE_RESPONSE_OFFSET];
                    data.extend_from_slice(&payload);
                    actions.push(UdsAction::Send {
                        target: req.source,
                        data,
                    });
                }
            }
            Err(code) => {
                if !(req.functional && FUNCTIONAL_SUPPRESSED_NRCS.contains(&code)) {
                    actions.push(negative(req.source, req.sid, code));
                }
            }
        }
        self.restart_s3(timers);
    }

    fn restart_s3(&mut self, timers: &mut TimerList) {
        if self.session != UdsSession::Default {
            timers.stop(self.t_s3);
            timers.start(self.t_s3, self.config.s3_ms, 0);
        }
    }

    fn push_negative(
        &self,
        actions: &mut Vec<UdsAction>,
        msg: &TpMessage,
        sid: u8,
        code: u8,
    ) {
        if msg.functional && FUNCTIONAL_SUPPRESSED_NRCS.contains(&code) {
            trace!(
                sid = format_args!("{sid:#04x}"),
                code = format_args!("{code:#04x}"),
                "negative response suppressed for functional request"
            );
            return;
        }
        actions.push(negative(msg.source, sid, code));
    }

    fn session_control(&mut self, sub: u8, timers: &mut TimerList) -> Outcome {
        let Some(session) = UdsSession::from_sub_function(sub) else {
            return Outcome::Negative(nrc::SUB_FUNCTION_NOT_SUPPORTED);
        };
        self.session = session;
        if session == UdsSession::Default {
            timers.stop(self.t_s3);
            self.security = SecurityLevel::Locked;
            self.pending_seed = None;
        }
        info!(session = ?session, "session changed");
        let p2 = self.config.p2_ms as u16;
        let p2_star = (self.config.p2_star_ms / 10) as u16;
        Outcome::Positive(vec![
            session.sub_function(),
            (p2 >> 8) as u8,
            p2 as u8,
            (p2_star >> 8) as u8,
            p2_star as u8,
        ])
    }

    fn ecu_reset(&mut self, sub: u8) -> Outcome {
        // hardReset / keyOffOnReset / softReset
        if !(0x01..=0x03).contains(&sub) {
            return Outcome::Negative(nrc::SUB_FUNCTION_NOT_SUPPORTED);
        }
        info!(reset_type = sub, "ecu reset requested");
        self.reset_requested = true;
        Outcome::Positive(vec![sub])
    }

    fn read_data_by_identifier(&mut self, record: &[u8]) -> Outcome {
        if record.is_empty() || record.len() % 2 != 0 {
            return Outcome::Negative(nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let mut payload = Vec::new();
        for did_bytes in record.chunks_exact(2) {
            let did = u16::from_be_bytes([did_bytes[0], did_bytes[1]]);
            if let Some(data) = self.dids.get(&did) {
                payload.extend_from_slice(&did.to_be_bytes());
                payload.extend_from_slice(data);
            }
        }
        if payload.is_empty() {
            return Outcome::Negative(nrc::REQUEST_OUT_OF_RANGE);
        }
        Outcome::Positive(payload)
    }

    fn security_access(&mut self, sub: u8, record: &[u8]) -> Outcome {
        if sub == 0 {
            return Outcome::Negative(nrc::SUB_FUNCTION_NOT_SUPPORTED);
        }
        if sub % 2 == 1 {
            // requestSeed
            if self.security == SecurityLevel::Unlocked {
                // Already unlocked: all-zero seed per ISO 14229-1.
                return Outcome::Positive(vec![sub, 0, 0, 0, 0]);
            }
            let seed = self.config.security_seed;
            self.pending_seed = Some(seed);
            let s = seed.to_be_bytes();
            Outcome::Positive(vec![sub, s[0], s[1], s[2], s[3]])
        } else {
            // sendKey, must follow the matching requestSeed
            let Some(seed) = self.pending_seed else {
                return Outcome::Negative(nrc::REQUEST_SEQUENCE_ERROR);
            };
            if record.len() != 4 {
                return Outcome::Negative(nrc::INCORRECT_MESSAGE_LENGTH);
            }
            let key = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
            if key == !seed {
                info!("security access unlocked");
                self.security = SecurityLevel::Unlocked;
                self.pending_seed = None;
                self.failed_key_attempts = 0;
                Outcome::Positive(vec![sub])
            } else {
                self.failed_key_attempts += 1;
                warn!(attempts = self.failed_key_attempts, "invalid security key");
                if self.failed_key_attempts >= self.config.security_attempt_limit {
                    self.pending_seed = None;
                    Outcome::Negative(nrc::EXCEEDED_NUMBER_OF_ATTEMPTS)
                } else {
                    Outcome::Negative(nrc::INVALID_KEY)
                }
            }
        }
    }

    fn routine_control(&mut self, sub: u8, record: &[u8]) -> Outcome {
        // startRoutine / stopRoutine / requestRoutineResults
        if !(0x01..=0x03).contains(&sub) {
            return Outcome::Negative(nrc::SUB_FUNCTION_NOT_SUPPORTED);
        }
        if record.len() < 2 {
            return Outcome::Negative(nrc::INCORRECT_MESSAGE_LENGTH);
        }
        let routine_id = u16::from_be_bytes([record[0], record[1]]);
        let Some(handler) = self.routines.get_mut(&routine_id) else {
            return Outcome::Negative(nrc::REQUEST_OUT_OF_RANGE);
        };
        match handler(sub, &record[2..]) {
            RoutineOutcome::Done(status) => {
                let mut payload = vec![sub];
                payload.extend_from_slice(&routine_id.to_be_bytes());
                payload.extend_from_slice(&status);
                Outcome::Positive(payload)
            }
            RoutineOutcome::Pending => Outcome::Pending,
            RoutineOutcome::Nrc(code) => Outcome::Negative(code),
        }
    }

    fn tester_present(&mut self, sub: u8) -> Outcome {
        if sub != 0x00 {
            return Outcome::Negative(nrc::SUB_FUNCTION_NOT_SUPPORTED);
        }
        Outcome::Positive(vec![0x00])
    }
}

fn negative(target: u8, sid: u8, code: u8) -> UdsAction {
    UdsAction::Send {
        target,
        data: vec![NEGATIVE_RESPONSE_SID, sid, code],
    }
}
