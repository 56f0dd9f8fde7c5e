//! Top-level wiring of the protocol modules into one ECU stack.
//!
//! [`EcuStack`] owns the service host, the timer list, the CAN driver and
//! one instance of each protocol module, and routes between them:
//!
//! - driver callbacks (`on_msg_received`, `on_msg_sent`, `on_bus_off`) feed
//!   the modules' interrupt-side entry points,
//! - the 1 ms `tick` drives the timer list,
//! - `service` runs every module handler once and moves completed transport
//!   messages into the diagnostic dispatcher and its responses back out.
//!
//! The host application calls `tick` from its millisecond context and
//! `service` from its task loop; both are non-blocking.

use tracing::{debug, info, trace, warn};

use crate::diagnostic::{UdsAction, UdsConfig, UdsServer};
use crate::driver::{CanDriver, NvStore};
use crate::error::Result;
use crate::network::{NetworkManager, NmConfig};
use crate::queue::Fifo;
use crate::sched::{EventMask, ServiceHost, ServiceId, TimerList};
use crate::transport::{CanTp, CanTpConfig};
use crate::types::{CanId, Config, Frame};

const EV_RX: EventMask = EventMask::user(0);
const EV_BUS_OFF: EventMask = EventMask::user(1);

/// Aggregate configuration of a single-channel stack.
#[derive(Debug, Clone, Default)]
pub struct StackConfig {
    pub cantp: CanTpConfig,
    pub nm: NmConfig,
    pub uds: UdsConfig,
}

impl Config for StackConfig {
    fn validate(&self) -> Result<()> {
        self.cantp.validate()?;
        self.nm.validate()?;
        self.uds.validate()
    }
}

/// A complete ECU communication stack on one CAN channel.
pub struct EcuStack<D: CanDriver, N: NvStore> {
    host: ServiceHost,
    timers: TimerList,
    driver: D,
    /// Raw frames from the receive interrupt, routed in service context.
    rx_fifo: Fifo<Frame>,
    router: ServiceId,
    cantp: CanTp,
    nm: NetworkManager<N>,
    uds: UdsServer,
}

impl<D: CanDriver, N: NvStore> EcuStack<D, N> {
    pub fn new(config: StackConfig, driver: D, nv: N) -> Result<Self> {
        config.validate()?;
        let mut host = ServiceHost::new();
        let mut timers = TimerList::new();
        let router = host.register();
        let cantp = CanTp::new(config.cantp, &mut host, &mut timers)?;
        let nm = NetworkManager::new(config.nm, nv, &mut host, &mut timers)?;
        let uds = UdsServer::new(config.uds, &mut host, &mut timers)?;
        Ok(Self {
            host,
            timers,
            driver,
            rx_fifo: Fifo::new(16, false),
            router,
            cantp,
            nm,
            uds,
        })
    }

    /// Starts the driver. Module init actions run on the first `service`.
    pub fn power_on(&mut self) -> Result<()> {
        info!("stack power on");
        self.driver.start()
    }

    /// Requests an orderly shutdown: every service observes the flag on its
    /// next handler run and terminates after cleanup.
    pub fn trigger_shutdown(&self) {
        info!("stack shutdown requested");
        self.host.trigger_shutdown();
    }

    /// True once every service acknowledged the shutdown.
    pub fn is_terminated(&self) -> bool {
        self.host.is_terminated()
    }

    /// Stops the driver. Call after the services terminated.
    pub fn power_off(&mut self) -> Result<()> {
        info!("stack power off");
        self.driver.stop()
    }

    /// 1 ms tick context: advances all protocol deadlines.
    pub fn tick(&mut self) {
        self.timers.tick(&self.host);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.timers.uptime_ms()
    }

    /// True while any service has unprocessed events.
    pub fn has_pending_work(&self) -> bool {
        self.host.any_pending()
    }

    /// Receive-interrupt context: drains the driver's hardware queue into
    /// the router FIFO. Overflow clears the queue rather than blocking.
    pub fn on_msg_received(&mut self) {
        while let Some(frame) = self.driver.get_next_message() {
            if !self.rx_fifo.push(frame) {
                warn!("stack rx queue overflow, clearing {} frames", self.rx_fifo.len());
                self.rx_fifo.clear();
            }
        }
        self.host.set_event(self.router, EV_RX);
    }

    /// Transmit-confirmation interrupt context.
    pub fn on_msg_sent(&mut self, id: CanId) {
        if !self.cantp.on_tx_confirm(id, &self.host) && !self.nm.on_tx_confirm(id, &self.host) {
            trace!(id, "unmatched tx confirmation");
        }
    }

    /// Bus-off indication from the driver.
    pub fn on_bus_off(&mut self) {
        self.host.set_event(self.router, EV_BUS_OFF);
    }

    /// Service context: runs the router and every module handler once.
    pub fn service(&mut self) -> Result<()> {
        self.service_router();

        let messages = self
            .cantp
            .service(&self.host, &mut self.timers, &mut self.driver)?;
        for msg in &messages {
            let actions = self.uds.on_request(msg, &mut self.timers);
            self.apply_uds_actions(actions)?;
        }

        self.nm
            .service(&self.host, &mut self.timers, &mut self.driver)?;

        let actions = self.uds.service(&self.host, &mut self.timers);
        self.apply_uds_actions(actions)?;
        Ok(())
    }

    fn service_router(&mut self) {
        if self.host.check_clear_event(self.router, EventMask::TRIGGER_SHUTDOWN) {
            self.rx_fifo.clear();
            self.host.terminate(self.router);
            return;
        }
        self.host
            .check_clear_event(self.router, EventMask::INIT | EventMask::RE_INIT);

        if self.host.check_clear_event(self.router, EV_BUS_OFF) {
            warn!("bus off, aborting transport activity");
            self.cantp.abort(&mut self.timers);
        }

        if self.host.check_clear_event(self.router, EV_RX) {
            while let Some(frame) = self.rx_fifo.pop() {
                if self.cantp.accepts_frame(&frame) {
                    self.cantp.on_frame(frame, &self.host);
                } else if self.nm.accepts_frame(&frame) {
                    self.nm.on_frame(frame, &self.host);
                } else {
                    trace!(id = frame.id, "frame not claimed by any module");
                }
            }
        }
    }

    fn apply_uds_actions(&mut self, actions: Vec<UdsAction>) -> Result<()> {
        for action in actions {
            match action {
                UdsAction::Send { target, data } => {
                    self.cantp.request_send(target, &data, &self.host)?;
                }
                UdsAction::AbortTransport => {
                    debug!("diagnostic layer aborted, tearing down transport");
                    self.cantp.abort(&mut self.timers);
                }
            }
        }
        Ok(())
    }

    pub fn uds(&self) -> &UdsServer {
        &self.uds
    }

    pub fn uds_mut(&mut self) -> &mut UdsServer {
        &mut self.uds
    }

    /// Async service completion, forwarded to the diagnostic dispatcher.
    pub fn processing_done(&mut self, result: std::result::Result<Vec<u8>, u8>) {
        self.uds.processing_done(result, &self.host);
    }

    pub fn nm(&self) -> &NetworkManager<N> {
        &self.nm
    }

    pub fn nm_mut(&mut self) -> &mut NetworkManager<N> {
        &mut self.nm
    }

    /// Network request/release shortcuts for the host application.
    pub fn request_network(&mut self) {
        self.nm.request_network(&self.host);
    }

    pub fn release_network(&mut self) {
        self.nm.release_network(&self.host);
    }

    pub fn transport(&self) -> &CanTp {
        &self.cantp
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}
