//! Mock CAN driver and NV store for testing and host-side simulation.

use std::collections::VecDeque;

use super::{CanDriver, NvStore};
use crate::error::{Result, StackError};
use crate::types::Frame;

/// Mock CAN driver: records every sent frame and hands out frames injected
/// by the test.
#[derive(Default)]
pub struct MockCan {
    started: bool,
    rx_queue: VecDeque<Frame>,
    sent: Vec<Frame>,
    fail_send: bool,
}

impl MockCan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a frame as if it had arrived from the bus.
    pub fn inject(&mut self, frame: Frame) {
        self.rx_queue.push_back(frame);
    }

    /// Makes subsequent `send_message` calls fail.
    pub fn set_fail_send(&mut self, fail: bool) {
        self.fail_send = fail;
    }

    /// Frames transmitted so far, in order.
    pub fn sent_frames(&self) -> &[Frame] {
        &self.sent
    }

    /// Removes and returns all transmitted frames.
    pub fn take_sent(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.sent)
    }
}

impl CanDriver for MockCan {
    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn send_message(&mut self, frame: &Frame) -> Result<()> {
        if !self.started {
            return Err(StackError::NotInitialized);
        }
        if self.fail_send {
            return Err(StackError::DriverError("simulated send failure".into()));
        }
        self.sent.push(frame.clone());
        Ok(())
    }

    fn get_next_message(&mut self) -> Option<Frame> {
        if !self.started {
            return None;
        }
        self.rx_queue.pop_front()
    }
}

/// Mock single-slot NV store.
#[derive(Default)]
pub struct MockNv {
    slot: Option<u8>,
}

impl MockNv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: u8) -> Self {
        Self { slot: Some(value) }
    }

    pub fn value(&self) -> Option<u8> {
        self.slot
    }
}

impl NvStore for MockNv {
    fn load(&mut self) -> Option<u8> {
        self.slot
    }

    fn store(&mut self, value: u8) {
        self.slot = Some(value);
    }
}
