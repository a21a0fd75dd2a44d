//! In-process loopback adapter
//!
//! Every frame accepted by `transmit` is queued back as received traffic.
//! Failures can be scripted per operation, which makes the backend useful
//! for dry runs and for exercising session error paths.
//!
//! Clones share state, so a caller can keep a handle for scripting and
//! inspection after the driver has been moved into a session.
//!
//! The receive queue behaves like an adapter FIFO: once full, the oldest
//! frame is dropped. The history of sent frames is bounded the same way.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    AdapterDriver, ChannelConfig, ChannelHandle, DeviceHandle, DeviceInfo, DeviceModel, STATUS_OK,
};
use crate::frame::CanFrame;

const STATUS_ERR: u32 = 0;

/// Frames held in the receive queue before the oldest is dropped
pub const RX_QUEUE_CAPACITY: usize = 4096;
/// Transmitted frames kept for inspection
pub const SENT_HISTORY: usize = 10_000;

#[derive(Debug)]
struct ChannelSlot {
    device: DeviceHandle,
    config: ChannelConfig,
    started: bool,
}

#[derive(Debug)]
struct LoopbackState {
    next_handle: usize,
    devices: HashSet<usize>,
    channels: HashMap<usize, ChannelSlot>,
    rx: VecDeque<CanFrame>,
    sent: VecDeque<CanFrame>,
    rx_dropped: u64,
    properties: Vec<(String, String)>,
    resets: usize,
    closes: usize,
    echo: bool,
    fail_open: bool,
    fail_init: bool,
    fail_start: bool,
    transmit_result: Option<u32>,
    epoch: Instant,
}

impl Default for LoopbackState {
    fn default() -> Self {
        Self {
            next_handle: 1,
            devices: HashSet::new(),
            channels: HashMap::new(),
            rx: VecDeque::new(),
            sent: VecDeque::new(),
            rx_dropped: 0,
            properties: Vec::new(),
            resets: 0,
            closes: 0,
            echo: true,
            fail_open: false,
            fail_init: false,
            fail_start: false,
            transmit_result: None,
            epoch: Instant::now(),
        }
    }
}

impl LoopbackState {
    fn allocate(&mut self) -> usize {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn started(&self, channel: ChannelHandle) -> bool {
        self.channels.get(&channel.0).is_some_and(|c| c.started)
    }

    fn enqueue_rx(&mut self, frame: CanFrame) {
        if self.rx.len() >= RX_QUEUE_CAPACITY {
            self.rx.pop_front();
            self.rx_dropped += 1;
            if self.rx_dropped == 1 || self.rx_dropped % 1000 == 0 {
                debug!(dropped = self.rx_dropped, "Loopback receive queue full");
            }
        }
        let timestamp = self.epoch.elapsed().as_micros() as u64;
        self.rx.push_back(frame.received(timestamp));
    }
}

/// Echoing adapter with scriptable failures
#[derive(Debug, Clone, Default)]
pub struct LoopbackDriver {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Scripting
    // ========================================================================

    /// Make `open_device` return an invalid handle
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Make `init_channel` return an invalid handle
    pub fn fail_init(&self, fail: bool) {
        self.state.lock().fail_init = fail;
    }

    /// Make `start_channel` return an error status
    pub fn fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    /// Force the frame count `transmit` reports (`None` restores normal
    /// behaviour)
    pub fn transmit_result(&self, count: Option<u32>) {
        self.state.lock().transmit_result = count;
    }

    /// Disable echoing of transmitted frames
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Queue a frame as if it arrived from the bus
    pub fn inject(&self, frame: CanFrame) {
        self.state.lock().enqueue_rx(frame);
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Frames accepted by `transmit`, oldest first
    pub fn sent(&self) -> Vec<CanFrame> {
        self.state.lock().sent.iter().cloned().collect()
    }

    /// Frames dropped because the receive queue was full
    pub fn rx_dropped(&self) -> u64 {
        self.state.lock().rx_dropped
    }

    pub fn open_devices(&self) -> usize {
        self.state.lock().devices.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    /// Device properties written through `set_value`, in call order
    pub fn properties(&self) -> Vec<(String, String)> {
        self.state.lock().properties.clone()
    }
}

impl AdapterDriver for LoopbackDriver {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn open_device(&mut self, model: DeviceModel, index: u32) -> DeviceHandle {
        let mut state = self.state.lock();
        if state.fail_open {
            return DeviceHandle::INVALID;
        }
        let handle = state.allocate();
        state.devices.insert(handle);
        debug!("Loopback opened {} #{} as {}", model, index, handle);
        DeviceHandle(handle)
    }

    fn close_device(&mut self, device: DeviceHandle) -> u32 {
        let mut state = self.state.lock();
        if !state.devices.remove(&device.0) {
            return STATUS_ERR;
        }
        state.channels.retain(|_, c| c.device != device);
        state.closes += 1;
        STATUS_OK
    }

    fn device_info(&mut self, device: DeviceHandle) -> Option<DeviceInfo> {
        let state = self.state.lock();
        state.devices.contains(&device.0).then(|| DeviceInfo {
            hardware_version: "V1.00".to_string(),
            firmware_version: "V1.00".to_string(),
            driver_version: "V1.00".to_string(),
            interface_version: "V1.00".to_string(),
            channel_count: 2,
            serial_number: format!("LOOP{:04}", device.0),
            hardware_type: "Loopback".to_string(),
        })
    }

    fn set_value(&mut self, device: DeviceHandle, path: &str, value: &str) -> u32 {
        let mut state = self.state.lock();
        if !state.devices.contains(&device.0) {
            return STATUS_ERR;
        }
        state.properties.push((path.to_string(), value.to_string()));
        STATUS_OK
    }

    fn init_channel(&mut self, device: DeviceHandle, config: &ChannelConfig) -> ChannelHandle {
        let mut state = self.state.lock();
        if state.fail_init || !state.devices.contains(&device.0) {
            return ChannelHandle::INVALID;
        }
        let handle = state.allocate();
        state.channels.insert(
            handle,
            ChannelSlot {
                device,
                config: config.clone(),
                started: false,
            },
        );
        ChannelHandle(handle)
    }

    fn start_channel(&mut self, channel: ChannelHandle) -> u32 {
        let mut state = self.state.lock();
        if state.fail_start {
            return STATUS_ERR;
        }
        match state.channels.get_mut(&channel.0) {
            Some(slot) => {
                slot.started = true;
                STATUS_OK
            },
            None => STATUS_ERR,
        }
    }

    fn reset_channel(&mut self, channel: ChannelHandle) -> u32 {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.channels.get_mut(&channel.0) {
            Some(slot) => {
                slot.started = false;
                state.resets += 1;
                STATUS_OK
            },
            None => STATUS_ERR,
        }
    }

    fn transmit(&mut self, channel: ChannelHandle, frame: &CanFrame) -> u32 {
        let mut state = self.state.lock();
        if let Some(count) = state.transmit_result {
            return count;
        }
        if !state.started(channel) {
            return 0;
        }

        if state.sent.len() >= SENT_HISTORY {
            state.sent.pop_front();
        }
        state.sent.push_back(frame.clone());
        let listen_only = state
            .channels
            .get(&channel.0)
            .is_some_and(|c| c.config.listen_only);
        if state.echo && !listen_only {
            state.enqueue_rx(frame.clone());
        }
        1
    }

    fn receive_count(&mut self, channel: ChannelHandle, fd: bool) -> u32 {
        let state = self.state.lock();
        if !state.started(channel) {
            return 0;
        }
        state.rx.iter().filter(|f| f.is_fd == fd).count() as u32
    }

    fn receive(
        &mut self,
        channel: ChannelHandle,
        fd: bool,
        max: u32,
        _wait_ms: i32,
    ) -> Vec<CanFrame> {
        let mut state = self.state.lock();
        if !state.started(channel) {
            return Vec::new();
        }

        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(state.rx.len());
        while let Some(frame) = state.rx.pop_front() {
            if frame.is_fd == fd && taken.len() < max as usize {
                taken.push(frame);
            } else {
                kept.push_back(frame);
            }
        }
        state.rx = kept;
        taken
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::frame::Direction;

    fn started(driver: &mut LoopbackDriver) -> (DeviceHandle, ChannelHandle) {
        let device = driver.open_device(DeviceModel::UsbCanFd200U, 0);
        let channel = driver.init_channel(device, &ChannelConfig::default());
        assert_eq!(driver.start_channel(channel), STATUS_OK);
        (device, channel)
    }

    #[test]
    fn test_echo() {
        let mut driver = LoopbackDriver::new();
        let (_, channel) = started(&mut driver);

        let frame = CanFrame::new_classic(0x100, vec![0x14]).unwrap();
        assert_eq!(driver.transmit(channel, &frame), 1);
        assert_eq!(driver.receive_count(channel, false), 1);
        assert_eq!(driver.receive_count(channel, true), 0);

        let rx = driver.receive(channel, false, 10, 0);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx[0].direction, Direction::Rx);
        assert_eq!(rx[0].data, vec![0x14]);
        assert_eq!(driver.sent().len(), 1);
    }

    #[test]
    fn test_receive_respects_max_and_kind() {
        let mut driver = LoopbackDriver::new();
        let (_, channel) = started(&mut driver);
        for i in 0..5 {
            driver.inject(CanFrame::new_classic(i, vec![]).unwrap());
        }
        driver.inject(CanFrame::new_fd(0x200, vec![0; 12], false).unwrap());

        assert_eq!(driver.receive(channel, false, 3, 0).len(), 3);
        assert_eq!(driver.receive_count(channel, false), 2);
        assert_eq!(driver.receive(channel, true, 10, 0).len(), 1);
        assert_eq!(driver.receive(channel, false, 10, 0).len(), 2);
    }

    #[test]
    fn test_unpolled_echo_queue_is_bounded() {
        let mut driver = LoopbackDriver::new();
        let (_, channel) = started(&mut driver);
        for i in 0..(RX_QUEUE_CAPACITY + 10) {
            let frame = CanFrame::new_classic(i as u32, vec![]).unwrap();
            assert_eq!(driver.transmit(channel, &frame), 1);
        }

        assert_eq!(driver.receive_count(channel, false), RX_QUEUE_CAPACITY as u32);
        assert_eq!(driver.rx_dropped(), 10);
        let oldest = driver.receive(channel, false, 1, 0);
        assert_eq!(oldest[0].id, 10);
        assert_eq!(driver.sent().len(), RX_QUEUE_CAPACITY + 10);
    }

    #[test]
    fn test_transmit_requires_started_channel() {
        let mut driver = LoopbackDriver::new();
        let device = driver.open_device(DeviceModel::UsbCanFd100U, 0);
        let channel = driver.init_channel(device, &ChannelConfig::default());
        let frame = CanFrame::new_classic(0x1, vec![]).unwrap();
        assert_eq!(driver.transmit(channel, &frame), 0);
    }

    #[test]
    fn test_scripted_failures() {
        let mut driver = LoopbackDriver::new();
        driver.fail_open(true);
        assert!(!driver.open_device(DeviceModel::UsbCanFdMini, 0).is_valid());
        driver.fail_open(false);

        let device = driver.open_device(DeviceModel::UsbCanFdMini, 0);
        let channel = driver.init_channel(device, &ChannelConfig::default());
        driver.fail_start(true);
        assert_ne!(driver.start_channel(channel), STATUS_OK);

        driver.fail_start(false);
        assert_eq!(driver.start_channel(channel), STATUS_OK);
        driver.transmit_result(Some(0));
        let frame = CanFrame::new_classic(0x1, vec![]).unwrap();
        assert_eq!(driver.transmit(channel, &frame), 0);
    }

    #[test]
    fn test_close_drops_channels() {
        let mut driver = LoopbackDriver::new();
        let (device, _) = started(&mut driver);
        assert_eq!(driver.open_channels(), 1);
        assert_eq!(driver.close_device(device), STATUS_OK);
        assert_eq!(driver.open_channels(), 0);
        assert_eq!(driver.open_devices(), 0);
        assert_eq!(driver.close_device(device), STATUS_ERR);
    }

    #[test]
    fn test_clones_share_state() {
        let handle = LoopbackDriver::new();
        let mut boxed: Box<dyn AdapterDriver> = Box::new(handle.clone());
        let device = boxed.open_device(DeviceModel::UsbCanFd200U, 0);
        assert_eq!(boxed.set_value(device, "0/initenal_resistance", "1"), STATUS_OK);
        assert_eq!(handle.open_devices(), 1);
        assert_eq!(
            handle.properties(),
            vec![("0/initenal_resistance".to_string(), "1".to_string())]
        );
    }
}
