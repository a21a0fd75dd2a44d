//! ZLG `zlgcan` binding
//!
//! The vendor library is loaded at runtime with `libloading`, so the same
//! binary runs on machines without the SDK (the session then degrades to
//! offline mode).
//!
//! The library resolves its own helper DLLs relative to the process working
//! directory. Every native call therefore runs inside a [`WorkdirGuard`],
//! which switches to the SDK directory and restores the previous directory
//! when dropped, unwinding included. The working directory is process-wide,
//! so guards are serialized by a global lock.

use std::env;
use std::ffi::{c_char, c_int, c_void, CString};
use std::path::{Path, PathBuf};

use errors::{CanError, Result};
use libloading::Library;
use parking_lot::{Mutex, MutexGuard};
use signal_db::MAX_EXTENDED_ID;
use tracing::{debug, info, warn};

use super::{
    format_version, sja1000_timing, AdapterDriver, ChannelConfig, ChannelHandle, ChannelMode,
    DeviceHandle, DeviceInfo, DeviceModel, STATUS_OK,
};
use crate::frame::CanFrame;

/// Library names tried when no explicit path is configured
#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["zlgcan.dll"];

#[cfg(not(target_os = "windows"))]
const LIB_NAMES: &[&str] = &["libzlgcan.so", "./libzlgcan.so"];

/// Frame id flag: extended frame format
const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// FD frame flag: bit rate switch
const CANFD_BRS: u8 = 0x01;

// ============================================================================
// C layout
// ============================================================================

type RawHandle = *mut c_void;

// Fields below are read by the vendor library, not by Rust

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct ZcanDeviceInfo {
    hw_version: u16,
    fw_version: u16,
    dr_version: u16,
    in_version: u16,
    irq_num: u16,
    can_num: u8,
    serial: [u8; 20],
    hw_type: [u8; 40],
    reserved: [u16; 4],
}

impl ZcanDeviceInfo {
    fn zeroed() -> Self {
        Self {
            hw_version: 0,
            fw_version: 0,
            dr_version: 0,
            in_version: 0,
            irq_num: 0,
            can_num: 0,
            serial: [0; 20],
            hw_type: [0; 40],
            reserved: [0; 4],
        }
    }
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct ZcanCanInit {
    acc_code: u32,
    acc_mask: u32,
    reserved: u32,
    filter: u8,
    timing0: u8,
    timing1: u8,
    mode: u8,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct ZcanCanFdInit {
    acc_code: u32,
    acc_mask: u32,
    abit_timing: u32,
    dbit_timing: u32,
    brp: u32,
    filter: u8,
    mode: u8,
    pad: u16,
    reserved: u32,
}

#[repr(C)]
#[allow(dead_code)]
union ZcanInitUnion {
    can: ZcanCanInit,
    canfd: ZcanCanFdInit,
}

#[repr(C)]
#[allow(dead_code)]
struct ZcanChannelInitConfig {
    can_type: u32,
    config: ZcanInitUnion,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct ZcanCanFrame {
    can_id: u32,
    can_dlc: u8,
    pad: u8,
    res0: u8,
    res1: u8,
    data: [u8; 8],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct ZcanCanFdFrame {
    can_id: u32,
    len: u8,
    flags: u8,
    res0: u8,
    res1: u8,
    data: [u8; 64],
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct ZcanTransmitData {
    frame: ZcanCanFrame,
    transmit_type: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct ZcanTransmitFdData {
    frame: ZcanCanFdFrame,
    transmit_type: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct ZcanReceiveData {
    frame: ZcanCanFrame,
    timestamp: u64,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Clone, Copy)]
struct ZcanReceiveFdData {
    frame: ZcanCanFdFrame,
    timestamp: u64,
}

impl ZcanCanFrame {
    const EMPTY: Self = Self {
        can_id: 0,
        can_dlc: 0,
        pad: 0,
        res0: 0,
        res1: 0,
        data: [0; 8],
    };
}

impl ZcanCanFdFrame {
    const EMPTY: Self = Self {
        can_id: 0,
        len: 0,
        flags: 0,
        res0: 0,
        res1: 0,
        data: [0; 64],
    };
}

fn wire_id(frame: &CanFrame) -> u32 {
    if frame.is_extended() {
        frame.id | CAN_EFF_FLAG
    } else {
        frame.id
    }
}

fn classic_from_wire(raw: &ZcanReceiveData) -> Option<CanFrame> {
    let len = usize::from(raw.frame.can_dlc.min(8));
    CanFrame::new_classic(raw.frame.can_id & MAX_EXTENDED_ID, raw.frame.data[..len].to_vec())
        .ok()
        .map(|f| f.received(raw.timestamp))
}

fn fd_from_wire(raw: &ZcanReceiveFdData) -> Option<CanFrame> {
    let len = usize::from(raw.frame.len.min(64));
    CanFrame::new_fd(
        raw.frame.can_id & MAX_EXTENDED_ID,
        raw.frame.data[..len].to_vec(),
        raw.frame.flags & CANFD_BRS != 0,
    )
    .ok()
    .map(|f| f.received(raw.timestamp))
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

// ============================================================================
// Function table
// ============================================================================

type OpenDeviceFn = unsafe extern "system" fn(u32, u32, u32) -> RawHandle;
type CloseDeviceFn = unsafe extern "system" fn(RawHandle) -> u32;
type GetDeviceInfFn = unsafe extern "system" fn(RawHandle, *mut ZcanDeviceInfo) -> u32;
type InitCanFn =
    unsafe extern "system" fn(RawHandle, u32, *const ZcanChannelInitConfig) -> RawHandle;
type ChannelFn = unsafe extern "system" fn(RawHandle) -> u32;
type TransmitFn = unsafe extern "system" fn(RawHandle, *const ZcanTransmitData, u32) -> u32;
type TransmitFdFn = unsafe extern "system" fn(RawHandle, *const ZcanTransmitFdData, u32) -> u32;
type GetReceiveNumFn = unsafe extern "system" fn(RawHandle, u8) -> u32;
type ReceiveFn = unsafe extern "system" fn(RawHandle, *mut ZcanReceiveData, u32, c_int) -> u32;
type ReceiveFdFn = unsafe extern "system" fn(RawHandle, *mut ZcanReceiveFdData, u32, c_int) -> u32;
type SetValueFn = unsafe extern "system" fn(RawHandle, *const c_char, *const c_void) -> u32;

/// Resolved entry points
///
/// The pointers are copied out of their symbols and stay valid while the
/// owning [`Library`] is alive.
struct ZlgApi {
    open_device: OpenDeviceFn,
    close_device: CloseDeviceFn,
    get_device_inf: GetDeviceInfFn,
    init_can: InitCanFn,
    start_can: ChannelFn,
    reset_can: ChannelFn,
    transmit: TransmitFn,
    transmit_fd: TransmitFdFn,
    get_receive_num: GetReceiveNumFn,
    receive: ReceiveFn,
    receive_fd: ReceiveFdFn,
    set_value: SetValueFn,
}

fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T> {
    // SAFETY: the caller names the C signature of `name` through `T`
    unsafe { lib.get::<T>(name) }.map(|s| *s).map_err(|e| {
        CanError::driver(format!(
            "missing symbol {}: {}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)),
            e
        ))
    })
}

impl ZlgApi {
    fn resolve(lib: &Library) -> Result<Self> {
        Ok(Self {
            open_device: symbol(lib, b"ZCAN_OpenDevice\0")?,
            close_device: symbol(lib, b"ZCAN_CloseDevice\0")?,
            get_device_inf: symbol(lib, b"ZCAN_GetDeviceInf\0")?,
            init_can: symbol(lib, b"ZCAN_InitCAN\0")?,
            start_can: symbol(lib, b"ZCAN_StartCAN\0")?,
            reset_can: symbol(lib, b"ZCAN_ResetCAN\0")?,
            transmit: symbol(lib, b"ZCAN_Transmit\0")?,
            transmit_fd: symbol(lib, b"ZCAN_TransmitFD\0")?,
            get_receive_num: symbol(lib, b"ZCAN_GetReceiveNum\0")?,
            receive: symbol(lib, b"ZCAN_Receive\0")?,
            receive_fd: symbol(lib, b"ZCAN_ReceiveFD\0")?,
            set_value: symbol(lib, b"ZCAN_SetValue\0")?,
        })
    }
}

// ============================================================================
// Working directory guard
// ============================================================================

static WORKDIR_LOCK: Mutex<()> = Mutex::new(());

/// Switches the process working directory for the lifetime of the guard
pub struct WorkdirGuard {
    previous: Option<PathBuf>,
    _lock: MutexGuard<'static, ()>,
}

impl WorkdirGuard {
    /// Enter `dir` (no-op when `None`)
    ///
    /// A failed switch is logged and the call proceeds in the current
    /// directory.
    pub fn enter(dir: Option<&Path>) -> Self {
        let lock = WORKDIR_LOCK.lock();
        let previous = dir.and_then(|dir| {
            let previous = match env::current_dir() {
                Ok(p) => p,
                Err(e) => {
                    warn!("Cannot read working directory: {}", e);
                    return None;
                },
            };
            match env::set_current_dir(dir) {
                Ok(()) => Some(previous),
                Err(e) => {
                    warn!("Cannot enter driver directory {}: {}", dir.display(), e);
                    None
                },
            }
        });

        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(e) = env::set_current_dir(&previous) {
                warn!("Cannot restore working directory {}: {}", previous.display(), e);
            }
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Adapter driver backed by the vendor shared library
pub struct ZlgDriver {
    api: ZlgApi,
    working_dir: Option<PathBuf>,
    _library: Library,
}

impl ZlgDriver {
    /// Load the vendor library
    ///
    /// `library_path` overrides the platform default name; `working_dir` is
    /// the SDK directory entered around every native call.
    pub fn load(library_path: Option<&Path>, working_dir: Option<&Path>) -> Result<Self> {
        let _guard = WorkdirGuard::enter(working_dir);

        let candidates: Vec<PathBuf> = match library_path {
            Some(path) => vec![path.to_path_buf()],
            None => LIB_NAMES.iter().map(PathBuf::from).collect(),
        };

        let mut last_error = None;
        for candidate in &candidates {
            // SAFETY: loading runs the library initialisers; the vendor
            // library has no initialisation side effects beyond its own state
            match unsafe { Library::new(candidate) } {
                Ok(library) => {
                    let api = ZlgApi::resolve(&library)?;
                    info!("Loaded adapter library {}", candidate.display());
                    return Ok(Self {
                        api,
                        working_dir: working_dir.map(Path::to_path_buf),
                        _library: library,
                    });
                },
                Err(e) => {
                    debug!("Cannot load {}: {}", candidate.display(), e);
                    last_error = Some(format!("{}: {}", candidate.display(), e));
                },
            }
        }

        Err(CanError::driver(format!(
            "cannot load adapter library ({})",
            last_error.unwrap_or_else(|| "no candidates".to_string())
        )))
    }

    fn enter(&self) -> WorkdirGuard {
        WorkdirGuard::enter(self.working_dir.as_deref())
    }
}

fn raw(handle: usize) -> RawHandle {
    handle as RawHandle
}

impl AdapterDriver for ZlgDriver {
    fn name(&self) -> &'static str {
        "zlg"
    }

    fn open_device(&mut self, model: DeviceModel, index: u32) -> DeviceHandle {
        let _guard = self.enter();
        // SAFETY: plain integer arguments
        let handle = unsafe { (self.api.open_device)(model.type_code(), index, 0) };
        DeviceHandle(handle as usize)
    }

    fn close_device(&mut self, device: DeviceHandle) -> u32 {
        let _guard = self.enter();
        // SAFETY: handle obtained from OpenDevice
        unsafe { (self.api.close_device)(raw(device.0)) }
    }

    fn device_info(&mut self, device: DeviceHandle) -> Option<DeviceInfo> {
        let _guard = self.enter();
        let mut info = ZcanDeviceInfo::zeroed();
        // SAFETY: `info` is a writable struct of the expected layout
        let status = unsafe { (self.api.get_device_inf)(raw(device.0), &mut info) };
        if status != STATUS_OK {
            return None;
        }

        Some(DeviceInfo {
            hardware_version: format_version(info.hw_version),
            firmware_version: format_version(info.fw_version),
            driver_version: format_version(info.dr_version),
            interface_version: format_version(info.in_version),
            channel_count: info.can_num,
            serial_number: c_string(&info.serial),
            hardware_type: c_string(&info.hw_type),
        })
    }

    fn set_value(&mut self, device: DeviceHandle, path: &str, value: &str) -> u32 {
        let (Ok(path), Ok(value)) = (CString::new(path), CString::new(value)) else {
            return 0;
        };
        let _guard = self.enter();
        // SAFETY: both strings are NUL terminated and outlive the call
        unsafe {
            (self.api.set_value)(raw(device.0), path.as_ptr(), value.as_ptr().cast::<c_void>())
        }
    }

    fn init_channel(&mut self, device: DeviceHandle, config: &ChannelConfig) -> ChannelHandle {
        let init = match config.mode {
            ChannelMode::Classic => {
                let (timing0, timing1) =
                    sja1000_timing(config.arbitration_bitrate).unwrap_or((0x00, 0x1C));
                ZcanChannelInitConfig {
                    can_type: config.mode.can_type(),
                    config: ZcanInitUnion {
                        can: ZcanCanInit {
                            acc_code: config.acc_code,
                            acc_mask: config.acc_mask,
                            reserved: 0,
                            filter: 0,
                            timing0,
                            timing1,
                            mode: config.work_mode(),
                        },
                    },
                }
            },
            ChannelMode::Fd => ZcanChannelInitConfig {
                can_type: config.mode.can_type(),
                config: ZcanInitUnion {
                    canfd: ZcanCanFdInit {
                        acc_code: config.acc_code,
                        acc_mask: config.acc_mask,
                        abit_timing: 0,
                        dbit_timing: 0,
                        brp: 0,
                        filter: 0,
                        mode: config.work_mode(),
                        pad: 0,
                        reserved: 0,
                    },
                },
            },
        };

        let _guard = self.enter();
        // SAFETY: `init` has the C layout of ZCAN_CHANNEL_INIT_CONFIG
        let handle = unsafe { (self.api.init_can)(raw(device.0), config.index, &init) };
        ChannelHandle(handle as usize)
    }

    fn start_channel(&mut self, channel: ChannelHandle) -> u32 {
        let _guard = self.enter();
        // SAFETY: handle obtained from InitCAN
        unsafe { (self.api.start_can)(raw(channel.0)) }
    }

    fn reset_channel(&mut self, channel: ChannelHandle) -> u32 {
        let _guard = self.enter();
        // SAFETY: handle obtained from InitCAN
        unsafe { (self.api.reset_can)(raw(channel.0)) }
    }

    fn transmit(&mut self, channel: ChannelHandle, frame: &CanFrame) -> u32 {
        let _guard = self.enter();
        if frame.is_fd {
            let mut wire = ZcanTransmitFdData {
                frame: ZcanCanFdFrame::EMPTY,
                transmit_type: 0,
            };
            wire.frame.can_id = wire_id(frame);
            wire.frame.len = frame.data.len() as u8;
            wire.frame.flags = if frame.bit_rate_switch { CANFD_BRS } else { 0 };
            let Some(payload) = wire.frame.data.get_mut(..frame.data.len()) else {
                warn!(id = frame.id, len = frame.data.len(), "FD payload too long");
                return 0;
            };
            payload.copy_from_slice(&frame.data);
            // SAFETY: one initialised element
            unsafe { (self.api.transmit_fd)(raw(channel.0), &wire, 1) }
        } else {
            let mut wire = ZcanTransmitData {
                frame: ZcanCanFrame::EMPTY,
                transmit_type: 0,
            };
            wire.frame.can_id = wire_id(frame);
            wire.frame.can_dlc = frame.data.len() as u8;
            let Some(payload) = wire.frame.data.get_mut(..frame.data.len()) else {
                warn!(id = frame.id, len = frame.data.len(), "Classic payload too long");
                return 0;
            };
            payload.copy_from_slice(&frame.data);
            // SAFETY: one initialised element
            unsafe { (self.api.transmit)(raw(channel.0), &wire, 1) }
        }
    }

    fn receive_count(&mut self, channel: ChannelHandle, fd: bool) -> u32 {
        let _guard = self.enter();
        // SAFETY: handle obtained from InitCAN
        unsafe { (self.api.get_receive_num)(raw(channel.0), u8::from(fd)) }
    }

    fn receive(
        &mut self,
        channel: ChannelHandle,
        fd: bool,
        max: u32,
        wait_ms: i32,
    ) -> Vec<CanFrame> {
        if max == 0 {
            return Vec::new();
        }
        let _guard = self.enter();

        if fd {
            let mut buffer = vec![
                ZcanReceiveFdData {
                    frame: ZcanCanFdFrame::EMPTY,
                    timestamp: 0,
                };
                max as usize
            ];
            // SAFETY: `buffer` holds `max` writable elements
            let n = unsafe {
                (self.api.receive_fd)(raw(channel.0), buffer.as_mut_ptr(), max, wait_ms)
            };
            buffer[..(n.min(max) as usize)].iter().filter_map(fd_from_wire).collect()
        } else {
            let mut buffer = vec![
                ZcanReceiveData {
                    frame: ZcanCanFrame::EMPTY,
                    timestamp: 0,
                };
                max as usize
            ];
            // SAFETY: `buffer` holds `max` writable elements
            let n = unsafe {
                (self.api.receive)(raw(channel.0), buffer.as_mut_ptr(), max, wait_ms)
            };
            buffer[..(n.min(max) as usize)]
                .iter()
                .filter_map(classic_from_wire)
                .collect()
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::frame::Direction;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<ZcanCanFrame>(), 16);
        assert_eq!(std::mem::size_of::<ZcanCanFdFrame>(), 72);
        assert_eq!(std::mem::size_of::<ZcanTransmitData>(), 20);
        assert_eq!(std::mem::size_of::<ZcanReceiveData>(), 24);
        assert_eq!(std::mem::size_of::<ZcanReceiveFdData>(), 80);
        assert_eq!(std::mem::size_of::<ZcanChannelInitConfig>(), 32);
    }

    #[test]
    fn test_wire_id_sets_extended_flag() {
        let std_max = CanFrame::new_classic(0x7FF, vec![]).unwrap();
        assert_eq!(wire_id(&std_max), 0x7FF);
        let ext_min = CanFrame::new_classic(0x800, vec![]).unwrap();
        assert_eq!(wire_id(&ext_min), 0x8000_0800);
    }

    #[test]
    fn test_received_frames_strip_flags() {
        let mut raw = ZcanReceiveData {
            frame: ZcanCanFrame::EMPTY,
            timestamp: 99,
        };
        raw.frame.can_id = 0x8000_0800;
        raw.frame.can_dlc = 2;
        raw.frame.data[..2].copy_from_slice(&[0xAA, 0xBB]);

        let frame = classic_from_wire(&raw).unwrap();
        assert_eq!(frame.id, 0x800);
        assert_eq!(frame.data, vec![0xAA, 0xBB]);
        assert_eq!(frame.direction, Direction::Rx);
        assert_eq!(frame.timestamp_us, 99);
    }

    #[test]
    fn test_received_fd_frame() {
        let mut raw = ZcanReceiveFdData {
            frame: ZcanCanFdFrame::EMPTY,
            timestamp: 5,
        };
        raw.frame.can_id = 0x123;
        raw.frame.len = 12;
        raw.frame.flags = CANFD_BRS;

        let frame = fd_from_wire(&raw).unwrap();
        assert!(frame.is_fd);
        assert!(frame.bit_rate_switch);
        assert_eq!(frame.len(), 12);
    }

    #[test]
    fn test_c_string() {
        let mut bytes = [0u8; 20];
        bytes[..6].copy_from_slice(b"AB1234");
        assert_eq!(c_string(&bytes), "AB1234");
        assert_eq!(c_string(b"FULL"), "FULL");
    }

    // one test: the working directory is process-wide
    #[test]
    fn test_workdir_guard_restores_directory() {
        let before = env::current_dir().unwrap();
        let dir = tempfile::tempdir().unwrap();

        {
            let _guard = WorkdirGuard::enter(Some(dir.path()));
            assert_eq!(
                env::current_dir().unwrap().canonicalize().unwrap(),
                dir.path().canonicalize().unwrap()
            );
        }
        assert_eq!(env::current_dir().unwrap(), before);

        let path = dir.path().to_path_buf();
        let result = std::panic::catch_unwind(move || {
            let _guard = WorkdirGuard::enter(Some(&path));
            panic!("native call blew up");
        });
        assert!(result.is_err());
        assert_eq!(env::current_dir().unwrap(), before);

        {
            let _guard = WorkdirGuard::enter(Some(Path::new("/nonexistent/zlg")));
            assert_eq!(env::current_dir().unwrap(), before);
        }
        assert_eq!(env::current_dir().unwrap(), before);
    }

    #[test]
    fn test_load_missing_library() {
        let err = ZlgDriver::load(Some(Path::new("/nonexistent/zlgcan.dll")), None)
            .err()
            .unwrap();
        assert_eq!(err.error_code(), "DRIVER_BINDING");
    }
}
