//! Platform-specific implementations of `sdtool_core::BlockDeviceGateway`
//! and `sdtool_core::DeviceManager`. Selection is a `cfg`-gated type alias,
//! the same shape as the teacher's `PlatformDeviceManager`, so callers
//! never match on the host OS themselves.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "windows")]
pub mod windows;

pub mod loopback;

#[cfg(target_os = "linux")]
pub type PlatformGateway = linux::LinuxGateway;
#[cfg(target_os = "linux")]
pub type PlatformDeviceManager = linux::LinuxDeviceManager;

#[cfg(target_os = "windows")]
pub type PlatformGateway = windows::WindowsGateway;
#[cfg(target_os = "windows")]
pub type PlatformDeviceManager = windows::WindowsDeviceManager;

pub use loopback::{LoopbackDeviceManager, LoopbackGateway};
