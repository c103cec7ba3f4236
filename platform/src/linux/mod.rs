mod device;
mod gateway;

pub use device::LinuxDeviceManager;
pub use gateway::LinuxGateway;
