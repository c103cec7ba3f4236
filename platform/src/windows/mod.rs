mod device;
mod gateway;

pub use device::WindowsDeviceManager;
pub use gateway::WindowsGateway;
