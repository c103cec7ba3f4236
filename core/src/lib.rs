pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod partition;
pub mod progress;
pub mod safety;

pub use config::ToolConfig;
pub use device::{Device, DeviceManager, DeviceType, PermissionLevel};
pub use error::SdToolError;
pub use gateway::{BlockDeviceGateway, OpenMode};
pub use partition::{Category, DiskLayout, Partition, SECTOR_SIZE};
pub use progress::{FnProgress, LoggingProgress, NoOpProgress, ProgressCallback};
pub use safety::{RiskLevel, SafetyCheck};
