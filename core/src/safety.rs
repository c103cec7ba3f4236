//! Safety gate run before any destructive operation (table write, clean,
//! raw copy). Consolidates the checks the teacher codebase grew across
//! several iterations (system-drive check, mount-point check, data-loss
//! acknowledgment) into the single gate this tool actually needs: it only
//! ever touches one disk at a time and always destroys data on it, so
//! there is no format-specific risk matrix to carry, just "is this really
//! a removable card and did the caller acknowledge the wipe".

use crate::Device;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    /// Removable SD/USB media, not mounted as a system path.
    Normal,
    /// Removable media but currently mounted somewhere the host considers
    /// important (not `/`, `/boot`, ... but still flagged for visibility).
    Elevated,
    /// Not removable, or mounted at a system-critical path. Refuse unless
    /// explicitly overridden.
    Forbidden,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub device_id: String,
    pub risk: RiskLevel,
    pub reasons: Vec<String>,
}

impl SafetyCheck {
    pub fn evaluate(device: &Device) -> Self {
        let mut reasons = Vec::new();
        let mut risk = RiskLevel::Normal;

        if device.is_system {
            risk = RiskLevel::Forbidden;
            reasons.push("device is marked as a system disk".to_string());
        } else if !device.is_removable {
            risk = RiskLevel::Forbidden;
            reasons.push("device is not removable media".to_string());
        } else if !device.mount_points.is_empty() {
            risk = RiskLevel::Elevated;
            reasons.push(format!(
                "device has {} mounted volume(s) that will be dismounted",
                device.mount_points.len()
            ));
        }

        Self {
            device_id: device.id.clone(),
            risk,
            reasons,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.risk != RiskLevel::Forbidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;

    fn device(is_system: bool, is_removable: bool) -> Device {
        Device {
            id: "/dev/mmcblk0".to_string(),
            name: "SD Card".to_string(),
            size: 64 * 1024 * 1024 * 1024,
            device_type: DeviceType::SDCard,
            mount_points: Vec::new(),
            is_removable,
            is_system,
        }
    }

    #[test]
    fn system_disk_is_forbidden() {
        let check = SafetyCheck::evaluate(&device(true, false));
        assert_eq!(check.risk, RiskLevel::Forbidden);
        assert!(!check.is_allowed());
    }

    #[test]
    fn removable_unmounted_disk_is_normal() {
        let check = SafetyCheck::evaluate(&device(false, true));
        assert_eq!(check.risk, RiskLevel::Normal);
        assert!(check.is_allowed());
    }

    #[test]
    fn fixed_non_removable_disk_is_forbidden() {
        let check = SafetyCheck::evaluate(&device(false, false));
        assert_eq!(check.risk, RiskLevel::Forbidden);
    }
}
