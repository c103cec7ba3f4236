use thiserror::Error;

/// Error taxonomy for the scanner, planner, writer and migration engine.
///
/// Propagation policy: the first error encountered latches and is raised
/// with stage context; nothing here is ever silently swallowed. emuMMC
/// post-processing failures are logged by the caller and treated as
/// non-fatal rather than mapped to this enum.
#[derive(Debug, Error)]
pub enum SdToolError {
    #[error("invalid on-disk layout: {0}")]
    InvalidOnDisk(String),

    #[error("target disk is too small: need at least {needed_bytes} bytes, have {available_bytes}")]
    InsufficientTargetSize {
        needed_bytes: u64,
        available_bytes: u64,
    },

    #[error("target must be larger than source for migration ({target_bytes} <= {source_bytes})")]
    TargetNotLarger {
        source_bytes: u64,
        target_bytes: u64,
    },

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("device is write-protected: {0}")]
    WriteProtected(String),

    #[error("I/O failure during {stage} at sector {offset}: {source}")]
    IoFailure {
        stage: String,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("subprocess failed: {0}")]
    SubprocessFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl SdToolError {
    /// Final-attempt `DeviceBusy`, with the same guidance the original
    /// tool's ACCESS DENIED handler gives on its last retry: close
    /// anything with the disk open, check write-protect, run elevated.
    pub fn device_busy(device: &str) -> Self {
        SdToolError::DeviceBusy(format!(
            "{device}: exhausted all retries. Close any program or file manager with the \
             disk open, check whether it is write-protected, and make sure this process is \
             running with administrator/root privileges, then try again"
        ))
    }
}
