//! Ambient tool configuration, loaded from an optional `sdtool.toml`.
//! Nothing here changes what the scanner/planner/writer compute by default;
//! it only overrides constants a non-stock bootloader layout might need to
//! adjust, and sets the default log level before `env_logger` initializes.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Default log level string understood by `env_logger` (e.g. "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Override for the planner's end-of-disk reserve, in MiB. Defaults to
    /// 9 MiB, matching stock hekate layouts.
    #[serde(default = "default_end_reserve_mib")]
    pub end_reserve_mib: u64,

    /// Override for the raw-copy chunk size, in MiB. When unset the engine
    /// picks from available RAM per the chunk/buffer sizing table.
    pub chunk_size_mib: Option<u64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_end_reserve_mib() -> u64 {
    9
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            end_reserve_mib: default_end_reserve_mib(),
            chunk_size_mib: None,
        }
    }
}

impl ToolConfig {
    pub fn load(path: &Path) -> Result<Self, crate::SdToolError> {
        let text = std::fs::read_to_string(path)?;
        let config: ToolConfig = toml::from_str(&text)?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, crate::SdToolError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_hekate_layout() {
        let config = ToolConfig::default();
        assert_eq!(config.end_reserve_mib, 9);
        assert_eq!(config.log_level, "info");
        assert!(config.chunk_size_mib.is_none());
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = ToolConfig::load_or_default(Path::new("/nonexistent/sdtool.toml")).unwrap();
        assert_eq!(config.end_reserve_mib, 9);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sdtool.toml");
        std::fs::write(&path, "log_level = \"debug\"\n").unwrap();
        let config = ToolConfig::load(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.end_reserve_mib, 9);
    }
}
