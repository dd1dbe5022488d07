//! Runtime configuration for the local job-queue engine and copy engine.
//!
//! Small and `toml`-backed, in the spirit of the teacher's
//! `config_patcher.rs` (parse, validate, fall back to defaults) — but here
//! it's read once at `Scheduler`/`FileSystem` construction rather than
//! patched in place.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Polling delay bounds from spec §4.1.
pub const MIN_POLLING_DELAY_MS: u64 = 100;
pub const MAX_POLLING_DELAY_MS: u64 = 60_000;

/// Buffer size used by the copy engine's file streaming loop (§4.5).
pub const DEFAULT_COPY_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XenonConfig {
    /// Name this adaptor instance reports in job/copy ids and error objects.
    pub adaptor_name: String,
    /// Worker count for the `multi` queue. Must be ≥ 1.
    pub multi_queue_workers: usize,
    /// Poll interval for the executor driver loop, in milliseconds.
    /// Must lie in `[MIN_POLLING_DELAY_MS, MAX_POLLING_DELAY_MS]`.
    pub polling_delay_ms: u64,
    /// Streaming buffer size for the copy engine, in bytes.
    pub copy_buffer_bytes: usize,
}

impl Default for XenonConfig {
    fn default() -> Self {
        XenonConfig {
            adaptor_name: "xenon".to_string(),
            multi_queue_workers: 4,
            polling_delay_ms: 1000,
            copy_buffer_bytes: DEFAULT_COPY_BUFFER_BYTES,
        }
    }
}

impl XenonConfig {
    /// Parse configuration from a TOML document, filling in defaults for
    /// any field left unset.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: XenonConfig = toml::from_str(s).map_err(|e| {
            Error::bad_parameter("xenon", format!("invalid configuration: {e}"))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The XDG-style config path this adaptor's config file lives at by
    /// convention (`~/.config/xenon/config.toml` on Linux, the platform
    /// equivalent elsewhere), following the teacher's own
    /// `dirs::config_dir()`-based lookup for `config_patcher.rs`. Returns
    /// `None` when the platform has no notion of a config directory.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("xenon").join("config.toml"))
    }

    /// Load configuration from [`default_config_path`], falling back to
    /// [`XenonConfig::default`] when the file is absent.
    pub fn load_or_default() -> Result<Self> {
        let Some(path) = Self::default_config_path() else {
            return Ok(Self::default());
        };
        match std::fs::read_to_string(&path) {
            Ok(s) => Self::from_toml_str(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::bad_parameter("xenon", format!("failed to read {}: {e}", path.display()))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.multi_queue_workers < 1 {
            return Err(Error::bad_parameter(
                &self.adaptor_name,
                "multi_queue_workers must be >= 1",
            ));
        }
        if !(MIN_POLLING_DELAY_MS..=MAX_POLLING_DELAY_MS).contains(&self.polling_delay_ms) {
            return Err(Error::bad_parameter(
                &self.adaptor_name,
                format!(
                    "polling_delay_ms must be in [{MIN_POLLING_DELAY_MS}, {MAX_POLLING_DELAY_MS}], got {}",
                    self.polling_delay_ms
                ),
            ));
        }
        if self.copy_buffer_bytes == 0 {
            return Err(Error::bad_parameter(
                &self.adaptor_name,
                "copy_buffer_bytes must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(XenonConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_polling_delay_out_of_bounds() {
        let mut cfg = XenonConfig::default();
        cfg.polling_delay_ms = 50;
        assert!(cfg.validate().is_err());
        cfg.polling_delay_ms = 70_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_config_path_is_rooted_under_xenon() {
        if let Some(path) = XenonConfig::default_config_path() {
            assert!(path.ends_with("xenon/config.toml"));
        }
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = XenonConfig::from_toml_str(r#"multi_queue_workers = 8"#).unwrap();
        assert_eq!(cfg.multi_queue_workers, 8);
        assert_eq!(cfg.polling_delay_ms, 1000);
    }
}
