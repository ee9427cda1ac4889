//! # Session Configuration
//!
//! Declarative description of a target: which device it is, which ELF
//! images belong on it, how to reach the debug monitor, and which
//! on-target memory model tests should use.
//!
//! Configuration is read from a TOML file. Every option has a default
//! except `device_name` and `app_load_elf`, so a minimal file is two
//! lines:
//!
//! ```toml
//! device_name = "STM32F072RB"
//! app_load_elf = "build/dbg/app.elf"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::mem::MemModel;
use crate::types::Endianness;

/// Errors produced while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError
{
    /// The configuration file could not be read.
    #[error("Failed to read config file {path:?}: {source}")]
    Read
    {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML, or a value has the wrong shape.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required option is missing or empty.
    #[error("Missing or empty required option: {0}")]
    MissingField(&'static str),

    /// An option has a value the engine cannot work with.
    #[error("Invalid value for {field}: {reason}")]
    Invalid
    {
        /// The offending option.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Which debug monitor the session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType
{
    /// A J-Link GDB server.
    #[default]
    Jlink,
    /// An OpenOCD GDB server.
    Openocd,
    /// The built-in simulated adapter. Used by the test suite.
    Sim,
}

impl std::fmt::Display for MonitorType
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            Self::Jlink => write!(f, "jlink"),
            Self::Openocd => write!(f, "openocd"),
            Self::Sim => write!(f, "sim"),
        }
    }
}

fn default_jlink_interface() -> String
{
    "SWD".to_string()
}

const fn default_jlink_speed() -> u32
{
    15000
}

const fn default_gdb_server_port() -> u16
{
    2331
}

const fn default_prestack_alloc_size() -> u32
{
    256
}

fn default_prestack_alloc_location() -> String
{
    "Reset_Handler".to_string()
}

fn default_prestack_halt_location() -> String
{
    "main".to_string()
}

const fn default_timeout_secs() -> u64
{
    5
}

/// Full description of a target session.
///
/// Field names match the option names accepted in the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig
{
    /// Device name as understood by the debug monitor, e.g. `"STM32F072RB"`.
    pub device_name: String,

    /// Byte order of the target. Defaults to little-endian.
    #[serde(default)]
    pub device_endianness: Endianness,

    /// ELF image downloaded to the target by `load_image`.
    pub app_load_elf: PathBuf,

    /// Optional separate ELF used only for symbols and debug info. When
    /// absent, `app_load_elf` provides symbols too.
    #[serde(default)]
    pub app_symbol_elf: Option<PathBuf>,

    /// Optional bootloader image downloaded before the application.
    #[serde(default)]
    pub bl_load_elf: Option<PathBuf>,

    /// Optional bootloader symbol file, merged into the session's symbol
    /// table at `bl_symbol_addr`.
    #[serde(default)]
    pub bl_symbol_elf: Option<PathBuf>,

    /// Load offset applied to bootloader symbols.
    #[serde(default)]
    pub bl_symbol_addr: Option<u64>,

    /// Which debug monitor to use.
    #[serde(default)]
    pub monitor_type: MonitorType,

    /// J-Link target interface, e.g. `"SWD"` or `"JTAG"`.
    #[serde(default = "default_jlink_interface")]
    pub jlink_interface: String,

    /// J-Link interface speed in kHz.
    #[serde(default = "default_jlink_speed")]
    pub jlink_speed: u32,

    /// Serial number used to pick one of several attached probes.
    #[serde(default)]
    pub jlink_serial: Option<String>,

    /// GDB server host. Defaults to localhost when absent.
    #[serde(default)]
    pub gdb_server_addr: Option<String>,

    /// GDB server port.
    #[serde(default = "default_gdb_server_port")]
    pub gdb_server_port: u16,

    /// On-target memory model used for host-driven allocations.
    #[serde(default)]
    pub on_target_mem_model: MemModel,

    /// Bytes carved out of the firmware stack by the `PRESTACK` model.
    /// Must be a multiple of 4.
    #[serde(default = "default_prestack_alloc_size")]
    pub on_target_mem_prestack_alloc_size: u32,

    /// Symbol the target is allowed to reach before its stack pointer is
    /// moved (`PRESTACK` model only).
    #[serde(default = "default_prestack_alloc_location")]
    pub on_target_mem_prestack_alloc_location: String,

    /// Symbol the target runs to after the stack pointer has been moved
    /// (`PRESTACK` model only).
    #[serde(default = "default_prestack_halt_location")]
    pub on_target_mem_prestack_halt_location: String,

    /// Total firmware stack size, used to sanity-check the carve-out.
    /// Zero disables the check.
    #[serde(default)]
    pub on_target_mem_prestack_total_stack_size: u32,

    /// Default deadline for blocking operations, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl TargetConfig
{
    /// Creates a configuration with the given required options and
    /// defaults for everything else.
    #[must_use]
    pub fn new(device_name: impl Into<String>, app_load_elf: impl Into<PathBuf>) -> Self
    {
        Self {
            device_name: device_name.into(),
            device_endianness: Endianness::default(),
            app_load_elf: app_load_elf.into(),
            app_symbol_elf: None,
            bl_load_elf: None,
            bl_symbol_elf: None,
            bl_symbol_addr: None,
            monitor_type: MonitorType::default(),
            jlink_interface: default_jlink_interface(),
            jlink_speed: default_jlink_speed(),
            jlink_serial: None,
            gdb_server_addr: None,
            gdb_server_port: default_gdb_server_port(),
            on_target_mem_model: MemModel::default(),
            on_target_mem_prestack_alloc_size: default_prestack_alloc_size(),
            on_target_mem_prestack_alloc_location: default_prestack_alloc_location(),
            on_target_mem_prestack_halt_location: default_prestack_halt_location(),
            on_target_mem_prestack_total_stack_size: 0,
            default_timeout_secs: default_timeout_secs(),
        }
    }

    /// Loads and validates a configuration from a TOML file.
    ///
    /// ## Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, is not valid
    /// TOML, or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError>
    {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading target configuration");
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_str(&text)
    }

    /// Parses and validates a configuration from TOML text.
    ///
    /// ## Errors
    ///
    /// Returns a [`ConfigError`] if the text is not valid TOML or fails
    /// validation.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError>
    {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks option values for internal consistency.
    ///
    /// ## Errors
    ///
    /// Returns a [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError>
    {
        if self.device_name.trim().is_empty()
        {
            return Err(ConfigError::MissingField("device_name"));
        }
        if self.app_load_elf.as_os_str().is_empty()
        {
            return Err(ConfigError::MissingField("app_load_elf"));
        }
        if self.jlink_speed == 0
        {
            return Err(ConfigError::Invalid {
                field: "jlink_speed",
                reason: "speed must be greater than zero".to_string(),
            });
        }
        if self.default_timeout_secs == 0
        {
            return Err(ConfigError::Invalid {
                field: "default_timeout_secs",
                reason: "timeout must be greater than zero".to_string(),
            });
        }
        if self.bl_symbol_elf.is_some() && self.bl_symbol_addr.is_none()
        {
            return Err(ConfigError::Invalid {
                field: "bl_symbol_addr",
                reason: "required when bl_symbol_elf is set".to_string(),
            });
        }
        if self.on_target_mem_model == MemModel::PreStack
        {
            let size = self.on_target_mem_prestack_alloc_size;
            if size == 0 || size % 4 != 0
            {
                return Err(ConfigError::Invalid {
                    field: "on_target_mem_prestack_alloc_size",
                    reason: format!("{size} is not a non-zero multiple of 4"),
                });
            }
            let total = self.on_target_mem_prestack_total_stack_size;
            if total != 0 && size > total
            {
                return Err(ConfigError::Invalid {
                    field: "on_target_mem_prestack_alloc_size",
                    reason: format!("carve-out of {size} bytes exceeds the {total}-byte stack"),
                });
            }
        }
        Ok(())
    }

    /// ELF that provides symbols and debug info for the application.
    #[must_use]
    pub fn symbol_elf(&self) -> &Path
    {
        self.app_symbol_elf.as_deref().unwrap_or(&self.app_load_elf)
    }

    /// Default deadline for blocking operations.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration
    {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults()
    {
        let config = TargetConfig::from_str(
            r#"
            device_name = "STM32F072RB"
            app_load_elf = "build/app.elf"
            "#,
        )
        .unwrap();

        assert_eq!(config.device_endianness, Endianness::Little);
        assert_eq!(config.monitor_type, MonitorType::Jlink);
        assert_eq!(config.jlink_interface, "SWD");
        assert_eq!(config.jlink_speed, 15000);
        assert_eq!(config.gdb_server_port, 2331);
        assert_eq!(config.on_target_mem_model, MemModel::TestHook);
        assert_eq!(config.on_target_mem_prestack_alloc_size, 256);
        assert_eq!(config.on_target_mem_prestack_alloc_location, "Reset_Handler");
        assert_eq!(config.on_target_mem_prestack_halt_location, "main");
        assert_eq!(config.default_timeout_secs, 5);
    }

    #[test]
    fn test_mem_model_values_parse()
    {
        for (text, model) in [
            ("NOALLOC", MemModel::NoAlloc),
            ("TESTHOOK", MemModel::TestHook),
            ("PRESTACK", MemModel::PreStack),
        ]
        {
            let config = TargetConfig::from_str(&format!(
                "device_name = \"d\"\napp_load_elf = \"a.elf\"\non_target_mem_model = \"{text}\"\n"
            ))
            .unwrap();
            assert_eq!(config.on_target_mem_model, model);
        }
    }

    #[test]
    fn test_missing_device_name_is_rejected()
    {
        let err = TargetConfig::from_str("app_load_elf = \"a.elf\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = TargetConfig::from_str("device_name = \"  \"\napp_load_elf = \"a.elf\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("device_name")));
    }

    #[test]
    fn test_prestack_size_must_be_word_multiple()
    {
        let err = TargetConfig::from_str(
            r#"
            device_name = "d"
            app_load_elf = "a.elf"
            on_target_mem_model = "PRESTACK"
            on_target_mem_prestack_alloc_size = 30
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "on_target_mem_prestack_alloc_size", .. }
        ));
    }

    #[test]
    fn test_bootloader_symbols_require_offset()
    {
        let err = TargetConfig::from_str(
            r#"
            device_name = "d"
            app_load_elf = "a.elf"
            bl_symbol_elf = "bl.elf"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "bl_symbol_addr", .. }));
    }
}
