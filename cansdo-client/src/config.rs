use std::{path::Path, time::Duration};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::common::sdo::MAX_BLOCK_SIZE;

/// Error returned when loading client configuration
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The file could not be read
    #[snafu(display("IO error loading {path}: {source:?}"))]
    Io {
        /// Path of the file
        path: String,
        /// The underlying error
        source: std::io::Error,
    },
    /// The file is not valid TOML, or has unknown or mistyped fields
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization {
        /// The underlying error
        source: toml::de::Error,
    },
    /// A value is out of range
    #[snafu(display("Invalid value for {field}: {reason}"))]
    InvalidValue {
        /// Name of the offending field
        field: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

fn default_block_size() -> u8 {
    MAX_BLOCK_SIZE
}

fn default_crc() -> bool {
    true
}

fn default_retries() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    50
}

/// Tunables for an [`SdoClient`](crate::SdoClient)
///
/// Can be loaded from TOML. Every field is optional:
///
/// ```toml
/// prefer_block = true
/// block_size = 64
/// crc = true
/// pst = 8
/// retries = 3
/// timeout_ms = 50
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SdoClientConfig {
    /// Use block transfers for values which do not fit in an expedited transfer
    #[serde(default)]
    pub prefer_block: bool,
    /// Segments per sub-block requested for block uploads (1..=127)
    #[serde(default = "default_block_size")]
    pub block_size: u8,
    /// Request CRC checking of block transfers
    #[serde(default = "default_crc")]
    pub crc: bool,
    /// Protocol switch threshold for block uploads
    ///
    /// A server may answer a block upload of a value no longer than this with a regular upload. 0
    /// disables the switch.
    #[serde(default)]
    pub pst: u8,
    /// Number of times a request is sent before giving up on a response
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// How long to wait for each response
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SdoClientConfig {
    fn default() -> Self {
        Self {
            prefer_block: false,
            block_size: default_block_size(),
            crc: default_crc(),
            pst: 0,
            retries: default_retries(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl SdoClientConfig {
    /// Read a configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<SdoClientConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Read a configuration from a string
    pub fn from_toml_str(s: &str) -> Result<SdoClientConfig, ConfigError> {
        let config: SdoClientConfig = toml::from_str(s).context(TomlDeserializationSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that all values are in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return InvalidValueSnafu {
                field: "block_size",
                reason: "must be between 1 and 127",
            }
            .fail();
        }
        if self.retries == 0 {
            return InvalidValueSnafu {
                field: "retries",
                reason: "must be at least 1",
            }
            .fail();
        }
        if self.timeout_ms == 0 {
            return InvalidValueSnafu {
                field: "timeout_ms",
                reason: "must be at least 1",
            }
            .fail();
        }
        Ok(())
    }

    /// The response timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
