//! Expansion and recovery configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Code size of the generated sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Bitness {
    /// 32-bit protected mode (no qword index/value support yet)
    B32,
    /// 64-bit long mode
    #[default]
    B64,
}

impl Bitness {
    /// Bitness as understood by the encoder and decoder.
    pub fn bits(self) -> u32 {
        match self {
            Bitness::B32 => 32,
            Bitness::B64 => 64,
        }
    }

    /// Width of a general-purpose register in bytes.
    pub fn gpr_bytes(self) -> u32 {
        self.bits() / 8
    }

    pub fn is_64(self) -> bool {
        self == Bitness::B64
    }
}

impl TryFrom<u32> for Bitness {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            32 => Ok(Bitness::B32),
            64 => Ok(Bitness::B64),
            other => Err(format!("unsupported bitness {} (expected 32 or 64)", other)),
        }
    }
}

impl From<Bitness> for u32 {
    fn from(bitness: Bitness) -> Self {
        bitness.bits()
    }
}

/// Processor features that change the shape of the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorFeatures {
    /// zmm registers exist: the scratch vector is spilled as a zmm
    pub avx512: bool,
    /// 64-bit opmask instructions exist: the final mask clear uses kxorq
    pub avx512bw: bool,
}

impl Default for ProcessorFeatures {
    fn default() -> Self {
        Self {
            avx512: true,
            avx512bw: true,
        }
    }
}

/// Configuration shared by the expansion and recovery engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpandConfig {
    pub bitness: Bitness,
    pub features: ProcessorFeatures,
    /// TLS offset (fs/gs relative) holding the pointer to the thread's spill slot
    pub tls_spill_slot_offset: i32,
    /// Unrecognized instructions tolerated between two recovery states
    pub skip_unknown_max: u32,
    /// How far past the fault pc the recovery decoder may look
    pub lookahead_bytes: u64,
    /// Log every expanded sequence at debug level
    pub trace: bool,
}

impl Default for ExpandConfig {
    fn default() -> Self {
        Self {
            bitness: Bitness::B64,
            features: ProcessorFeatures::default(),
            tls_spill_slot_offset: 0x100,
            skip_unknown_max: 32,
            lookahead_bytes: 128,
            trace: false,
        }
    }
}

impl ExpandConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ExpandConfig = toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.features.avx512bw && !self.features.avx512 {
            return Err(ConfigError::Invalid(
                "avx512bw requires avx512".to_string(),
            ));
        }
        if self.skip_unknown_max == 0 {
            return Err(ConfigError::Invalid(
                "skip_unknown_max must be at least 1".to_string(),
            ));
        }
        if self.lookahead_bytes == 0 {
            return Err(ConfigError::Invalid(
                "lookahead_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Error loading a configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
