use crate::aple::{ApleOptions, PermutationOptions};
use crate::logdet::LogDetMethod;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogDetOptions {
    pub method: LogDetMethod,
}

/// Every tunable of an analysis run, read from and written to TOML.
///
/// Missing tables and keys fall back to their defaults, so an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub aple: ApleOptions,
    pub permutation: PermutationOptions,
    pub log_det: LogDetOptions,
}

impl AnalysisConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.aple.mean_tolerance.is_finite() && self.aple.mean_tolerance >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "aple.mean_tolerance must be a non-negative number, got {}",
                self.aple.mean_tolerance
            )));
        }
        if self.permutation.simulations == 0 {
            return Err(ConfigError::Invalid(
                "permutation.simulations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
