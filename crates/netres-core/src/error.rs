use thiserror::Error;

use crate::types::AssetField;

/// Top-level error type for configuration and shared types.
#[derive(Error, Debug)]
pub enum NetresError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template field `{0}` is missing")]
    MissingTemplateField(AssetField),

    #[error("Template field `{field}` is invalid: {reason}")]
    InvalidTemplateField { field: AssetField, reason: String },
}

impl From<config::ConfigError> for NetresError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
