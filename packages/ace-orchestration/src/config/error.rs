use std::fmt::Display;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Why an `AceConfig` was rejected
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} = {value} is outside {min}..={max} ({hint})")]
    OutOfRange {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: &'static str,
    },

    #[error("{field} {reason}")]
    Invalid { field: String, reason: String },

    #[error("config has no 'version' key; start the file with 'version: 1'")]
    MissingVersion,

    #[error("config version {found} is not supported (expected one of {supported:?})")]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    pub fn out_of_range<T: Display>(
        field: impl Into<String>,
        value: impl Display,
        allowed: RangeInclusive<T>,
        hint: &'static str,
    ) -> Self {
        Self::OutOfRange {
            field: field.into(),
            value: value.to_string(),
            min: allowed.start().to_string(),
            max: allowed.end().to_string(),
            hint,
        }
    }

    /// Dotted path of the offending setting, when there is one
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::OutOfRange { field, .. } | Self::Invalid { field, .. } => Some(field),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_names_field_and_bounds() {
        let err = ConfigError::out_of_range("workers.count", 0, 1..=256, "need a worker");
        assert_eq!(err.field(), Some("workers.count"));
        assert_eq!(
            err.to_string(),
            "workers.count = 0 is outside 1..=256 (need a worker)"
        );
    }

    #[test]
    fn test_version_errors_have_no_field() {
        let err = ConfigError::UnsupportedVersion {
            found: 2,
            supported: vec![1],
        };
        assert!(err.to_string().contains("version 2"));
        assert!(err.field().is_none());
        assert!(ConfigError::MissingVersion.to_string().contains("version: 1"));
    }
}
