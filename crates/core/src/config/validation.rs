use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl ConfigError {
    /// Create a missing required field error
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }

    /// Name of the offending field
    pub fn field(&self) -> &str {
        match self {
            Self::MissingRequired { field, .. } | Self::InvalidValue { field, .. } => field,
        }
    }
}

/// Check that a table name is a plain, unquoted SQL identifier.
///
/// The ledger table name is interpolated into SQL text, so anything beyond
/// `[A-Za-z_][A-Za-z0-9_]*` (max 63 bytes, the Postgres limit) is rejected.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), ConfigError> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && value.len() <= 63 {
        Ok(())
    } else {
        Err(ConfigError::invalid_value(
            field,
            value,
            "an identifier of letters, digits and underscores (max 63 characters)",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("table", "migrations").is_ok());
        assert!(validate_identifier("table", "_schema_history2").is_ok());

        assert!(validate_identifier("table", "").is_err());
        assert!(validate_identifier("table", "2fast").is_err());
        assert!(validate_identifier("table", "users; DROP TABLE x").is_err());
        assert!(validate_identifier("table", "public.migrations").is_err());
        assert!(validate_identifier("table", &"a".repeat(64)).is_err());
    }

    #[test]
    fn test_error_field_accessor() {
        let err = ConfigError::missing_required("database_url", "Set DATABASE_URL");
        assert_eq!(err.field(), "database_url");
        assert!(err.to_string().contains("Set DATABASE_URL"));
    }
}
