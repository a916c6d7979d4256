use thiserror::Error;

/// Unified error type for the platform.
///
/// Validation and not-found variants carry a machine-readable `code`
/// (e.g. `invalid_path`, `unknown_data_sharing`) next to a human message so
/// the REST layer can surface both.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("{message}")]
    Validation { code: String, message: String },

    #[error("{message}")]
    NotFound { code: String, message: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("schema decode error: {0}")]
    SchemaDecode(String),

    #[error("schema flatten error: {0}")]
    SchemaFlatten(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("federation error: {0}")]
    Federation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = DbError> = std::result::Result<T, E>;

impl DbError {
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        DbError::Validation {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        DbError::NotFound {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Machine-readable code surfaced to API callers.
    pub fn code(&self) -> &str {
        match self {
            DbError::Validation { code, .. } | DbError::NotFound { code, .. } => code,
            DbError::Unauthorized(_) => "unauthorized",
            DbError::Forbidden(_) => "forbidden",
            DbError::SchemaDecode(_) => "invalid_schema",
            DbError::SchemaFlatten(_) => "invalid_schema",
            DbError::Config(_) => "configuration_error",
            DbError::Federation(_) | DbError::Http(_) => "federation_error",
            DbError::Storage(_) => "storage_error",
            DbError::Serialization(_) => "invalid_json",
            DbError::Io(_) => "io_error",
        }
    }

    /// HTTP status class for this error.
    pub fn status(&self) -> u16 {
        match self {
            DbError::Validation { .. }
            | DbError::NotFound { .. }
            | DbError::SchemaDecode(_)
            | DbError::SchemaFlatten(_)
            | DbError::Serialization(_) => 400,
            DbError::Unauthorized(_) => 401,
            DbError::Forbidden(_) => 403,
            DbError::Federation(_) | DbError::Http(_) => 502,
            DbError::Config(_) | DbError::Storage(_) | DbError::Io(_) => 500,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, DbError::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_status() {
        let err = DbError::validation("invalid_path", "Invalid path: foo");
        assert_eq!(err.code(), "invalid_path");
        assert_eq!(err.status(), 400);
        assert_eq!(err.to_string(), "Invalid path: foo");

        let err = DbError::Federation("peer unreachable".to_string());
        assert_eq!(err.code(), "federation_error");
        assert_eq!(err.status(), 502);

        assert_eq!(DbError::Config("x".into()).status(), 500);
    }
}
