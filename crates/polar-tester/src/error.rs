//! Error taxonomy for generation, validation, and persistence.
//!
//! A failed validation is *not* an error: it is returned as
//! [`Validation::Fail`](crate::validator::Validation::Fail) and consumed by the
//! retry loop. Everything here propagates to the caller.

use thiserror::Error;

/// Top-level error for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing inputs (empty context list, blank requirement,
    /// `max_attempts == 0`, unreadable config).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The model call failed, timed out, or returned unusable output.
    #[error("model error: {0}")]
    Model(String),

    /// The external validator could not be launched or did not finish.
    /// Distinct from a syntax failure so callers can tell "policy is wrong"
    /// from "tool is missing".
    #[error(
        "validator unavailable ({program}): {reason}. Install the validator CLI \
         or point `validator.command` at it"
    )]
    ValidatorUnavailable { program: String, reason: String },

    /// Append/read/write failure in the session store or event log.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error means the requested key/session does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Storage(StoreError::NotFound { .. }))
    }
}

/// Errors raised by [`SessionStore`](crate::store::SessionStore) backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {key}")]
    NotFound { key: String },

    /// Keys must be relative, `/`-separated, and free of `.`/`..` segments.
    #[error("invalid storage key: {key:?}")]
    InvalidKey { key: String },

    #[error("storage I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl StoreError {
    pub(crate) fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound { key: key.into() }
        } else {
            StoreError::Io {
                key: key.into(),
                source,
            }
        }
    }
}

/// Errors raised while loading or writing [`AppConfig`](crate::config::AppConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Figment(#[from] figment::Error),

    #[error("invalid configuration value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_io_maps_to_not_found() {
        let err = StoreError::io(
            "a/b",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, StoreError::NotFound { ref key } if key == "a/b"));
        assert!(Error::from(err).is_not_found());
    }

    #[test]
    fn config_error_becomes_configuration() {
        let err: Error = ConfigError::Invalid {
            field: "generation.max_attempts".into(),
            reason: "must be at least 1".into(),
        }
        .into();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("generation.max_attempts")));
    }

    #[test]
    fn validator_unavailable_mentions_remediation() {
        let err = Error::ValidatorUnavailable {
            program: "oso-cloud".into(),
            reason: "No such file or directory".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("oso-cloud"));
        assert!(msg.contains("validator.command"));
    }
}
