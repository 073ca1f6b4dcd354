//! Configuration and start-up error types

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL for {field}: {value}")]
    InvalidUrl { field: &'static str, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = Error::Config("max_attempts must be greater than 0".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: max_attempts must be greater than 0"
        );
    }

    #[test]
    fn invalid_url_names_the_field() {
        let err = Error::InvalidUrl {
            field: "realtime.url",
            value: "http://example.com/ws".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("realtime.url"), "got: {msg}");
        assert!(msg.contains("http://example.com/ws"), "got: {msg}");
    }

    #[test]
    fn io_error_converts() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
    }
}
