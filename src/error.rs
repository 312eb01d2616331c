use thiserror::Error;

/// Library errors using thiserror for structured error handling.
///
/// Delivery faults never show up here: they are logged and contained where
/// they happen. These variants cover misuse and environment failures.

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Illegal call to {operation} on disposed watcher '{owner}'")]
    IllegalCall {
        operation: &'static str,
        owner: String,
    },

    #[error("Failed to spawn delivery thread for '{owner}'")]
    ThreadSpawn {
        owner: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from {path}")]
    LoadFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed to save configuration to {path}")]
    SaveFailed {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Type alias for application Results using anyhow for context chaining
pub type AppResult<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = MessagingError::IllegalCall {
            operation: "start",
            owner: "device-watcher".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Illegal call to start on disposed watcher 'device-watcher'"
        );

        let err = ConfigError::Invalid("stack size is zero".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: stack size is zero");
    }

    #[test]
    fn test_error_source_chain() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let config_err = ConfigError::LoadFailed {
            path: "/test/media-bus.json".to_string(),
            source: Box::new(io_err),
        };

        assert!(config_err.source().is_some());
        assert_eq!(
            config_err.to_string(),
            "Failed to load configuration from /test/media-bus.json"
        );

        let spawn_err = MessagingError::ThreadSpawn {
            owner: "queue".to_string(),
            source: io::Error::new(io::ErrorKind::Other, "no threads left"),
        };
        assert!(spawn_err.source().is_some());
    }
}
