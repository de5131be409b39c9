//! Error types for the transfer subsystem.

use thiserror::Error;

/// Result type alias for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Error variants for plugin resolution, connection setup and blob transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No plugin is registered under the requested id.
    #[error("plugin not found: {id}")]
    PluginNotFound {
        /// The plugin id that was requested.
        id: String,
    },

    /// A plugin with the same id is already registered.
    #[error("plugin already registered: {id}")]
    DuplicatePlugin {
        /// The conflicting plugin id.
        id: String,
    },

    /// Connection settings are missing, unknown or malformed.
    #[error("invalid settings for plugin '{plugin}': {reason}")]
    InvalidSettings {
        /// The plugin that rejected the settings.
        plugin: String,
        /// Description of the problem.
        reason: String,
    },

    /// The connection was used before `init` succeeded.
    #[error("connection for plugin '{plugin}' is not configured")]
    NotConfigured {
        /// The plugin owning the connection.
        plugin: String,
    },

    /// The remote repository does not exist and was not allowed to be created.
    #[error("repository not found at {location}")]
    RepositoryNotFound {
        /// Backend-specific repository location.
        location: String,
    },

    /// A remote object name contains characters the backends cannot store.
    #[error("invalid remote file name: {name:?}")]
    InvalidRemoteName {
        /// The rejected name.
        name: String,
    },

    /// The requested remote object does not exist.
    #[error("remote file not found: {name}")]
    NotFound {
        /// The missing remote name.
        name: String,
    },

    /// The backend rejected the credentials or access rights.
    #[error("permission denied on {location}: {reason}")]
    PermissionDenied {
        /// Backend-specific location.
        location: String,
        /// Description from the backend.
        reason: String,
    },

    /// Failure injected by a fault-injecting transfer manager.
    #[error("injected failure for operation '{operation}'")]
    Injected {
        /// Description of the failed operation.
        operation: String,
    },

    /// Wraps standard I/O errors from the backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// True for transient failures worth retrying (network, I/O, injected faults).
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput
            ),
            TransferError::Injected { .. } => true,
            TransferError::PluginNotFound { .. }
            | TransferError::DuplicatePlugin { .. }
            | TransferError::InvalidSettings { .. }
            | TransferError::NotConfigured { .. }
            | TransferError::RepositoryNotFound { .. }
            | TransferError::InvalidRemoteName { .. }
            | TransferError::NotFound { .. }
            | TransferError::PermissionDenied { .. } => false,
        }
    }

    /// True for errors caused by setup (unknown plugin, bad settings).
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            TransferError::PluginNotFound { .. }
                | TransferError::DuplicatePlugin { .. }
                | TransferError::InvalidSettings { .. }
                | TransferError::NotConfigured { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_not_found_message() {
        let err = TransferError::PluginNotFound {
            id: "ftp".to_string(),
        };
        assert_eq!(format!("{}", err), "plugin not found: ftp");
        assert!(err.is_configuration_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_settings_message() {
        let err = TransferError::InvalidSettings {
            plugin: "local".to_string(),
            reason: "missing required setting 'path'".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("local"));
        assert!(msg.contains("path"));
    }

    #[test]
    fn test_io_errors_are_retryable() {
        let err = TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "slow disk",
        ));
        assert!(err.is_retryable());

        let denied = TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only",
        ));
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_injected_is_retryable() {
        let err = TransferError::Injected {
            operation: "rel=1 op=upload remote=x".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(!TransferError::NotFound {
            name: "x".to_string()
        }
        .is_retryable());
        assert!(!TransferError::PermissionDenied {
            location: "/repo".to_string(),
            reason: "token rejected".to_string(),
        }
        .is_retryable());
    }
}
