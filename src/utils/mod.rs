//! Shared utilities: the error taxonomy and logging initialisation.

pub mod error;
pub mod logging;

pub use error::{BrokerError, ClientError, StorageError};

#[cfg(test)]
mod tests {
    use super::logging;
    use super::{BrokerError, StorageError};

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warning");
        logging::init("nonsense");
    }

    #[test]
    fn storage_error_converts_into_broker_error() {
        let err: BrokerError = StorageError::InvalidOption {
            key: "path".to_string(),
            reason: "must not be empty".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "storage error: invalid storage option `path`: must not be empty"
        );
    }
}
