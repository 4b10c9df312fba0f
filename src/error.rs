//! Error types for tidepool.

use std::path::PathBuf;

use thiserror::Error;

use crate::worker::WorkerId;

/// Main error type for tidepool.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to spawn worker {id}: {message}")]
    Spawn { id: WorkerId, message: String },

    #[error("Worker {id} failed to become ready after {attempts} attempts: {reason}")]
    StartupFailed {
        id: WorkerId,
        attempts: u32,
        reason: String,
    },

    #[error("Timed out waiting for workers: {ready} of {expected} reported listening")]
    ReadinessTimeout { ready: usize, expected: usize },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Invalid worker bootstrap: {0}")]
    Bootstrap(String),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No live workers remain in the pool")]
    NoLiveWorkers,

    #[error("Shared region {} is invalid: {reason}", .path.display())]
    InvalidRegion { path: PathBuf, reason: String },

    #[error("Counter store is full ({capacity} keys)")]
    StoreFull { capacity: usize },

    #[error("Invalid counter key '{0}'")]
    InvalidKey(String),

    #[error("Counter key '{key}' exceeds {max} bytes")]
    KeyTooLong { key: String, max: usize },

    #[error("Request to worker {target} timed out")]
    RequestTimeout { target: WorkerId },
}

/// Result type alias for tidepool operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_startup_failed_message() {
        let err = ClusterError::StartupFailed {
            id: WorkerId(2),
            attempts: 4,
            reason: "exited with code 3".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Worker 2"));
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("code 3"));
    }

    #[test]
    fn test_readiness_timeout_message() {
        let err = ClusterError::ReadinessTimeout {
            ready: 1,
            expected: 3,
        };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for workers: 1 of 3 reported listening"
        );
    }

    #[test]
    fn test_key_too_long_message() {
        let err = ClusterError::KeyTooLong {
            key: "requests.x".to_string(),
            max: 104,
        };
        let msg = err.to_string();
        assert!(msg.contains("requests.x"));
        assert!(msg.contains("104"));
    }

    #[test]
    fn test_invalid_region_message() {
        let err = ClusterError::InvalidRegion {
            path: PathBuf::from("/tmp/counters.shm"),
            reason: "bad magic".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/counters.shm"));
        assert!(msg.contains("bad magic"));
    }

    #[test]
    fn test_bind_message_names_address() {
        let err = ClusterError::Bind {
            address: "unix:/run/tp/worker-0-1.sock".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Failed to bind unix:/run/tp/worker-0-1.sock"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let err: ClusterError = io_err.into();
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: ClusterError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }
}
