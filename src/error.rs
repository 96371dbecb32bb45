//! Unified error type for every control-plane operation.
//!
//! `AppError` is returned by local components and by their RPC proxies alike.
//! It serializes as `{ "kind": "...", "message": "..." }`, the same shape an
//! RPC error reply carries, so a client can rebuild the variant the master
//! produced with [`AppError::from_kind`].

use serde::ser::SerializeStruct;

/// Application-level error shared by master and client code paths.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// The driver device is absent, was removed, or is held by another master.
    #[error("{0}")]
    DeviceUnavailable(String),

    /// A binary log record or RPC frame could not be decoded.
    #[error("{0}")]
    MalformedRecord(String),

    /// The control channel dropped while a call was waiting for its reply.
    #[error("{0}")]
    TransportLost(String),

    /// No master is connected; calls that need one are rejected.
    #[error("{0}")]
    MasterUnavailable(String),

    /// The statistics store rejected a write. Pending deltas are kept.
    #[error("{0}")]
    WriteFailure(String),

    /// Errors originating from SQLite / database reads and schema setup.
    #[error("{0}")]
    Database(String),

    /// I/O and OS-level errors (sockets, lock files, worker pool).
    #[error("{0}")]
    Io(String),

    /// Invalid or missing input, locally or in an RPC argument list.
    #[error("{0}")]
    InvalidInput(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::DeviceUnavailable(_) => "DeviceUnavailable",
            AppError::MalformedRecord(_) => "MalformedRecord",
            AppError::TransportLost(_) => "TransportLost",
            AppError::MasterUnavailable(_) => "MasterUnavailable",
            AppError::WriteFailure(_) => "WriteFailure",
            AppError::Database(_) => "Database",
            AppError::Io(_) => "Io",
            AppError::InvalidInput(_) => "InvalidInput",
        }
    }

    /// Rebuilds an error from its `kind` / `message` pair.
    ///
    /// Unknown kinds (a newer master talking to an older client) map to `Io`.
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "DeviceUnavailable" => AppError::DeviceUnavailable(message),
            "MalformedRecord" => AppError::MalformedRecord(message),
            "TransportLost" => AppError::TransportLost(message),
            "MasterUnavailable" => AppError::MasterUnavailable(message),
            "WriteFailure" => AppError::WriteFailure(message),
            "Database" => AppError::Database(message),
            "InvalidInput" => AppError::InvalidInput(message),
            _ => AppError::Io(message),
        }
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Database(format!("{err:#}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Io(format!("worker task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<AppError> {
        vec![
            AppError::DeviceUnavailable("a".into()),
            AppError::MalformedRecord("b".into()),
            AppError::TransportLost("c".into()),
            AppError::MasterUnavailable("d".into()),
            AppError::WriteFailure("e".into()),
            AppError::Database("f".into()),
            AppError::Io("g".into()),
            AppError::InvalidInput("h".into()),
        ]
    }

    #[test]
    fn test_error_kind_returns_correct_variant_name() {
        assert_eq!(
            AppError::DeviceUnavailable("x".into()).kind(),
            "DeviceUnavailable"
        );
        assert_eq!(AppError::TransportLost("x".into()).kind(), "TransportLost");
        assert_eq!(AppError::WriteFailure("x".into()).kind(), "WriteFailure");
        assert_eq!(AppError::InvalidInput("x".into()).kind(), "InvalidInput");
    }

    #[test]
    fn test_error_display_shows_message() {
        let err = AppError::DeviceUnavailable("driver removed".into());
        assert_eq!(err.to_string(), "driver removed");
    }

    #[test]
    fn test_from_kind_round_trips_every_variant() {
        for err in all_variants() {
            let rebuilt = AppError::from_kind(err.kind(), err.to_string());
            assert_eq!(rebuilt, err);
        }
    }

    #[test]
    fn test_from_kind_unknown_falls_back_to_io() {
        let err = AppError::from_kind("SomethingNew", "boom");
        assert_eq!(err, AppError::Io("boom".into()));
    }

    #[test]
    fn test_error_serializes_as_kind_and_message() {
        let err = AppError::MasterUnavailable("not connected".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "MasterUnavailable");
        assert_eq!(json["message"], "not connected");
    }

    #[test]
    fn test_from_anyhow_produces_database_variant() {
        let app_err: AppError = anyhow::anyhow!("sqlite busy").into();
        assert_eq!(app_err.kind(), "Database");
        assert!(app_err.to_string().contains("sqlite busy"));
    }

    #[test]
    fn test_from_io_error_produces_io_variant() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "socket missing");
        let app_err: AppError = io_err.into();
        assert_eq!(app_err.kind(), "Io");
        assert!(app_err.to_string().contains("socket missing"));
    }
}
