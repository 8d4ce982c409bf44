//! Error type for cluster operations.

use thiserror::Error;

/// The single error kind every public operation returns.
///
/// Backend diagnostics are aggregated into one comma-joined line; locally
/// raised failures carry a descriptive message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HiveError {
    message: String,
}

impl HiveError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: flatten(message.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result type alias for cluster operations.
pub type HiveResult<T> = Result<T, HiveError>;

/// Collapse a multi-line diagnostic into a single comma-joined line.
fn flatten(raw: String) -> String {
    if !raw.contains('\n') {
        return raw;
    }
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<tokio_postgres::Error> for HiveError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => {
                let mut parts = vec![db.severity().to_string(), db.message().to_string()];
                if let Some(detail) = db.detail() {
                    parts.push(detail.to_string());
                }
                Self::new(parts.join(", "))
            }
            None => Self::new(err.to_string()),
        }
    }
}
