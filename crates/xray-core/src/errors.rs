//! Error types for the xray core library.

/// Top-level error enum for the xray core library.
#[derive(Debug, thiserror::Error)]
pub enum XrayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Graph inconsistency in {source_name}: {detail}")]
    GraphInconsistency { source_name: String, detail: String },

    #[error("Computation failed for {key}: {message}")]
    ComputationFailed { key: String, message: String },

    #[error("Timed out after {seconds}s: {what}")]
    Timeout { what: String, seconds: u64 },

    #[error("Analyzer error: {0}")]
    Analyzer(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Introspection error: {0}")]
    Introspection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl XrayError {
    /// Shorthand for a fatal stitching error.
    pub fn inconsistency(source_name: impl Into<String>, detail: impl Into<String>) -> Self {
        XrayError::GraphInconsistency {
            source_name: source_name.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(feature = "python")]
impl From<XrayError> for pyo3::PyErr {
    fn from(err: XrayError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyIOError, PyRuntimeError, PyTimeoutError, PyValueError};
        match &err {
            XrayError::Io(_) => PyIOError::new_err(err.to_string()),
            XrayError::Timeout { .. } => PyTimeoutError::new_err(err.to_string()),
            XrayError::Config(_)
            | XrayError::Json(_)
            | XrayError::Toml(_)
            | XrayError::NotFound(_)
            | XrayError::GraphInconsistency { .. } => PyValueError::new_err(err.to_string()),
            XrayError::Sqlite(_)
            | XrayError::ComputationFailed { .. }
            | XrayError::Analyzer(_)
            | XrayError::Introspection(_) => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

pub type XrayResult<T> = Result<T, XrayError>;
