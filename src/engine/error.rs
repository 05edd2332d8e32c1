use crate::config::ConfigError;
use crate::store::StoreError;

/// Why a report could not be produced. Any stage failing fails the report;
/// partial output is never returned.
#[derive(Debug)]
pub enum ReportError {
    StoreUnavailable(String),
    StoreQueryFailed { query: &'static str, message: String },
    ConfigurationMissing(String),
    /// The report timestamp cannot be placed on the calendar.
    ClockOutOfRange(i64),
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            ReportError::StoreQueryFailed { query, message } => {
                write!(f, "store query {query} failed: {message}")
            }
            ReportError::ConfigurationMissing(msg) => {
                write!(f, "configuration missing: {msg}")
            }
            ReportError::ClockOutOfRange(now) => write!(f, "timestamp {now} out of calendar range"),
        }
    }
}

impl std::error::Error for ReportError {}

impl From<StoreError> for ReportError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => ReportError::StoreUnavailable(msg),
            StoreError::QueryFailed { query, message } => {
                ReportError::StoreQueryFailed { query, message }
            }
        }
    }
}

impl From<ConfigError> for ReportError {
    fn from(e: ConfigError) -> Self {
        ReportError::ConfigurationMissing(e.to_string())
    }
}
