use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{Minutes, Source};
use crate::time::format_clock;

#[derive(Debug)]
pub enum EngineError {
    /// Tenant configuration could not be fetched. Never fatal: callers fall
    /// back to defaults.
    ConfigUnavailable(String),
    SourceUnavailable(Source, String),
    NoAlternativeFound {
        date: NaiveDate,
        start: Minutes,
    },
    InvalidRequest(&'static str),
    NotFound(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ConfigUnavailable(e) => write!(f, "configuration unavailable: {e}"),
            EngineError::SourceUnavailable(source, e) => {
                write!(f, "{source} commitment source unavailable: {e}")
            }
            EngineError::NoAlternativeFound { date, start } => write!(
                f,
                "no alternative found for {date} {}",
                format_clock(*start)
            ),
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
