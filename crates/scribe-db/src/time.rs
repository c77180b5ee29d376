//! Timestamp helpers.
//!
//! All application-written timestamps share one fixed-width UTC format so
//! that string comparison in SQL orders them chronologically.

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats an instant as `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The current time in the shared format.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}
