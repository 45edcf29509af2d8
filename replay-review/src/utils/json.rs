//! JSON decoding helpers with consistent warning logs.
//!
//! Used where a malformed record should be skipped (and logged) instead of
//! failing the whole operation, e.g. one corrupt job file during a listing.

use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub enum JsonContext<'a> {
    JobFile { path: &'a Path },
    JobPayload { job_id: &'a str, field: &'static str },
    CacheEntry { session_id: &'a str },
    SlotLock { path: &'a Path },
    AnalysisFile { kind: &'static str, path: &'a Path },
}

fn warn_parse_error(raw_len: usize, error: serde_json::Error, ctx: JsonContext<'_>, msg: &'static str) {
    match ctx {
        JsonContext::JobFile { path } => {
            warn!(path = %path.display(), raw_len, error = %error, "{msg}");
        }
        JsonContext::JobPayload { job_id, field } => {
            warn!(job_id = %job_id, field, raw_len, error = %error, "{msg}");
        }
        JsonContext::CacheEntry { session_id } => {
            warn!(session_id = %session_id, raw_len, error = %error, "{msg}");
        }
        JsonContext::SlotLock { path } => {
            warn!(path = %path.display(), raw_len, error = %error, "{msg}");
        }
        JsonContext::AnalysisFile { kind, path } => {
            warn!(kind, path = %path.display(), raw_len, error = %error, "{msg}");
        }
    }
}

/// Decode `raw`, logging and returning `None` on failure.
pub fn parse_bytes<T: DeserializeOwned>(
    raw: &[u8],
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> Option<T> {
    match serde_json::from_slice(raw) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn_parse_error(raw.len(), error, ctx, msg);
            None
        }
    }
}

/// Decode an already-parsed JSON value, logging and returning `None` on failure.
pub fn parse_value<T: DeserializeOwned>(
    value: &serde_json::Value,
    ctx: JsonContext<'_>,
    msg: &'static str,
) -> Option<T> {
    match T::deserialize(value) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn_parse_error(value.to_string().len(), error, ctx, msg);
            None
        }
    }
}
