//! Shared HTTP utilities for the callback-link workspace.
//!
//! Provides common error bodies, base-URL derivation, link building, and time
//! formatting used by api-server and callback-dispatcher.

use chrono::{DateTime, SecondsFormat, Utc};
use std::time::SystemTime;

// ============================================================================
// JSON Response Helpers (framework-agnostic)
// ============================================================================

/// Create a structured error JSON with a default message based on the code.
///
/// Returns: `{"error": {"code": "<code>", "message": "<default message>"}}`
pub fn json_err(code: &str) -> serde_json::Value {
    let message = match code {
        "not_found" => "Resource not found",
        "bad_request" => "Bad request",
        "invalid_link" => "Link is invalid",
        "link_expired" => "Link has expired",
        "error" | "internal" => "Internal server error",
        _ => code, // Fallback to code as message for unknown codes
    };
    serde_json::json!({"error": {"code": code, "message": message}})
}

/// Create a structured error JSON with a custom message.
///
/// Returns: `{"error": {"code": "<code>", "message": "<message>"}}`
pub fn json_error_with_message(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({"error": {"code": code, "message": message}})
}

// ============================================================================
// URL Building
// ============================================================================

/// Path prefix under which link tokens are served.
pub const REDIRECT_PREFIX: &str = "/r/";

/// Derive the public base URL of a request.
///
/// Preference order: `X-Forwarded-Proto` + `X-Forwarded-Host` (both required),
/// then `Host` with `default_scheme`. Returns an empty string if neither is
/// available, which yields root-relative links.
pub fn base_url_from_headers(
    forwarded_proto: Option<&str>,
    forwarded_host: Option<&str>,
    host: Option<&str>,
    default_scheme: &str,
) -> String {
    fn non_empty(v: Option<&str>) -> Option<&str> {
        v.map(str::trim).filter(|s| !s.is_empty())
    }

    if let (Some(proto), Some(fhost)) = (non_empty(forwarded_proto), non_empty(forwarded_host)) {
        // Proxies may append a chain: "https, http". The first hop is the client's.
        let proto = proto.split(',').next().unwrap_or(proto).trim();
        let fhost = fhost.split(',').next().unwrap_or(fhost).trim();
        return format!("{}://{}", proto, fhost);
    }
    match non_empty(host) {
        Some(h) => format!("{}://{}", default_scheme, h),
        None => String::new(),
    }
}

/// Build the visitor-facing link for a token: `<base>/r/<token>`.
pub fn build_link_url(base: &str, token: &str) -> String {
    format!("{}{}{}", base.trim_end_matches('/'), REDIRECT_PREFIX, token)
}

// ============================================================================
// Time Utilities
// ============================================================================

/// Convert SystemTime to RFC3339 string (seconds precision, UTC).
pub fn system_time_to_rfc3339(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC3339 string to SystemTime.
///
/// Returns an error if the string is not a valid RFC3339 timestamp.
pub fn rfc3339_to_system_time(s: &str) -> Result<SystemTime, chrono::ParseError> {
    let dt = DateTime::parse_from_rfc3339(s)?;
    Ok(dt.with_timezone(&Utc).into())
}
