//! Input validation for link creation. Keep logic minimal and deterministic.

use url::Url;

use crate::ValidationError;

/// Longest URL accepted for either the target or the callback.
pub const MAX_URL_LEN: usize = 2048;

/// Upper bound for the callback delay.
pub const MAX_DELAY_SECONDS: u32 = 3600;

/// Longest opaque state value carried in a token.
pub const MAX_STATE_LEN: usize = 256;

/// Validate an absolute http/https URL and return its normalized (ASCII)
/// serialization. `field` names the input in the error.
pub fn validate_link_url(field: &'static str, s: &str) -> Result<String, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidUrl {
        field,
        reason: reason.to_string(),
    };

    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    if trimmed.len() > MAX_URL_LEN {
        return Err(invalid("too long"));
    }
    let url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(url.into())
}

/// Check `1 <= delay <= max` and narrow to the stored width.
pub fn validate_delay(delay: i64, max: u32) -> Result<u32, ValidationError> {
    if delay < 1 || delay > i64::from(max) {
        return Err(ValidationError::DelayOutOfRange { delay, max });
    }
    u32::try_from(delay).map_err(|_| ValidationError::DelayOutOfRange { delay, max })
}

pub fn validate_state(s: &str) -> Result<(), ValidationError> {
    if s.len() > MAX_STATE_LEN {
        return Err(ValidationError::InvalidState(format!(
            "longer than {MAX_STATE_LEN} bytes"
        )));
    }
    if s.chars().any(char::is_control) {
        return Err(ValidationError::InvalidState(
            "control characters not allowed".into(),
        ));
    }
    Ok(())
}
