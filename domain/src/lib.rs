//! Domain library for the callback-link service.
//!
//! Holds the link data model, the ports (traits) the service depends on, the
//! signed token codec, and the error definitions. The crate performs no IO:
//! HTTP delivery of callbacks lives in the `callback-dispatcher` adapter and
//! the HTTP surface lives in `api-server`.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Parameters of an issued link. The token is the only place these live once
/// the link has been handed out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkParameters {
    pub target_url: String,
    pub callback_url: String,
    pub delay_seconds: u32,
    /// Second precision; sub-second parts are dropped on construction.
    pub issued_at: SystemTime,
    /// Opaque caller value echoed back in the callback body.
    pub state: Option<String>,
}

impl LinkParameters {
    pub fn new(
        target_url: String,
        callback_url: String,
        delay_seconds: u32,
        issued_at: SystemTime,
        state: Option<String>,
    ) -> Self {
        Self {
            target_url,
            callback_url,
            delay_seconds,
            issued_at: token::truncate_to_secs(issued_at),
            state,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.delay_seconds))
    }

    /// When the callback for a visit at `visited_at` becomes due.
    pub fn fire_at(&self, visited_at: SystemTime) -> SystemTime {
        visited_at + self.delay()
    }
}

/// Opaque, signed encoding of [`LinkParameters`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pending outbound callback. Lives only in memory, owned by whichever
/// scheduler accepted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackTask {
    pub callback_url: String,
    pub fire_at: SystemTime,
    /// Delivery attempts made so far.
    pub attempt_count: u32,
    pub state: Option<String>,
}

impl CallbackTask {
    pub fn new(callback_url: String, fire_at: SystemTime, state: Option<String>) -> Self {
        Self {
            callback_url,
            fire_at,
            attempt_count: 0,
            state,
        }
    }
}

/// Time source abstraction to make code testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Port for deferred callback delivery.
///
/// `schedule` must return without waiting for the task to fire or for any
/// network IO.
pub trait CallbackScheduler: Send + Sync {
    fn schedule(&self, task: CallbackTask);
}

impl<T: CallbackScheduler + ?Sized> CallbackScheduler for Arc<T> {
    fn schedule(&self, task: CallbackTask) {
        (**self).schedule(task)
    }
}

/// Why a token was rejected at redirect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed link token")]
    Malformed,
    #[error("link token signature invalid")]
    SignatureInvalid,
    #[error("link token expired")]
    Expired,
}

/// Why a creation request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },
    #[error("delay must be between 1 and {max} seconds, got {delay}")]
    DelayOutOfRange { delay: i64, max: u32 },
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Return a short about/version line for the binary to print.
pub fn about() -> String {
    let pkg = env!("CARGO_PKG_NAME");
    let ver = env!("CARGO_PKG_VERSION");
    format!("{} v{} - callback link tokens", pkg, ver)
}

pub mod adapters;
pub mod service;
pub mod token;
pub mod validate;
