use std::time::SystemTime;

use crate::token::TokenCodec;
use crate::validate::{validate_delay, validate_link_url, validate_state, MAX_DELAY_SECONDS};
use crate::{
    CallbackScheduler, CallbackTask, Clock, DecodeError, LinkParameters, Token, ValidationError,
};

/// Input for issuing a new link. The delay is taken wide so out-of-range
/// values from the wire surface as validation errors rather than parse errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewLink {
    pub target_url: String,
    pub callback_url: String,
    pub delay_seconds: i64,
    pub state: Option<String>,
}

/// A freshly issued link token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedLink {
    pub token: Token,
    pub params: LinkParameters,
    pub expires_at: SystemTime,
}

/// Outcome of visiting a valid link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redirect {
    pub target_url: String,
    pub fire_at: SystemTime,
}

/// Application service issuing and resolving callback links.
///
/// Holds no per-link state: everything needed to resolve a link comes back
/// in its token. Resolution hands the callback to the scheduler and returns
/// without waiting on it.
pub struct LinkService<S: CallbackScheduler, C: Clock> {
    codec: TokenCodec,
    scheduler: S,
    clock: C,
    max_delay: u32,
}

impl<S: CallbackScheduler, C: Clock> LinkService<S, C> {
    pub fn new(codec: TokenCodec, scheduler: S, clock: C) -> Self {
        Self {
            codec,
            scheduler,
            clock,
            max_delay: MAX_DELAY_SECONDS,
        }
    }

    /// Override the upper delay bound (defaults to one hour).
    pub fn with_max_delay(mut self, max_delay: u32) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn max_delay(&self) -> u32 {
        self.max_delay
    }

    /// Validate the request and issue a signed token for it.
    pub fn create(&self, input: NewLink) -> Result<IssuedLink, ValidationError> {
        let target_url = validate_link_url("target_url", &input.target_url)?;
        let callback_url = validate_link_url("callback_url", &input.callback_url)?;
        let delay_seconds = validate_delay(input.delay_seconds, self.max_delay)?;
        if let Some(ref state) = input.state {
            validate_state(state)?;
        }

        let params = LinkParameters::new(
            target_url,
            callback_url,
            delay_seconds,
            self.clock.now(),
            input.state,
        );
        let token = self.codec.encode(&params);
        let expires_at = self.codec.expires_at(&params);
        Ok(IssuedLink {
            token,
            params,
            expires_at,
        })
    }

    /// Decode a visited token, schedule its callback relative to now, and
    /// return where to send the visitor. Rejected tokens schedule nothing.
    pub fn resolve(&self, token: &str) -> Result<Redirect, DecodeError> {
        let visited_at = self.clock.now();
        let params = self.codec.decode(token, visited_at)?;
        let fire_at = params.fire_at(visited_at);

        self.scheduler
            .schedule(CallbackTask::new(params.callback_url, fire_at, params.state));

        Ok(Redirect {
            target_url: params.target_url,
            fire_at,
        })
    }

    /// Decode a token without side effects.
    pub fn inspect(&self, token: &str) -> Result<LinkParameters, DecodeError> {
        self.codec.decode(token, self.clock.now())
    }
}
