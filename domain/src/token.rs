//! Signed link tokens.
//!
//! Format: `<payload>.<signature>` where `payload` is the unpadded base64url
//! encoding of a compact JSON claims object and `signature` is the unpadded
//! base64url HMAC-SHA256 over `<payload>.` (separator included).
//!
//! The signature is checked before the payload is parsed, so a damaged token
//! is reported as `SignatureInvalid` and never decodes into other parameters.
//! The separator sits inside the signed bytes, so a token of plausible length
//! with a missing or displaced `.` counts as tampered, not malformed.
//! `Malformed` covers input too short or non-ASCII to split, and a correctly
//! signed payload that is not valid claims.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{DecodeError, LinkParameters, Token};

type HmacSha256 = Hmac<Sha256>;

/// Shortest accepted signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// How long an unvisited link stays valid unless configured otherwise.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// 32-byte MAC in unpadded base64url.
const SIGNATURE_B64_LEN: usize = 43;
const SEPARATOR: char = '.';

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    t: String,
    c: String,
    d: u32,
    iat: u64,
    exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("signing secret must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,
    #[error("token lifetime must be at least one second")]
    ZeroLifetime,
}

/// Encodes and verifies link tokens with a process-wide secret.
///
/// The codec is immutable once built; share it behind an `Arc` or clone it
/// (cloning copies the keyed MAC state, not the secret bytes themselves).
#[derive(Clone)]
pub struct TokenCodec {
    mac: HmacSha256,
    lifetime: Duration,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: impl AsRef<[u8]>, lifetime: Duration) -> Result<Self, CodecError> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LEN {
            return Err(CodecError::WeakSecret);
        }
        if lifetime.as_secs() == 0 {
            return Err(CodecError::ZeroLifetime);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| CodecError::WeakSecret)?;
        Ok(Self { mac, lifetime })
    }

    /// Instant after which a token for `params` is rejected as expired.
    pub fn expires_at(&self, params: &LinkParameters) -> SystemTime {
        from_unix_secs(self.expiry_secs(params))
    }

    fn expiry_secs(&self, params: &LinkParameters) -> u64 {
        unix_secs(params.issued_at).saturating_add(self.lifetime.as_secs())
    }

    pub fn encode(&self, params: &LinkParameters) -> Token {
        let claims = Claims {
            t: params.target_url.clone(),
            c: params.callback_url.clone(),
            d: params.delay_seconds,
            iat: unix_secs(params.issued_at),
            exp: self.expiry_secs(params),
            s: params.state.clone(),
        };
        // A struct of strings and integers always serializes.
        let json = serde_json::to_vec(&claims).expect("claims serialize to JSON");

        let mut token = URL_SAFE_NO_PAD.encode(json);
        token.push(SEPARATOR);
        let signature = self.sign(token.as_bytes());
        token.push_str(&signature);
        Token(token)
    }

    pub fn decode(&self, token: &str, now: SystemTime) -> Result<LinkParameters, DecodeError> {
        if !token.is_ascii() || token.len() < SIGNATURE_B64_LEN + 2 {
            return Err(DecodeError::Malformed);
        }
        let (signed, signature) = token.split_at(token.len() - SIGNATURE_B64_LEN);
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| DecodeError::SignatureInvalid)?;
        let mut mac = self.mac.clone();
        mac.update(signed.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| DecodeError::SignatureInvalid)?;

        let payload = signed
            .strip_suffix(SEPARATOR)
            .ok_or(DecodeError::Malformed)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| DecodeError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&bytes).map_err(|_| DecodeError::Malformed)?;

        if unix_secs(now) >= claims.exp {
            return Err(DecodeError::Expired);
        }

        Ok(LinkParameters {
            target_url: claims.t,
            callback_url: claims.c,
            delay_seconds: claims.d,
            issued_at: from_unix_secs(claims.iat),
            state: claims.s,
        })
    }

    fn sign(&self, input: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(input);
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

/// Whole seconds since the Unix epoch; times before the epoch clamp to 0.
pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn from_unix_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

pub fn truncate_to_secs(t: SystemTime) -> SystemTime {
    from_unix_secs(unix_secs(t))
}
