//! Capability-token authority.
//!
//! Every privileged operation in the platform is authorized by a
//! self-contained signed token. A token carries an issuer, exactly one
//! audience, a scope list, an optional session binding, issue/expiry times,
//! and a unique token id. Signing uses HMAC-SHA256 over a domain-separated
//! payload; verification compares signatures in constant time.
//!
//! Six audiences exist:
//!
//! | Kind | Audience | Session-bound | Permits |
//! |------|----------|---------------|---------|
//! | User | `user`   | no  | list own sessions, create sessions, read summary/state |
//! | IST  | `ist`    | yes | submit answer, finalize, code eval |
//! | WST  | `wst`    | yes | open one duplex stream |
//! | AIPT | `aipt`   | yes | request next question |
//! | UPT  | `upt`    | yes | upload a single media blob (one-shot) |
//! | ACET | `acet`   | yes | submit event batches and pre-check |
//!
//! AIPT and UPT additionally embed the session's token-generation counter;
//! the service layer re-checks it against the session record on every use, so
//! leaving `Active` invalidates them without a revocation list. UPT is
//! one-shot: the authority records consumed token ids and rejects reuse.
//!
//! A minted token is never re-minted with a different expiry; refresh always
//! issues a fresh token id.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Domain separator mixed into every token signature.
const TOKEN_DOMAIN_SEPARATOR: &[u8] = b"greenroom:capability-token:v1\0";

/// Issuer string stamped into every token.
const TOKEN_ISSUER: &str = "greenroom";

/// Upper bound on the consumed-token-id set.
///
/// Upload tokens expire within minutes, so the set only needs to cover ids
/// that could still verify. The bound keeps memory flat if a client mints
/// upload tokens in a loop without using them.
pub const MAX_CONSUMED_TOKEN_IDS: usize = 4096;

/// Token audiences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    /// Long-lived user capability.
    User,
    /// Interview session token: answers, finalize, code eval.
    Ist,
    /// Duplex stream token.
    Wst,
    /// AI proxy token: next question.
    Aipt,
    /// One-shot upload token.
    Upt,
    /// Anti-cheat emit token: event batches and pre-check.
    Acet,
}

impl Audience {
    /// Returns the wire name of the audience.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ist => "ist",
            Self::Wst => "wst",
            Self::Aipt => "aipt",
            Self::Upt => "upt",
            Self::Acet => "acet",
        }
    }

    /// Whether tokens of this audience must carry a session binding.
    #[must_use]
    pub const fn session_bound(self) -> bool {
        !matches!(self, Self::User)
    }
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// No token was presented.
    #[error("token missing")]
    Missing,

    /// The token is malformed or its signature does not verify.
    #[error("token invalid")]
    Invalid,

    /// The token's expiry has passed.
    #[error("token expired")]
    Expired,

    /// The token's audience does not match the endpoint requirement.
    #[error("token has audience {actual}, endpoint requires {expected}")]
    WrongAudience {
        /// Audience the endpoint requires.
        expected: Audience,
        /// Audience the token carries.
        actual: Audience,
    },

    /// The token is bound to a different session than the request targets.
    #[error("token bound to a different session")]
    WrongSession,

    /// A one-shot token was already consumed.
    #[error("token already used")]
    AlreadyUsed,
}

/// Claims carried by a capability token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer; always `greenroom`.
    pub iss: String,
    /// Subject: the user id, or `media` for upload tokens.
    pub sub: String,
    /// Audience.
    pub aud: Audience,
    /// Scope strings, e.g. `interview:session:<id>`.
    pub scope: Vec<String>,
    /// Session binding, present for every audience except `user`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Session token-generation counter at mint time (AIPT/UPT only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gen: Option<u64>,
    /// Issued-at, Unix seconds.
    pub iat: u64,
    /// Expiry, Unix seconds.
    pub exp: u64,
    /// Unique token id.
    pub jti: String,
}

/// Clock abstraction so expiry checks are deterministic under test.
pub trait Clock: Send + Sync {
    /// Current Unix timestamp in seconds.
    fn now_secs(&self) -> u64;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
    }
}

/// Fixed clock for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_secs(&self) -> u64 {
        self.0
    }
}

/// Mints and verifies capability tokens.
///
/// The signing secret never leaves this type; everything else in the
/// workspace handles tokens as opaque strings.
pub struct TokenAuthority {
    secret: SecretString,
    clock: Box<dyn Clock>,
    consumed: Mutex<HashSet<String>>,
}

impl TokenAuthority {
    /// Creates an authority with the system clock.
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self::with_clock(secret, Box::new(SystemClock))
    }

    /// Creates an authority with an injected clock (tests).
    #[must_use]
    pub fn with_clock(secret: SecretString, clock: Box<dyn Clock>) -> Self {
        Self {
            secret,
            clock,
            consumed: Mutex::new(HashSet::new()),
        }
    }

    /// Current time as seen by the authority's clock.
    #[must_use]
    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    /// Mints a token.
    ///
    /// `session_id` must be present for every audience except [`Audience::User`];
    /// `gen` is recorded for AIPT/UPT so the service can re-check it.
    #[must_use]
    pub fn mint(
        &self,
        sub: &str,
        aud: Audience,
        scope: Vec<String>,
        session_id: Option<&str>,
        gen: Option<u64>,
        ttl: Duration,
    ) -> String {
        let now = self.clock.now_secs();
        let claims = Claims {
            iss: TOKEN_ISSUER.to_string(),
            sub: sub.to_string(),
            aud,
            scope,
            session_id: session_id.map(str::to_string),
            gen,
            iat: now,
            exp: now.saturating_add(ttl.as_secs()),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        // Claims are plain data; serialization cannot fail.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let tag = self.sign(encoded.as_bytes());
        format!("{encoded}.{}", hex::encode(tag))
    }

    /// Verifies a token against an expected audience and optional session
    /// binding, returning its claims.
    ///
    /// # Errors
    ///
    /// Returns the matching [`TokenError`] on any structural, signature,
    /// expiry, audience, or session-binding failure. Signature comparison is
    /// constant-time; structural checks run before the audience check so a
    /// forged token learns nothing from the error ordering.
    pub fn verify(
        &self,
        token: &str,
        expected: Audience,
        session_id: Option<&str>,
    ) -> Result<Claims, TokenError> {
        let (encoded, tag_hex) = token.split_once('.').ok_or(TokenError::Invalid)?;
        let presented = hex::decode(tag_hex).map_err(|_| TokenError::Invalid)?;
        let computed = self.sign(encoded.as_bytes());
        if presented.len() != computed.len()
            || computed.ct_eq(presented.as_slice()).unwrap_u8() != 1
        {
            return Err(TokenError::Invalid);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenError::Invalid)?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| TokenError::Invalid)?;

        if claims.iss != TOKEN_ISSUER {
            return Err(TokenError::Invalid);
        }
        if self.clock.now_secs() >= claims.exp {
            return Err(TokenError::Expired);
        }
        if claims.aud != expected {
            return Err(TokenError::WrongAudience {
                expected,
                actual: claims.aud,
            });
        }
        if let Some(expected_session) = session_id {
            if claims.session_id.as_deref() != Some(expected_session) {
                return Err(TokenError::WrongSession);
            }
        }
        Ok(claims)
    }

    /// Marks a one-shot token as consumed.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::AlreadyUsed`] if the token id was consumed
    /// before.
    pub fn consume_once(&self, jti: &str) -> Result<(), TokenError> {
        let mut consumed = self
            .consumed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if consumed.contains(jti) {
            return Err(TokenError::AlreadyUsed);
        }
        if consumed.len() >= MAX_CONSUMED_TOKEN_IDS {
            consumed.clear();
        }
        consumed.insert(jti.to_string());
        Ok(())
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        // Key length is validated at config load; new_from_slice accepts any
        // length for HMAC regardless.
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(TOKEN_DOMAIN_SEPARATOR);
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}
