//! Capability extraction and minting helpers.
//!
//! Every endpoint declares the audience it requires; the helpers here pull
//! the bearer token or the HttpOnly session cookie out of the headers,
//! verify it against the [`TokenAuthority`], and hand back the claims.
//!
//! AIPT and UPT additionally embed the session's token-generation counter at
//! mint time; [`check_generation`] re-validates it against the session
//! record, which is how leaving `Active` retires those tokens without a
//! revocation list.

use axum::http::HeaderMap;
use greenroom_core::session::Session;
use greenroom_core::token::{Audience, Claims, TokenAuthority, TokenError};

use super::AppState;
use super::error::ApiError;

/// Name of the HttpOnly session cookie.
pub const SESSION_COOKIE: &str = "session";

/// Extracts a bearer token from the `Authorization` header.
///
/// # Errors
///
/// [`TokenError::Missing`] when the header is absent or not a bearer.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Token(TokenError::Missing))?;
    let (scheme, token) = value
        .split_once(' ')
        .ok_or(ApiError::Token(TokenError::Missing))?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(ApiError::Token(TokenError::Missing));
    }
    Ok(token)
}

/// Verifies the bearer token against an expected audience and optional
/// session binding.
///
/// # Errors
///
/// [`ApiError::Token`] with the precise rejection.
pub fn require(
    state: &AppState,
    headers: &HeaderMap,
    audience: Audience,
    session_id: Option<&str>,
) -> Result<Claims, ApiError> {
    let token = bearer_token(headers)?;
    Ok(state.authority.verify(token, audience, session_id)?)
}

/// Extracts and verifies the session cookie.
///
/// # Errors
///
/// [`ApiError::Unauthenticated`] when the cookie is missing or does not
/// verify.
pub fn require_cookie(state: &AppState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let token = session_cookie(headers).ok_or(ApiError::Unauthenticated)?;
    state
        .authority
        .verify(&token, Audience::User, None)
        .map_err(|_| ApiError::Unauthenticated)
}

/// Pulls the `session` cookie value out of the `Cookie` header.
#[must_use]
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Re-checks an AIPT/UPT generation stamp against the session record.
///
/// # Errors
///
/// [`TokenError::Expired`] when the session has since left `Active` (the
/// generation counter moved).
pub fn check_generation(claims: &Claims, session: &Session) -> Result<(), ApiError> {
    if claims.gen != Some(session.token_generation) {
        return Err(ApiError::Token(TokenError::Expired));
    }
    Ok(())
}

/// Token minting for each capability kind, mirroring the per-kind scopes.
pub struct Tokens;

impl Tokens {
    /// Long-lived user capability.
    #[must_use]
    pub fn user(authority: &TokenAuthority, user_id: &str, ttl: std::time::Duration) -> String {
        authority.mint(user_id, Audience::User, vec!["user".into()], None, None, ttl)
    }

    /// Session cookie value: a user-audience capability scoped `session`.
    #[must_use]
    pub fn cookie(authority: &TokenAuthority, user_id: &str, ttl: std::time::Duration) -> String {
        authority.mint(
            user_id,
            Audience::User,
            vec!["session".into()],
            None,
            None,
            ttl,
        )
    }

    /// Interview session token.
    #[must_use]
    pub fn ist(
        authority: &TokenAuthority,
        user_id: &str,
        session_id: &str,
        ttl: std::time::Duration,
    ) -> String {
        authority.mint(
            user_id,
            Audience::Ist,
            vec![format!("interview:session:{session_id}")],
            Some(session_id),
            None,
            ttl,
        )
    }

    /// Duplex stream token.
    #[must_use]
    pub fn wst(
        authority: &TokenAuthority,
        user_id: &str,
        session_id: &str,
        ttl: std::time::Duration,
    ) -> String {
        authority.mint(
            user_id,
            Audience::Wst,
            vec![format!("ws:interview:{session_id}")],
            Some(session_id),
            None,
            ttl,
        )
    }

    /// AI proxy token, stamped with the current generation.
    #[must_use]
    pub fn aipt(
        authority: &TokenAuthority,
        session: &Session,
        ttl: std::time::Duration,
    ) -> String {
        authority.mint(
            &session.user_id,
            Audience::Aipt,
            vec!["ai:ask".into()],
            Some(&session.id),
            Some(session.token_generation),
            ttl,
        )
    }

    /// One-shot upload token, stamped with the current generation.
    #[must_use]
    pub fn upt(
        authority: &TokenAuthority,
        session: &Session,
        ttl: std::time::Duration,
    ) -> String {
        authority.mint(
            "media",
            Audience::Upt,
            vec![format!("upload:session:{}", session.id)],
            Some(&session.id),
            Some(session.token_generation),
            ttl,
        )
    }

    /// Anti-cheat emit token.
    #[must_use]
    pub fn acet(
        authority: &TokenAuthority,
        user_id: &str,
        session_id: &str,
        ttl: std::time::Duration,
    ) -> String {
        authority.mint(
            user_id,
            Audience::Acet,
            vec![format!("anti-cheat:emit:{session_id}")],
            Some(session_id),
            None,
            ttl,
        )
    }
}

/// Builds the `Set-Cookie` value for the session cookie.
#[must_use]
pub fn session_cookie_header(token: &str, secure: bool, max_age_secs: u64) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age_secs}"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def"),
        );
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def");
    }

    #[test]
    fn test_bearer_missing_or_malformed() {
        assert!(bearer_token(&HeaderMap::new()).is_err());
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc"),
        );
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn test_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("theme=dark; session=tok123; lang=en"),
        );
        assert_eq!(session_cookie(&headers).unwrap(), "tok123");
    }

    #[test]
    fn test_cookie_header_shape() {
        let value = session_cookie_header("tok", true, 3600);
        assert!(value.starts_with("session=tok; HttpOnly; SameSite=Strict"));
        assert!(value.ends_with("; Secure"));
        let insecure = session_cookie_header("tok", false, 3600);
        assert!(!insecure.contains("Secure"));
    }
}
