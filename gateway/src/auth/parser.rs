//! Authorization Parser (§4.1): turns the raw `Authorization` header, plus
//! the `Session`/`Key` headers and `AWS-Session`/`API-Key` cookies, into a
//! tagged `Authorization` value. Exactly one of {Basic, Bearer,
//! SessionPair} identifies a caller — never more than one, never a mix.

use axum::http::HeaderMap;
use axum_extra::extract::CookieJar;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::secret::SecretString;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    Owner,
    Client,
}

pub enum Authorization {
    Basic {
        username: String,
        password: SecretString,
    },
    SessionPair {
        session: String,
        key: SecretString,
    },
    Bearer {
        token: String,
    },
}

impl Authorization {
    /// Owner for a Basic username/password login, Client for an already
    /// established session+key pair. Bearer tokens carry their own
    /// token-type distinction (access/refresh) instead and have no grant.
    pub fn grant(&self) -> Option<GrantType> {
        match self {
            Authorization::Basic { .. } => Some(GrantType::Owner),
            Authorization::SessionPair { .. } => Some(GrantType::Client),
            Authorization::Bearer { .. } => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("malformed authorization: {0}")]
    Malformed(String),

    #[error("unauthorized_client")]
    Unauthenticated,
}

const SESSION_HEADER: &str = "session";
const KEY_HEADER: &str = "key";
const SESSION_COOKIE: &str = "AWS-Session";
const KEY_COOKIE: &str = "API-Key";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse the caller's authorization per §4.1's scheme-detection rules.
pub fn parse_authorization(
    headers: &HeaderMap,
    cookies: &CookieJar,
) -> Result<Authorization, AuthorizationError> {
    if let Some(raw) = header_str(headers, axum::http::header::AUTHORIZATION.as_str()) {
        return parse_authorization_header(raw);
    }

    let session = header_str(headers, SESSION_HEADER)
        .map(str::to_string)
        .or_else(|| cookies.get(SESSION_COOKIE).map(|c| c.value().to_string()));
    let key = header_str(headers, KEY_HEADER)
        .map(str::to_string)
        .or_else(|| cookies.get(KEY_COOKIE).map(|c| c.value().to_string()));

    match (session, key) {
        (Some(session), Some(key)) if !session.is_empty() && !key.is_empty() => {
            Ok(Authorization::SessionPair {
                session,
                key: SecretString::from(key),
            })
        }
        _ => Err(AuthorizationError::Unauthenticated),
    }
}

fn parse_authorization_header(raw: &str) -> Result<Authorization, AuthorizationError> {
    let mut parts = raw.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match scheme.to_ascii_lowercase().as_str() {
        "basic" => parse_basic(rest),
        "bearer" => {
            if rest.is_empty() {
                return Err(AuthorizationError::Malformed(
                    "empty bearer token".to_string(),
                ));
            }
            Ok(Authorization::Bearer {
                token: rest.to_string(),
            })
        }
        _ => Err(AuthorizationError::Unauthenticated),
    }
}

fn parse_basic(encoded: &str) -> Result<Authorization, AuthorizationError> {
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| AuthorizationError::Malformed("invalid base64 in Basic credentials".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AuthorizationError::Malformed("non-UTF-8 Basic credentials".into()))?;

    let mut split = decoded.splitn(2, ':');
    let username = split.next().unwrap_or_default();
    let password = split.next();

    match password {
        Some(password) if !username.is_empty() && !password.is_empty() => Ok(Authorization::Basic {
            username: username.to_string(),
            password: SecretString::from(password.to_string()),
        }),
        _ => Err(AuthorizationError::Malformed(
            "Basic credentials must be non-empty user:pass".into(),
        )),
    }
}
