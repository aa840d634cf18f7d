//! Low-level JWT mechanics: size-guarded parsing, unverified header/claim
//! peeking (to select a provider before we know whether the token is
//! genuine), per-algorithm-family signature verification, and re-signing a
//! verified token into the server's own normalized HS256 form.
//!
//! This module deliberately returns a closed `VerifyOutcome` enum rather than
//! propagating `jsonwebtoken`'s error type or using exceptions-as-control-flow
//! (see the redesign note on JWT verification): callers match on the outcome
//! and map it to a transport-level error themselves.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

/// Tokens larger than this are rejected before any base64 decode or
/// cryptographic work, to bound DoS exposure from oversized input.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default allowed clock skew when validating `iat`/`exp`.
pub const DEFAULT_CLOCK_SKEW_SECONDS: i64 = 300;

/// Upper bound operators may configure for clock skew tolerance.
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Signature, issuer and audience all checked out.
    Verified,
    Expired,
    InvalidSignature,
    InvalidIssuer,
    InvalidAudience,
    Malformed,
}

/// The three base64url segments of a compact JWS, still encoded.
pub struct SplitToken<'a> {
    pub header_b64: &'a str,
    pub payload_b64: &'a str,
    pub signature_b64: &'a str,
}

/// Split a compact JWT into its three segments without decoding them.
///
/// Enforces the size guard and the 3-segment shape; everything else is left
/// to the caller.
pub fn split_token(token: &str) -> Result<SplitToken<'_>, VerifyOutcome> {
    if token.is_empty() || token.len() > MAX_JWT_SIZE_BYTES {
        return Err(VerifyOutcome::Malformed);
    }
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(VerifyOutcome::Malformed);
    };
    Ok(SplitToken {
        header_b64,
        payload_b64,
        signature_b64,
    })
}

/// Header fields we need before we can pick a provider and a verification
/// routine: `alg` selects the algorithm family, `kid` selects the public key
/// within a provider for RS/ES/PS, and is unused for HS.
#[derive(Debug, Deserialize)]
struct UnverifiedHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Claims we need before verification succeeds, so we can match the token to
/// a configured provider. Anything beyond `aud`/`iss` is opaque to this
/// layer — the gateway never interprets business claims, it only forwards
/// the re-signed token to SQL.
#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    aud: Option<AudienceClaim>,
    iss: Option<String>,
}

/// `aud` may legally be a single string or an array of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudienceClaim {
    Single(String),
    Many(Vec<String>),
}

impl AudienceClaim {
    fn contains(&self, candidate: &str) -> bool {
        match self {
            AudienceClaim::Single(a) => a == candidate,
            AudienceClaim::Many(list) => list.iter().any(|a| a == candidate),
        }
    }
}

pub struct TokenPreview {
    pub alg: String,
    pub kid: Option<String>,
    pub audience: Option<Vec<String>>,
    pub issuer: Option<String>,
}

/// Decode the header and claims of a JWT without checking its signature.
/// Used purely to select which configured provider should attempt
/// verification; the result MUST NOT be trusted for authorization
/// decisions until `verify` returns `VerifyOutcome::Verified`.
pub fn preview(split: &SplitToken<'_>) -> Result<TokenPreview, VerifyOutcome> {
    let header_bytes = URL_SAFE_NO_PAD
        .decode(split.header_b64)
        .map_err(|_| VerifyOutcome::Malformed)?;
    let header: UnverifiedHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| VerifyOutcome::Malformed)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(split.payload_b64)
        .map_err(|_| VerifyOutcome::Malformed)?;
    let claims: UnverifiedClaims =
        serde_json::from_slice(&payload_bytes).map_err(|_| VerifyOutcome::Malformed)?;

    let audience = claims.aud.map(|a| match a {
        AudienceClaim::Single(s) => vec![s],
        AudienceClaim::Many(v) => v,
    });

    Ok(TokenPreview {
        alg: header.alg,
        kid: header.kid,
        audience,
        issuer: claims.iss,
    })
}

/// Map a JWT `alg` header name to `jsonwebtoken::Algorithm`. `ES512` (P-521)
/// has no `jsonwebtoken::Algorithm` variant — the crate has no P-521
/// backend — so it falls through to `None` like any other unrecognized
/// name; a provider manifest that names it is rejected at load time.
pub fn algorithm_from_name(alg: &str) -> Option<Algorithm> {
    match alg {
        "HS256" => Some(Algorithm::HS256),
        "HS384" => Some(Algorithm::HS384),
        "HS512" => Some(Algorithm::HS512),
        "RS256" => Some(Algorithm::RS256),
        "RS384" => Some(Algorithm::RS384),
        "RS512" => Some(Algorithm::RS512),
        "ES256" => Some(Algorithm::ES256),
        "ES384" => Some(Algorithm::ES384),
        "PS256" => Some(Algorithm::PS256),
        "PS384" => Some(Algorithm::PS384),
        "PS512" => Some(Algorithm::PS512),
        _ => None,
    }
}

/// Key material needed to verify a token, once the algorithm family has
/// narrowed down what kind of key is expected.
pub enum VerificationKey<'a> {
    /// HS* — provider's shared secret.
    Shared(&'a [u8]),
    /// RS*/PS* — RSA public key, PEM or DER, identified by `kid`.
    RsaPublicDer(&'a [u8]),
    /// ES* — EC public key, DER, identified by `kid`.
    EcPublicDer(&'a [u8]),
}

/// Verify a token's signature, issuer and expiry. Audience matching is the
/// caller's job (it happens before key selection, to pick the provider in
/// the first place) — by the time this is called the provider is already
/// chosen, so only `allowed_issuers` is checked here.
pub fn verify(
    token: &str,
    alg: Algorithm,
    key: &VerificationKey<'_>,
    allowed_issuers: &[String],
    clock_skew_seconds: i64,
) -> VerifyOutcome {
    let decoding_key = match key {
        VerificationKey::Shared(secret) => DecodingKey::from_secret(secret),
        VerificationKey::RsaPublicDer(der) => DecodingKey::from_rsa_der(der),
        VerificationKey::EcPublicDer(der) => DecodingKey::from_ec_der(der),
    };

    let mut validation = Validation::new(alg);
    validation.validate_aud = false; // audience already matched during provider lookup
    validation.leeway = clock_skew_seconds.max(0) as u64;
    if !allowed_issuers.is_empty() {
        validation.set_issuer(allowed_issuers);
    }

    match jsonwebtoken::decode::<Value>(token, &decoding_key, &validation) {
        Ok(_) => VerifyOutcome::Verified,
        Err(e) => match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerifyOutcome::Expired,
            jsonwebtoken::errors::ErrorKind::InvalidIssuer => VerifyOutcome::InvalidIssuer,
            jsonwebtoken::errors::ErrorKind::InvalidAudience => VerifyOutcome::InvalidAudience,
            jsonwebtoken::errors::ErrorKind::InvalidSignature
            | jsonwebtoken::errors::ErrorKind::InvalidEcdsaKey
            | jsonwebtoken::errors::ErrorKind::InvalidRsaKey(_) => {
                VerifyOutcome::InvalidSignature
            }
            _ => VerifyOutcome::Malformed,
        },
    }
}

/// Build the "clean token": header forced to `{"alg":"HS256","typ":"JWT"}`,
/// the original payload segment preserved byte-for-byte, signed fresh with
/// the server's own HS256 secret. This is what gets forwarded to
/// `daemon.TokenFetch` — SQL never sees a third-party signature.
pub fn resign_hs256(payload_b64: &str, server_secret: &[u8]) -> String {
    const CLEAN_HEADER_JSON: &str = r#"{"alg":"HS256","typ":"JWT"}"#;
    let header_b64 = URL_SAFE_NO_PAD.encode(CLEAN_HEADER_JSON);
    let signing_input = format!("{header_b64}.{payload_b64}");

    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let signature_b64 = HmacSha256::new_from_slice(server_secret)
        .map(|mut mac| {
            mac.update(signing_input.as_bytes());
            URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
        })
        .unwrap_or_default();

    format!("{signing_input}.{signature_b64}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize, Deserialize)]
    struct TestClaims {
        aud: String,
        iss: String,
        exp: i64,
        sub: String,
    }

    fn sample_claims() -> TestClaims {
        TestClaims {
            aud: "provider-1".to_string(),
            iss: "https://issuer.example".to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
            sub: "user-1".to_string(),
        }
    }

    #[test]
    fn split_token_rejects_wrong_segment_count() {
        assert!(matches!(split_token("a.b"), Err(VerifyOutcome::Malformed)));
        assert!(matches!(
            split_token("a.b.c.d"),
            Err(VerifyOutcome::Malformed)
        ));
    }

    #[test]
    fn split_token_rejects_oversized_token() {
        let huge = "a".repeat(MAX_JWT_SIZE_BYTES + 1);
        assert!(matches!(split_token(&huge), Err(VerifyOutcome::Malformed)));
    }

    #[test]
    fn split_token_rejects_empty() {
        assert!(matches!(split_token(""), Err(VerifyOutcome::Malformed)));
    }

    #[test]
    fn preview_extracts_alg_kid_aud_iss() {
        let secret = b"provider-secret";
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("key-1".to_string());
        let token = encode(&header, &sample_claims(), &EncodingKey::from_secret(secret)).unwrap();
        let split = split_token(&token).unwrap();
        let preview = preview(&split).unwrap();
        assert_eq!(preview.alg, "HS256");
        assert_eq!(preview.kid, Some("key-1".to_string()));
        assert_eq!(preview.audience, Some(vec!["provider-1".to_string()]));
        assert_eq!(preview.issuer, Some("https://issuer.example".to_string()));
    }

    #[test]
    fn preview_accepts_array_audience() {
        #[derive(Serialize)]
        struct MultiAud {
            aud: Vec<String>,
            iss: String,
            exp: i64,
        }
        let claims = MultiAud {
            aud: vec!["p1".to_string(), "p2".to_string()],
            iss: "iss".to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let split = split_token(&token).unwrap();
        let preview = preview(&split).unwrap();
        assert_eq!(preview.audience, Some(vec!["p1".to_string(), "p2".to_string()]));
    }

    #[test]
    fn verify_hs256_round_trip_succeeds() {
        let secret = b"provider-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &sample_claims(),
            &EncodingKey::from_secret(secret),
        )
        .unwrap();
        let outcome = verify(
            &token,
            Algorithm::HS256,
            &VerificationKey::Shared(secret),
            &["https://issuer.example".to_string()],
            DEFAULT_CLOCK_SKEW_SECONDS,
        );
        assert_eq!(outcome, VerifyOutcome::Verified);
    }

    #[test]
    fn verify_rejects_wrong_issuer() {
        let secret = b"provider-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &sample_claims(),
            &EncodingKey::from_secret(secret),
        )
        .unwrap();
        let outcome = verify(
            &token,
            Algorithm::HS256,
            &VerificationKey::Shared(secret),
            &["https://someone-else.example".to_string()],
            DEFAULT_CLOCK_SKEW_SECONDS,
        );
        assert_eq!(outcome, VerifyOutcome::InvalidIssuer);
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &sample_claims(),
            &EncodingKey::from_secret(b"provider-secret"),
        )
        .unwrap();
        let outcome = verify(
            &token,
            Algorithm::HS256,
            &VerificationKey::Shared(b"wrong-secret"),
            &["https://issuer.example".to_string()],
            DEFAULT_CLOCK_SKEW_SECONDS,
        );
        assert_eq!(outcome, VerifyOutcome::InvalidSignature);
    }

    #[test]
    fn verify_rejects_expired_token() {
        #[derive(Serialize)]
        struct ExpiredClaims {
            aud: String,
            iss: String,
            exp: i64,
        }
        let claims = ExpiredClaims {
            aud: "provider-1".to_string(),
            iss: "https://issuer.example".to_string(),
            exp: chrono::Utc::now().timestamp() - 3600,
        };
        let secret = b"provider-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap();
        let outcome = verify(
            &token,
            Algorithm::HS256,
            &VerificationKey::Shared(secret),
            &["https://issuer.example".to_string()],
            0,
        );
        assert_eq!(outcome, VerifyOutcome::Expired);
    }

    #[test]
    fn resign_preserves_payload_bytes() {
        let secret = b"provider-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &sample_claims(),
            &EncodingKey::from_secret(secret),
        )
        .unwrap();
        let split = split_token(&token).unwrap();
        let server_secret = b"server-hs256-secret";
        let clean = resign_hs256(split.payload_b64, server_secret);
        let clean_split = split_token(&clean).unwrap();
        assert_eq!(clean_split.payload_b64, split.payload_b64);

        let header_bytes = URL_SAFE_NO_PAD.decode(clean_split.header_b64).unwrap();
        let header_json: Value = serde_json::from_slice(&header_bytes).unwrap();
        assert_eq!(header_json["alg"], "HS256");
        assert_eq!(header_json["typ"], "JWT");

        // The re-signed token must itself verify under the server secret.
        let outcome = verify(
            &clean,
            Algorithm::HS256,
            &VerificationKey::Shared(server_secret),
            &[],
            DEFAULT_CLOCK_SKEW_SECONDS,
        );
        assert_eq!(outcome, VerifyOutcome::Verified);
    }

    #[test]
    fn algorithm_from_name_covers_hs_rs_es_ps_families() {
        for name in [
            "HS256", "HS384", "HS512", "RS256", "RS384", "RS512", "ES256", "ES384", "PS256",
            "PS384", "PS512",
        ] {
            assert!(algorithm_from_name(name).is_some(), "missing {name}");
        }
        assert!(algorithm_from_name("none").is_none());
    }

    #[test]
    fn algorithm_from_name_rejects_es512_for_lack_of_a_p521_backend() {
        assert!(algorithm_from_name("ES512").is_none());
    }
}
