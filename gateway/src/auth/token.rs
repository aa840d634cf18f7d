//! Token Verifier (§4.2): decode a JWT without trusting it, match its
//! audience to a configured provider, verify the signature with the
//! algorithm family the header names, and re-sign a normalized clean token
//! under the server's HS256 secret. Returns a closed result type instead of
//! throwing, per the redesign note on exceptions-as-control-flow in JWT
//! verification.

use common::jwt::{self, VerificationKey, VerifyOutcome};

use super::providers::{KeyFamily, ProviderKeyStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVerifyError {
    /// Maps to 403 `invalid_token`.
    Expired,
    /// Maps to 401 `invalid_token`: unknown audience, bad signature, wrong
    /// issuer, or an algorithm/key-family mismatch.
    InvalidToken,
    /// Maps to 400 `invalid_request`: the token isn't well-formed JWS.
    Malformed,
}

/// Verify `token` against the configured providers and, on success, return
/// the clean HS256-resigned form that SQL will actually see.
pub async fn verify_and_resign(
    token: &str,
    store: &ProviderKeyStore,
    server_secret: &[u8],
    clock_skew_seconds: i64,
) -> Result<String, TokenVerifyError> {
    let split = jwt::split_token(token).map_err(|_| TokenVerifyError::Malformed)?;
    let preview = jwt::preview(&split).map_err(|_| TokenVerifyError::Malformed)?;

    let audiences = preview.audience.ok_or(TokenVerifyError::InvalidToken)?;
    let mut provider = None;
    for aud in &audiences {
        if let Some(p) = store.by_audience(aud).await {
            provider = Some(p);
            break;
        }
    }
    let provider = provider.ok_or(TokenVerifyError::InvalidToken)?;

    let issuer = preview.issuer.as_deref().unwrap_or_default();
    if !provider.allows_issuer(issuer) {
        return Err(TokenVerifyError::InvalidToken);
    }

    let algorithm =
        jwt::algorithm_from_name(&preview.alg).ok_or(TokenVerifyError::InvalidToken)?;

    let key = verification_key(&preview.alg, preview.kid.as_deref(), &provider)
        .ok_or(TokenVerifyError::InvalidToken)?;

    let allowed_issuers: Vec<String> = provider.issuers.iter().cloned().collect();
    let outcome = jwt::verify(token, algorithm, &key, &allowed_issuers, clock_skew_seconds);

    match outcome {
        VerifyOutcome::Verified => Ok(jwt::resign_hs256(split.payload_b64, server_secret)),
        VerifyOutcome::Expired => Err(TokenVerifyError::Expired),
        VerifyOutcome::InvalidSignature
        | VerifyOutcome::InvalidIssuer
        | VerifyOutcome::InvalidAudience => Err(TokenVerifyError::InvalidToken),
        VerifyOutcome::Malformed => Err(TokenVerifyError::Malformed),
    }
}

fn verification_key<'a>(
    alg: &str,
    kid: Option<&str>,
    provider: &'a super::providers::Provider,
) -> Option<VerificationKey<'a>> {
    if let Some(family) = alg.get(0..2) {
        match family {
            "HS" => {
                let secret = provider.secret.as_deref()?;
                return Some(VerificationKey::Shared(secret));
            }
            "RS" | "PS" => {
                let kid = kid?;
                let key = provider.public_keys.get(kid)?;
                if key.family != KeyFamily::Rsa {
                    return None;
                }
                return Some(VerificationKey::RsaPublicDer(&key.public_key_der));
            }
            "ES" => {
                let kid = kid?;
                let key = provider.public_keys.get(kid)?;
                if key.family != KeyFamily::Ec {
                    return None;
                }
                return Some(VerificationKey::EcPublicDer(&key.public_key_der));
            }
            _ => {}
        }
    }
    None
}
