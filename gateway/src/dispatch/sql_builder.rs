//! SQL Builder (§4.7): turns an authorization plus a path and payload into
//! the exact `daemon.*` stored-procedure call to run. Exactly one branch
//! fires per request; the branch chosen is recorded in the query context.

use secrecy::ExposeSecret;
use serde_json::Value;

use crate::auth::{Authorization, GrantType};
use crate::db::{QueryContext, SqlBatch, SqlParam, SqlStatement, TokenType};

pub const SIGN_IN_PATH: &str = "/sign/in";
pub const SIGN_UP_PATH: &str = "/sign/up";
pub const SIGN_OUT_PATH: &str = "/sign/out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBuilderError {
    UnknownAuthorization,
}

/// `daemon.SignIn(payload, agent, host)`, for the one unauthenticated path
/// that creates a session.
pub fn sign_in(payload: Value, agent: &str, host: &str) -> (SqlBatch, QueryContext) {
    let batch = SqlBatch::single(SqlStatement {
        sql: "select * from daemon.signin($1, $2, $3)".to_string(),
        params: vec![
            SqlParam::Json(payload),
            SqlParam::Text(agent.to_string()),
            SqlParam::Text(host.to_string()),
        ],
    });
    (batch, QueryContext::new(SIGN_IN_PATH))
}

/// `daemon.SignUp('admin', <server_pwd>, payload)`. The server's own
/// database password authenticates the registration call, not the new
/// user's credentials.
pub fn sign_up(payload: Value, server_pwd: &str) -> (SqlBatch, QueryContext) {
    let batch = SqlBatch::single(SqlStatement {
        sql: "select * from daemon.signup($1, $2, $3)".to_string(),
        params: vec![
            SqlParam::Text("admin".to_string()),
            SqlParam::Text(server_pwd.to_string()),
            SqlParam::Json(payload),
        ],
    });
    (batch, QueryContext::new(SIGN_UP_PATH))
}

/// Dispatch an already-authorized request to the matching `daemon.*` call
/// (§4.7). `path` is the already-normalized object-route or raw POST path.
pub fn auth_fetch(
    authorization: &Authorization,
    path: &str,
    payload: Value,
    agent: &str,
    host: &str,
) -> Result<(SqlBatch, QueryContext), SqlBuilderError> {
    let mut context = QueryContext::new(path);

    let statement = match authorization {
        Authorization::Basic { username, password } => {
            context.grant_type = Some(GrantType::Owner);
            SqlStatement {
                sql: "select * from daemon.fetch($1, $2, $3, $4, $5, $6)".to_string(),
                params: vec![
                    SqlParam::Text(username.clone()),
                    SqlParam::Text(password.expose_secret().to_string()),
                    SqlParam::Text(path.to_string()),
                    SqlParam::Json(payload),
                    SqlParam::Text(agent.to_string()),
                    SqlParam::Text(host.to_string()),
                ],
            }
        }
        Authorization::SessionPair { session, key } => {
            context.grant_type = Some(GrantType::Client);
            SqlStatement {
                sql: "select * from daemon.authfetch($1, $2, $3, $4, $5, $6)".to_string(),
                params: vec![
                    SqlParam::Text(session.clone()),
                    SqlParam::Text(key.expose_secret().to_string()),
                    SqlParam::Text(path.to_string()),
                    SqlParam::Json(payload),
                    SqlParam::Text(agent.to_string()),
                    SqlParam::Text(host.to_string()),
                ],
            }
        }
        Authorization::Bearer { .. } => return Err(SqlBuilderError::UnknownAuthorization),
    };

    Ok((SqlBatch::single(statement), context))
}

/// `daemon.TokenFetch(server_pwd, token, path, payload, agent, host)`, for
/// a Bearer token already verified and re-signed into its clean HS256
/// form. `token_type` is recorded for the marshaller but does not change
/// which stored procedure runs.
pub fn token_fetch(
    clean_token: &str,
    server_pwd: &str,
    path: &str,
    payload: Value,
    agent: &str,
    host: &str,
    token_type: TokenType,
) -> (SqlBatch, QueryContext) {
    let mut context = QueryContext::new(path);
    context.token_type = Some(token_type);

    let statement = SqlStatement {
        sql: "select * from daemon.tokenfetch($1, $2, $3, $4, $5, $6)".to_string(),
        params: vec![
            SqlParam::Text(server_pwd.to_string()),
            SqlParam::Text(clean_token.to_string()),
            SqlParam::Text(path.to_string()),
            SqlParam::Json(payload),
            SqlParam::Text(agent.to_string()),
            SqlParam::Text(host.to_string()),
        ],
    };

    (SqlBatch::single(statement), context)
}

/// `daemon.SignFetch(path, payload, session, nonce, signature, agent,
/// host, receiveWindowMs)` for a call whose authenticity is established by
/// HMAC rather than by a grant.
#[allow(clippy::too_many_arguments)]
pub fn sign_fetch(
    path: &str,
    payload: Value,
    session: &str,
    nonce: &str,
    signature: &str,
    agent: &str,
    host: &str,
    receive_window_ms: i64,
) -> (SqlBatch, QueryContext) {
    let mut context = QueryContext::new(path);
    context.signed = true;

    let statement = SqlStatement {
        sql: "select * from daemon.signfetch($1, $2, $3, $4, $5, $6, $7, $8)".to_string(),
        params: vec![
            SqlParam::Text(path.to_string()),
            SqlParam::Json(payload),
            SqlParam::Text(session.to_string()),
            SqlParam::Text(nonce.to_string()),
            SqlParam::Text(signature.to_string()),
            SqlParam::Text(agent.to_string()),
            SqlParam::Text(host.to_string()),
            SqlParam::IntervalMillis(receive_window_ms),
        ],
    };

    (SqlBatch::single(statement), context)
}
