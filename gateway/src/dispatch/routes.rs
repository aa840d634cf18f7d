//! Request Dispatcher (§4.5): the Axum router and the handlers that turn
//! an HTTP request into a query, run it, and marshal the reply. Replaces
//! the process-wide `Application` singleton with an explicit context
//! passed through `State` (§9 design notes).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use serde_json::Value;
use time::Duration as CookieDuration;

use crate::auth::{parse_authorization, Authorization, ProviderKeyStore};
use crate::config::Config;
use crate::db::{JobRegistry, QueryEngine, QueryError, TokenType};
use crate::errors::GatewayError;
use crate::observability::metrics;
use crate::ws::{ClientFrame, ServerFrame, SessionCredentials, SessionManager};

use super::marshal::{marshal_http, CookieDirective, MarshalledReply};
use super::object_route;
use super::sql_builder::{self, SIGN_IN_PATH, SIGN_OUT_PATH, SIGN_UP_PATH};

pub struct ServerContext {
    pub config: Config,
    pub query_engine: QueryEngine,
    pub providers: ProviderKeyStore,
    pub jobs: JobRegistry,
    pub sessions: SessionManager,
}

pub fn build_router(context: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/time", get(server_time))
        .route("/api/v2/:job_id", get(drain_job))
        .route("/api/v1/*rest", get(object_get))
        .route("/api/:version/*rest", post(versioned_post))
        .route("/oauth2/:provider", get(oauth2_redirect))
        .route("/oauth2/:provider/:step", get(oauth2_redirect))
        .route("/session/:identity", get(session_ws))
        .layer(axum::middleware::from_fn(http_metrics_middleware))
        .with_state(context)
}

async fn http_metrics_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    metrics::record_http_request(&method, &path, response.status().as_u16(), start.elapsed());
    response
}

async fn ping() -> &'static str {
    "OK"
}

async fn server_time(State(context): State<Arc<ServerContext>>) -> Json<Value> {
    let now_ms = context
        .config
        .fixed_server_time_ms
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    Json(serde_json::json!({ "serverTime": now_ms }))
}

/// `GET /api/v2/<jobId>`: 404 if the id is unknown, 204 if the query is
/// still running, 200 with the buffered result once it's ready — only the
/// 200 case consumes the ticket (§4.5, §4.4 state machine
/// `created -> drained -> deleted`).
async fn drain_job(
    State(context): State<Arc<ServerContext>>,
    Path(job_id): Path<String>,
) -> Result<Response, GatewayError> {
    match context.jobs.drain(&job_id).await {
        crate::db::DrainOutcome::NotFound => {
            metrics::record_job_drained(false);
            Err(GatewayError::NotFound)
        }
        crate::db::DrainOutcome::Pending => Ok(StatusCode::NO_CONTENT.into_response()),
        crate::db::DrainOutcome::Ready(status) => {
            metrics::record_job_drained(true);
            Ok((StatusCode::OK, Json(status)).into_response())
        }
    }
}

async fn object_get(
    State(context): State<Arc<ServerContext>>,
    Path(rest): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Result<Response, GatewayError> {
    let mut segments = rest.splitn(2, '/');
    let command = segments.next().unwrap_or_default();
    let action = segments.next().filter(|s| !s.is_empty());

    let (path, payload) = object_route::resolve(command, action, &query)
        .ok_or(GatewayError::NotFound)?;

    let agent = require_user_agent(&headers)?;
    let authorization = parse_authorization(&headers, &cookies)
        .map_err(|_| GatewayError::Unauthenticated)?;

    let host = remote_host(&headers);

    run_auth_fetch(context, &authorization, &path, payload, &agent, &host, false).await
}

async fn versioned_post(
    State(context): State<Arc<ServerContext>>,
    Path((version, rest)): Path<(String, String)>,
    headers: HeaderMap,
    cookies: CookieJar,
    body: Option<Json<Value>>,
) -> Result<Response, GatewayError> {
    if version != "v1" && version != "v2" {
        return Err(GatewayError::NotFound);
    }
    // Sign in/up/out set cookies or session state directly on the HTTP
    // response, so they always run synchronously even under /api/v2 — only
    // an authenticated call proper can be deferred to a job ticket.
    let deferred = version == "v2";
    let path = format!("/{rest}");
    let payload = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let agent = require_user_agent(&headers)?;
    let host = remote_host(&headers);

    if path == SIGN_IN_PATH || path == SIGN_UP_PATH {
        let (batch, query_context) = if path == SIGN_IN_PATH {
            sql_builder::sign_in(payload, &agent, &host)
        } else {
            let admin_password = String::from_utf8_lossy(
                secrecy::ExposeSecret::expose_secret(&context.config.admin_password),
            )
            .to_string();
            sql_builder::sign_up(payload, &admin_password)
        };
        return execute_and_marshal(context, batch, query_context, false).await;
    }

    let authorization = parse_authorization(&headers, &cookies)
        .map_err(|_| GatewayError::Unauthenticated)?;

    // `/sign/out` is an ordinary authenticated call: it runs through the
    // same AuthFetch/TokenFetch dispatch as any other path and relies on
    // the marshaller's path-keyed cookie clearing (§4.8), not a special
    // SQL selection.
    let deferred = if path == SIGN_OUT_PATH { false } else { deferred };

    match &authorization {
        Authorization::Bearer { token } => {
            let clean = crate::auth::verify_and_resign(
                token,
                &context.providers,
                secrecy::ExposeSecret::expose_secret(&context.config.server_hs256_secret),
                context.config.jwt_clock_skew_seconds,
            )
            .await
            .map_err(token_error)?;
            let admin_password = String::from_utf8_lossy(secrecy::ExposeSecret::expose_secret(
                &context.config.admin_password,
            ))
            .to_string();
            let (batch, query_context) = sql_builder::token_fetch(
                &clean,
                &admin_password,
                &path,
                payload,
                &agent,
                &host,
                TokenType::Access,
            );
            execute_and_marshal(context, batch, query_context, deferred).await
        }
        _ => run_auth_fetch(context, &authorization, &path, payload, &agent, &host, deferred).await,
    }
}

async fn run_auth_fetch(
    context: Arc<ServerContext>,
    authorization: &Authorization,
    path: &str,
    payload: Value,
    agent: &str,
    host: &str,
    deferred: bool,
) -> Result<Response, GatewayError> {
    let (batch, query_context) = sql_builder::auth_fetch(authorization, path, payload, agent, host)
        .map_err(|_| GatewayError::MalformedRequest("unsupported authorization".to_string()))?;
    execute_and_marshal(context, batch, query_context, deferred).await
}

async fn execute_and_marshal(
    context: Arc<ServerContext>,
    batch: crate::db::SqlBatch,
    query_context: crate::db::QueryContext,
    deferred: bool,
) -> Result<Response, GatewayError> {
    if deferred {
        return execute_deferred(context, batch, query_context).await;
    }

    let start = Instant::now();
    let result = context.query_engine.submit(&batch).await;
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_query(&query_context.path, status, start.elapsed());

    let result_sets = result.map_err(|e| match e {
        QueryError::Unavailable(msg) => GatewayError::DbUnavailable(msg),
        QueryError::Execution(msg) => GatewayError::DbError(msg),
    })?;

    let reply = marshal_http(&query_context, &result_sets);
    Ok(reply_to_response(reply))
}

/// A v2 call that starts a query without a waiting connection: acquire a
/// transaction (the one synchronous step, so an unreachable database is
/// still a `503` with no job created), hand the caller a ticket, and run
/// the statements in the background (§4.4, §4.6).
async fn execute_deferred(
    context: Arc<ServerContext>,
    batch: crate::db::SqlBatch,
    query_context: crate::db::QueryContext,
) -> Result<Response, GatewayError> {
    let tx = context.query_engine.begin().await.map_err(|e| match e {
        QueryError::Unavailable(msg) => GatewayError::DbUnavailable(msg),
        QueryError::Execution(msg) => GatewayError::DbError(msg),
    })?;

    let job_id = context.jobs.create_pending().await;
    metrics::record_job_created();

    let background_context = Arc::clone(&context);
    let background_job_id = job_id.clone();
    tokio::spawn(async move {
        let start = Instant::now();
        let result = QueryEngine::run_batch(tx, &batch).await;
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_query(&query_context.path, status, start.elapsed());

        let reply = match result {
            Ok(result_sets) => marshal_http(&query_context, &result_sets)
                .body
                .unwrap_or(Value::Null),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        background_context.jobs.complete(&background_job_id, reply).await;
    });

    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "jobid": job_id }))).into_response())
}

fn reply_to_response(reply: MarshalledReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
    let mut response = match reply.body {
        Some(body) => (status, Json(body)).into_response(),
        None => status.into_response(),
    };

    let jar = reply.cookies.iter().fold(CookieJar::new(), |jar, directive| {
        jar.add(to_cookie(directive))
    });
    for cookie in jar.iter() {
        if let Ok(value) = axum::http::HeaderValue::from_str(&cookie.encoded().to_string()) {
            response.headers_mut().append(axum::http::header::SET_COOKIE, value);
        }
    }

    for header in &reply.headers {
        if let Ok(value) = axum::http::HeaderValue::from_str(&header.value) {
            if let Ok(name) = axum::http::HeaderName::from_bytes(header.name.as_bytes()) {
                response.headers_mut().insert(name, value);
            }
        }
    }

    response
}

fn to_cookie(directive: &CookieDirective) -> Cookie<'static> {
    let mut cookie = Cookie::new(directive.name, directive.value.clone().unwrap_or_default());
    cookie.set_path(directive.path);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(CookieDuration::seconds(directive.max_age_seconds.max(-1)));
    cookie
}

async fn oauth2_redirect(
    State(context): State<Arc<ServerContext>>,
    Path(provider): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Redirect, GatewayError> {
    let provider = context
        .providers
        .by_id(&provider)
        .await
        .ok_or(GatewayError::NotFound)?;

    if provider.auth_uri.is_empty() {
        return Err(GatewayError::NotFound);
    }

    let mut url = format!("{}?client_id={}", provider.auth_uri, provider.audience);
    for (key, value) in &query {
        url.push('&');
        url.push_str(&urlencoding_pair(key, value));
    }
    Ok(Redirect::to(&url))
}

fn urlencoding_pair(key: &str, value: &str) -> String {
    format!(
        "{}={}",
        percent_encode(key),
        percent_encode(value)
    )
}

fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// The `CheckUserAgent` precondition (§4.5 supplement): a request with no
/// `User-Agent` header, or an empty one, is rejected before any auth
/// parsing happens.
fn require_user_agent(headers: &HeaderMap) -> Result<String, GatewayError> {
    let agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if agent.is_empty() {
        tracing::debug!(target: "gateway.dispatch", "rejecting request with no User-Agent header");
        return Err(GatewayError::MalformedRequest("invalid_request".to_string()));
    }
    Ok(agent.to_string())
}

fn remote_host(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .unwrap_or_default()
}

fn token_error(error: crate::auth::TokenVerifyError) -> GatewayError {
    match error {
        crate::auth::TokenVerifyError::Expired => GatewayError::TokenExpired,
        crate::auth::TokenVerifyError::InvalidToken => GatewayError::InvalidToken,
        crate::auth::TokenVerifyError::Malformed => {
            GatewayError::MalformedRequest("malformed bearer token".to_string())
        }
    }
}

/// `GET /session/<identity>` (§4.9): upgrade to a WebSocket and attach it
/// to the identity's session record, swapping any prior connection.
async fn session_ws(
    State(context): State<Arc<ServerContext>>,
    Path(identity): Path<String>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    let agent = require_user_agent(&headers)?;
    let host = remote_host(&headers);
    Ok(upgrade.on_upgrade(move |socket| run_ws_session(context, identity, agent, host, socket)))
}

async fn run_ws_session(
    context: Arc<ServerContext>,
    identity: String,
    agent: String,
    host: String,
    mut socket: WebSocket,
) {
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<ServerFrame>();
    let handle = context.sessions.attach(&identity, outbound_tx.clone()).await;
    metrics::record_ws_connection_opened();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        let Ok(text) = serde_json::to_string(&frame) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_ws_text(&context, &handle, &identity, &agent, &host, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    context.sessions.detach(&identity, &outbound_tx).await;
    metrics::record_ws_connection_closed();
}

async fn handle_ws_text(
    context: &ServerContext,
    handle: &crate::ws::SessionHandle,
    identity: &str,
    agent: &str,
    host: &str,
    text: &str,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            handle
                .send(ServerFrame::Error {
                    unique_id: 0,
                    code: 400,
                    message: e.to_string(),
                    details: None,
                })
                .await;
            return;
        }
    };

    let (unique_id, action, payload) = match frame {
        ClientFrame::Open { unique_id, payload } => {
            if payload.get("session").is_some() && payload.get("secret").is_some() {
                (unique_id, "/authorize".to_string(), payload)
            } else {
                (unique_id, SIGN_IN_PATH.to_string(), payload)
            }
        }
        ClientFrame::Close { unique_id, payload } => (unique_id, SIGN_OUT_PATH.to_string(), payload),
        ClientFrame::Call {
            unique_id,
            action,
            payload,
        } => (unique_id, action, payload),
    };

    let outcome = run_ws_call(context, handle, identity, agent, host, &action, payload).await;
    match outcome {
        Ok(value) => {
            handle
                .send(ServerFrame::Result {
                    unique_id,
                    payload: value,
                })
                .await;
        }
        Err(error) => {
            handle
                .send(ServerFrame::Error {
                    unique_id,
                    code: error.http_status(),
                    message: error.to_string(),
                    details: None,
                })
                .await;
        }
    }
}

/// Process one resolved WS call (§4.9's "process as mtCall" step): sign
/// the call if a session secret is already known, sign a resume with the
/// secret the caller just supplied for `/authorize`, or run it unsigned
/// (the initial `/sign/in`).
async fn run_ws_call(
    context: &ServerContext,
    handle: &crate::ws::SessionHandle,
    identity: &str,
    agent: &str,
    host: &str,
    action: &str,
    payload: Value,
) -> Result<Value, GatewayError> {
    let credentials = handle.credentials().await;

    let (batch, query_context) = if let Some(creds) = &credentials {
        let nonce = current_micros().to_string();
        let payload_for_signature = serde_json::to_string(&payload)
            .unwrap_or_else(|_| "null".to_string());
        let signature = crate::ws::sign(&creds.secret, &nonce, action, payload_for_signature.as_bytes());
        sql_builder::sign_fetch(
            action,
            payload,
            &creds.session_token,
            &nonce,
            &signature,
            agent,
            host,
            context.config.sign_receive_window_ms,
        )
    } else if action == "/authorize" {
        // A WS resume: the caller has no cached `SessionHandle` credentials
        // yet, but supplies `session`/`secret` directly and must prove
        // knowledge of the secret the same way any other signed call does,
        // by signing this call with it, rather than being trusted on the
        // session string alone.
        let session = payload
            .get("session")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::MalformedRequest("missing session".to_string()))?
            .to_string();
        let secret = payload
            .get("secret")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::MalformedRequest("missing secret".to_string()))?
            .as_bytes()
            .to_vec();

        let mut resume_payload = payload.clone();
        if let Some(object) = resume_payload.as_object_mut() {
            object.remove("secret");
        }

        let nonce = current_micros().to_string();
        let payload_for_signature = serde_json::to_string(&resume_payload)
            .unwrap_or_else(|_| "null".to_string());
        let signature = crate::ws::sign(&secret, &nonce, action, payload_for_signature.as_bytes());
        sql_builder::sign_fetch(
            action,
            resume_payload,
            &session,
            &nonce,
            &signature,
            agent,
            host,
            context.config.sign_receive_window_ms,
        )
    } else {
        sql_builder::sign_in(payload, agent, host)
    };

    let result = context.query_engine.submit(&batch).await.map_err(|e| match e {
        crate::db::QueryError::Unavailable(msg) => GatewayError::DbUnavailable(msg),
        crate::db::QueryError::Execution(msg) => GatewayError::DbError(msg),
    })?;

    let row = result
        .first()
        .and_then(|rs| rs.rows.first())
        .cloned()
        .unwrap_or(Value::Null);

    if matches!(query_context.path.as_str(), "/sign/in" | "/authorize") {
        let result_true = row.get("result").and_then(Value::as_bool).unwrap_or(false);
        if result_true {
            if let (Some(session), Some(secret)) = (
                row.get("session").and_then(Value::as_str),
                row.get("secret").and_then(Value::as_str),
            ) {
                handle
                    .set_credentials(Some(SessionCredentials {
                        session_token: session.to_string(),
                        secret: secret.as_bytes().to_vec(),
                    }))
                    .await;
            }
        }
    } else if query_context.path == SIGN_OUT_PATH {
        handle.set_credentials(None).await;
    }

    let _ = identity;
    Ok(row)
}

fn current_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encode_escapes_reserved_characters() {
        assert_eq!(percent_encode("a b"), "a%20b");
        assert_eq!(percent_encode("a&b"), "a%26b");
        assert_eq!(percent_encode("safe-_.~"), "safe-_.~");
    }

    #[test]
    fn to_cookie_clears_value_when_none() {
        let directive = CookieDirective {
            name: "AWS-Session",
            value: None,
            path: "/",
            max_age_seconds: -1,
        };
        let cookie = to_cookie(&directive);
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age().unwrap().whole_seconds(), -1);
    }
}
