//! Result Marshaller (§4.8): turns a finished query's result sets into a
//! JSON reply, applying the path-keyed cookie/header side effects that
//! `/sign/in`, `/sign/out`, and `/authenticate` require.

use serde_json::Value;

use crate::auth::GrantType;
use crate::db::{QueryContext, ResultSet};

const SESSION_COOKIE: &str = "AWS-Session";
const KEY_COOKIE: &str = "API-Key";
/// 60 days, in seconds, matching the cookie lifetime §4.8 specifies.
const COOKIE_MAX_AGE_SECONDS: i64 = 60 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct CookieDirective {
    pub name: &'static str,
    pub value: Option<String>,
    pub path: &'static str,
    pub max_age_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct HeaderDirective {
    pub name: &'static str,
    pub value: String,
}

/// Everything a dispatcher needs to write the HTTP response: a status, a
/// JSON body (absent for 204), and any cookies/headers `AfterQuery` set.
#[derive(Debug, Clone, Default)]
pub struct MarshalledReply {
    pub status: u16,
    pub body: Option<Value>,
    pub cookies: Vec<CookieDirective>,
    pub headers: Vec<HeaderDirective>,
}

/// Marshal a completed query's result sets for a non-WebSocket caller.
pub fn marshal_http(context: &QueryContext, result_sets: &[ResultSet]) -> MarshalledReply {
    let first = result_sets.first();
    let rows = first.map(|r| r.rows.as_slice()).unwrap_or(&[]);

    let (auth_row, response_rows): (Option<&Value>, &[Value]) =
        if context.grant_type == Some(GrantType::Client) {
            match rows.split_first() {
                Some((auth, rest)) => (Some(auth), rest),
                None => (None, rows),
            }
        } else {
            (None, rows)
        };

    let body = rows_to_value(response_rows);
    let mut reply = MarshalledReply {
        status: if context.grant_type == Some(GrantType::Client) && response_rows.is_empty() {
            204
        } else {
            200
        },
        body: if reply_has_body(context, response_rows) {
            Some(body)
        } else {
            None
        },
        cookies: Vec::new(),
        headers: Vec::new(),
    };

    if let Some(auth_row) = auth_row {
        apply_after_query(&mut reply, "/authenticate", auth_row);
    }
    apply_after_query(&mut reply, &context.path, rows.first().unwrap_or(&Value::Null));

    reply
}

fn reply_has_body(context: &QueryContext, response_rows: &[Value]) -> bool {
    !(context.grant_type == Some(GrantType::Client) && response_rows.is_empty())
}

fn rows_to_value(rows: &[Value]) -> Value {
    match rows {
        [] => Value::Object(serde_json::Map::new()),
        [single] => single.clone(),
        many => Value::Array(many.to_vec()),
    }
}

fn apply_after_query(reply: &mut MarshalledReply, path: &str, row: &Value) {
    let result_true = row.get("result").and_then(Value::as_bool).unwrap_or(false);

    match path {
        "/sign/in" if result_true => {
            if let Some(session) = row.get("session").and_then(Value::as_str) {
                reply.cookies.push(CookieDirective {
                    name: SESSION_COOKIE,
                    value: Some(session.to_string()),
                    path: "/",
                    max_age_seconds: COOKIE_MAX_AGE_SECONDS,
                });
            }
            if let Some(key) = row.get("key").and_then(Value::as_str) {
                reply.cookies.push(CookieDirective {
                    name: KEY_COOKIE,
                    value: Some(key.to_string()),
                    path: "/api",
                    max_age_seconds: COOKIE_MAX_AGE_SECONDS,
                });
            }
        }
        "/sign/out" => {
            reply.cookies.push(CookieDirective {
                name: SESSION_COOKIE,
                value: None,
                path: "/",
                max_age_seconds: -1,
            });
            reply.cookies.push(CookieDirective {
                name: KEY_COOKIE,
                value: None,
                path: "/api",
                max_age_seconds: -1,
            });
        }
        "/authenticate" if result_true => {
            if let Some(key) = row.get("key").and_then(Value::as_str) {
                reply.headers.push(HeaderDirective {
                    name: "Key",
                    value: key.to_string(),
                });
                reply.cookies.push(CookieDirective {
                    name: KEY_COOKIE,
                    value: Some(key.to_string()),
                    path: "/api",
                    max_age_seconds: COOKIE_MAX_AGE_SECONDS,
                });
            }
        }
        _ => {}
    }
}
