//! Object Route (§4.6): maps a v1 GET's `<command>[/<action>]` shape and
//! query parameters onto the path + payload that `AuthFetch` expects.

use std::collections::HashMap;

use serde_json::{Map, Value};

const LIST_LIKE_COMMANDS: &[&str] = &["client", "contract", "address"];

/// Resolve `command`/`action`/query-params into the `(path, payload)` pair
/// to hand to the SQL builder, or `None` for an unrecognized command.
pub fn resolve(
    command: &str,
    action: Option<&str>,
    query: &HashMap<String, String>,
) -> Option<(String, Value)> {
    match command {
        "whoami" => Some(("/whoami".to_string(), Value::Null)),

        "current" => {
            let action = action?;
            Some((format!("/current/{action}"), Value::Null))
        }

        "method" => {
            let path = match action {
                Some("get") => "/method/get".to_string(),
                Some(other) => format!("/method/{other}"),
                None => "/method".to_string(),
            };
            Some((path, method_payload(query)))
        }

        _ if LIST_LIKE_COMMANDS.contains(&command) => {
            let verb = if query.contains_key("id") {
                "get"
            } else if let Some(action) = action {
                action
            } else {
                "list"
            };
            Some((format!("/{command}/{verb}"), method_payload(query)))
        }

        _ => None,
    }
}

fn method_payload(query: &HashMap<String, String>) -> Value {
    let mut payload = Map::new();
    for field in ["object", "state", "class", "classcode", "statecode"] {
        if let Some(value) = query.get(field) {
            payload.insert(field.to_string(), Value::String(value.clone()));
        }
    }
    if let Some(id) = query.get("id") {
        payload.insert("id".to_string(), Value::String(id.clone()));
    }
    Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn whoami_has_no_payload() {
        let (path, payload) = resolve("whoami", None, &query(&[])).unwrap();
        assert_eq!(path, "/whoami");
        assert_eq!(payload, Value::Null);
    }

    #[test]
    fn current_requires_an_action() {
        assert!(resolve("current", None, &query(&[])).is_none());
        let (path, _) = resolve("current", Some("meeting"), &query(&[])).unwrap();
        assert_eq!(path, "/current/meeting");
    }

    #[test]
    fn method_without_action_uses_bare_path() {
        let (path, payload) =
            resolve("method", None, &query(&[("object", "door"), ("state", "open")])).unwrap();
        assert_eq!(path, "/method");
        assert_eq!(payload, serde_json::json!({"object": "door", "state": "open"}));
    }

    #[test]
    fn method_get_uses_get_subpath() {
        let (path, _) = resolve("method", Some("get"), &query(&[])).unwrap();
        assert_eq!(path, "/method/get");
    }

    #[test]
    fn list_like_command_prefers_get_when_id_present() {
        let (path, payload) = resolve("client", None, &query(&[("id", "42")])).unwrap();
        assert_eq!(path, "/client/get");
        assert_eq!(payload, serde_json::json!({"id": "42"}));
    }

    #[test]
    fn list_like_command_defaults_to_list_without_id() {
        let (path, _) = resolve("contract", None, &query(&[])).unwrap();
        assert_eq!(path, "/contract/list");
    }

    #[test]
    fn list_like_command_honors_explicit_action_over_list() {
        let (path, _) = resolve("address", Some("count"), &query(&[])).unwrap();
        assert_eq!(path, "/address/count");
    }

    #[test]
    fn unknown_command_is_none() {
        assert!(resolve("bogus", None, &query(&[])).is_none());
    }
}
