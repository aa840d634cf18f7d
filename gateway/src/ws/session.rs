//! Session Manager (§4.9): one entry per authenticated identity, holding
//! whatever connection currently represents it. Reconnecting swaps the
//! connection pointer in place so in-flight `pendingMessages` survive a
//! dropped socket instead of being discarded with it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};

use super::codec::ServerFrame;

/// Outbound half of a live connection: frames are pushed here and the
/// WebSocket task forwards them to the socket.
pub type ConnectionSender = tokio::sync::mpsc::UnboundedSender<ServerFrame>;

struct SessionState {
    connection: Option<ConnectionSender>,
    pending: HashMap<i64, oneshot::Sender<ServerFrame>>,
    credentials: Option<SessionCredentials>,
}

/// The session/secret pair a resumed connection authenticates with,
/// carried across a reconnect the same way the connection pointer is.
#[derive(Clone)]
pub struct SessionCredentials {
    pub session_token: String,
    pub secret: Vec<u8>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            connection: None,
            pending: HashMap::new(),
            credentials: None,
        }
    }
}

/// A handle bound to one identity's session entry, used by a connection
/// task for the lifetime of one socket.
pub struct SessionHandle {
    identity: String,
    manager: Arc<RwLock<HashMap<String, SessionState>>>,
}

impl SessionHandle {
    /// Send `frame` to whatever connection currently represents this
    /// identity, if any is attached.
    pub async fn send(&self, frame: ServerFrame) -> bool {
        let states = self.manager.read().await;
        match states.get(&self.identity).and_then(|s| s.connection.as_ref()) {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Register a oneshot to be fulfilled when a result for `unique_id`
    /// arrives, correlating an outbound call with its eventual answer.
    pub async fn await_result(&self, unique_id: i64) -> oneshot::Receiver<ServerFrame> {
        let (tx, rx) = oneshot::channel();
        let mut states = self.manager.write().await;
        let state = states
            .entry(self.identity.clone())
            .or_insert_with(SessionState::new);
        state.pending.insert(unique_id, tx);
        rx
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Store the session/secret pair established by a successful
    /// `/sign/in`, `/sign/out`, or resume, so a later reconnect can skip
    /// re-authenticating (§4.9 state machine: `authorized`).
    pub async fn set_credentials(&self, credentials: Option<SessionCredentials>) {
        let mut states = self.manager.write().await;
        let state = states
            .entry(self.identity.clone())
            .or_insert_with(SessionState::new);
        state.credentials = credentials;
    }

    pub async fn credentials(&self) -> Option<SessionCredentials> {
        self.manager
            .read()
            .await
            .get(&self.identity)
            .and_then(|s| s.credentials.clone())
    }
}

/// Identity-keyed table of sessions (§5: one table, one lock). A
/// reconnect attaches a fresh connection without losing pending calls or
/// the nonce replay set belonging to that identity.
#[derive(Clone)]
pub struct SessionManager {
    states: Arc<RwLock<HashMap<String, SessionState>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Attach `connection` as the live connection for `identity`,
    /// replacing whatever connection (if any) was there before. Pending
    /// calls and seen nonces for that identity are preserved.
    pub async fn attach(&self, identity: &str, connection: ConnectionSender) -> SessionHandle {
        let mut states = self.states.write().await;
        let state = states
            .entry(identity.to_string())
            .or_insert_with(SessionState::new);
        state.connection = Some(connection);

        SessionHandle {
            identity: identity.to_string(),
            manager: Arc::clone(&self.states),
        }
    }

    /// Detach the connection for `identity` if `connection` is still the
    /// one attached; a stale detach from an already-replaced connection is
    /// a no-op so a slow-closing old socket can't clobber a fresh one.
    pub async fn detach(&self, identity: &str, connection: &ConnectionSender) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(identity) {
            let is_current = state
                .connection
                .as_ref()
                .is_some_and(|c| c.same_channel(connection));
            if is_current {
                state.connection = None;
            }
        }
    }

    /// Deliver a result or error frame to whichever pending call is
    /// waiting on `unique_id` for `identity`.
    pub async fn resolve(&self, identity: &str, unique_id: i64, frame: ServerFrame) -> bool {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(identity) else {
            return false;
        };
        match state.pending.remove(&unique_id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn is_connected(&self, identity: &str) -> bool {
        self.states
            .read()
            .await
            .get(identity)
            .is_some_and(|s| s.connection.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_then_send_delivers_to_the_connection() {
        let manager = SessionManager::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = manager.attach("user-1", tx).await;

        handle
            .send(ServerFrame::Result {
                unique_id: 1,
                payload: serde_json::json!(null),
            })
            .await;

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, ServerFrame::Result { unique_id: 1, .. }));
    }

    #[tokio::test]
    async fn reconnect_swaps_connection_without_dropping_pending_calls() {
        let manager = SessionManager::new();
        let (tx1, _rx1) = tokio::sync::mpsc::unbounded_channel();
        let handle = manager.attach("user-1", tx1).await;
        let mut pending = handle.await_result(42).await;

        let (tx2, mut rx2) = tokio::sync::mpsc::unbounded_channel();
        manager.attach("user-1", tx2).await;

        manager
            .resolve(
                "user-1",
                42,
                ServerFrame::Result {
                    unique_id: 42,
                    payload: serde_json::json!("done"),
                },
            )
            .await;

        let resolved = pending.try_recv().unwrap();
        assert!(matches!(resolved, ServerFrame::Result { unique_id: 42, .. }));

        handle
            .send(ServerFrame::Result {
                unique_id: 2,
                payload: serde_json::json!(null),
            })
            .await;
        let received = rx2.recv().await.unwrap();
        assert!(matches!(received, ServerFrame::Result { unique_id: 2, .. }));
    }

    #[tokio::test]
    async fn detach_of_stale_connection_does_not_clobber_the_new_one() {
        let manager = SessionManager::new();
        let (tx1, _rx1) = tokio::sync::mpsc::unbounded_channel();
        manager.attach("user-1", tx1.clone()).await;

        let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
        manager.attach("user-1", tx2).await;

        manager.detach("user-1", &tx1).await;
        assert!(manager.is_connected("user-1").await);
    }

    #[tokio::test]
    async fn credentials_survive_a_reconnect() {
        let manager = SessionManager::new();
        let (tx1, _rx1) = tokio::sync::mpsc::unbounded_channel();
        let handle = manager.attach("user-1", tx1).await;
        handle
            .set_credentials(Some(SessionCredentials {
                session_token: "s".to_string(),
                secret: b"secret".to_vec(),
            }))
            .await;

        let (tx2, _rx2) = tokio::sync::mpsc::unbounded_channel();
        let handle2 = manager.attach("user-1", tx2).await;

        let creds = handle2.credentials().await.unwrap();
        assert_eq!(creds.session_token, "s");
    }
}
