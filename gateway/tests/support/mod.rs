//! Minimal server harness for integration tests, in the style of the
//! workspace's own `TestAuthServer`: spawn the real router against an
//! ephemeral `#[sqlx::test]` database and hand back its base URL.

use std::net::SocketAddr;
use std::sync::Arc;

use apostol_gateway::auth::ProviderKeyStore;
use apostol_gateway::config::Config;
use apostol_gateway::db::{JobRegistry, QueryEngine};
use apostol_gateway::dispatch::{build_router, ServerContext};
use apostol_gateway::ws::SessionManager;
use secrecy::SecretBox;
use sqlx::PgPool;
use tokio::task::JoinHandle;

pub struct TestServer {
    addr: SocketAddr,
    _handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn spawn(pool: PgPool) -> Result<Self, anyhow::Error> {
        let config = Config {
            database_url: String::new(),
            bind_address: "127.0.0.1:0".to_string(),
            certs_prefix: std::env::temp_dir().to_string_lossy().to_string(),
            server_hs256_secret: SecretBox::new(Box::new(b"test-server-secret".to_vec())),
            admin_password: SecretBox::new(Box::new(b"test-admin-pwd".to_vec())),
            sign_receive_window_ms: 5000,
            provider_reload_interval_secs: 3600,
            jwt_clock_skew_seconds: 300,
            otlp_endpoint: None,
            fixed_server_time_ms: Some(1_700_000_000_000),
            enabled: true,
            db_max_connections: 5,
            db_min_connections: 1,
            db_acquire_timeout: std::time::Duration::from_secs(5),
            db_idle_timeout: std::time::Duration::from_secs(60),
            db_max_lifetime: std::time::Duration::from_secs(300),
            db_statement_timeout_secs: 30,
            drain_seconds: 0,
        };

        let context = Arc::new(ServerContext {
            query_engine: QueryEngine::new(pool),
            providers: ProviderKeyStore::new(&config.certs_prefix),
            jobs: JobRegistry::default(),
            sessions: SessionManager::new(),
            config,
        });

        let app = build_router(context);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });

        Ok(Self {
            addr,
            _handle: handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}
