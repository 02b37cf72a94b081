//! Test server harness for E2E testing
//!
//! Provides `TestRoomServer` for spawning real room service instances in
//! tests, backed by the in-process media engine.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use room_service::actors::RoomRegistryActorHandle;
use room_service::auth::SessionTokenIssuer;
use room_service::capacity::CapacityPool;
use room_service::config::Config;
use room_service::media::allocator::{supervise_workers, WorkerDeath, WorkerPool};
use room_service::media::local::{LocalEngine, LocalTransport, LocalWorker};
use room_service::observability::{init_metrics_recorder, HealthState};
use room_service::registry::RoomRegistry;
use room_service::routes::{self, AppState};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Signing key used by every test server.
pub const TEST_JWT_SECRET: &str = "test-secret-0123456789abcdef0123456789";

/// The process-wide recorder can only be installed once; later servers in
/// the same test binary share its handle.
fn metrics_handle() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            init_metrics_recorder()
                .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle())
        })
        .clone()
}

/// Builder for a `TestRoomServer` with configuration overrides.
///
/// # Example
/// ```rust,ignore
/// let server = TestRoomServer::builder()
///     .var("TOTAL_MAX_ROOMS", "2")
///     .var("FREE_POOL_PERCENT", "100")
///     .spawn()
///     .await?;
/// ```
#[derive(Debug, Default)]
pub struct TestRoomServerBuilder {
    vars: HashMap<String, String>,
}

impl TestRoomServerBuilder {
    /// Override one environment variable.
    pub fn var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    pub async fn spawn(self) -> Result<TestRoomServer, anyhow::Error> {
        let mut vars = HashMap::from([
            ("ROOM_JWT_SECRET".to_string(), TEST_JWT_SECRET.to_string()),
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("CORS_ORIGIN".to_string(), "*".to_string()),
            // Minimum bcrypt cost keeps admission tests fast
            ("PASSWORD_HASH_COST".to_string(), "4".to_string()),
            ("MEDIA_WORKERS".to_string(), "2".to_string()),
        ]);
        vars.extend(self.vars);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let engine = Arc::new(LocalEngine::new());
        let workers = Arc::new(
            WorkerPool::start(engine.as_ref(), &config.media)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to start media workers: {}", e))?,
        );

        let registry = RoomRegistryActorHandle::new(
            RoomRegistry::new(CapacityPool::new(config.capacity), config.tiers.clone()),
            config.housekeeping.clone(),
        );
        let issuer = SessionTokenIssuer::new(&config.jwt_secret, config.session_token_ttl_seconds);
        let health = Arc::new(HealthState::new());

        // Same supervision as the binary, minus the process exit
        let (death_tx, death_rx) = watch::channel(None);
        let supervisor = supervise_workers(&workers, Arc::clone(&health));
        let supervisor_handle = tokio::spawn(async move {
            let death = supervisor.await;
            let _ = death_tx.send(Some(death));
        });

        let state = Arc::new(AppState {
            config: config.clone(),
            registry: registry.clone(),
            issuer: issuer.clone(),
            workers,
            health: Arc::clone(&health),
            started_at: Instant::now(),
        });

        // Build routes using room-service's real route builder
        let app = routes::build_routes(state, metrics_handle());

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        // Spawn server in background
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });
        health.set_ready();

        Ok(TestRoomServer {
            addr,
            config,
            engine,
            registry,
            issuer,
            worker_death: death_rx,
            _handle: handle,
            _supervisor: supervisor_handle,
        })
    }
}

/// Test harness for spawning the room service in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health() -> Result<(), anyhow::Error> {
///     let server = TestRoomServer::spawn().await?;
///     let response = reqwest::get(format!("{}/api/health", server.url())).await?;
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestRoomServer {
    addr: SocketAddr,
    config: Config,
    engine: Arc<LocalEngine>,
    registry: RoomRegistryActorHandle,
    issuer: SessionTokenIssuer,
    worker_death: watch::Receiver<Option<WorkerDeath>>,
    _handle: JoinHandle<()>,
    _supervisor: JoinHandle<()>,
}

impl TestRoomServer {
    /// Spawn a server with default test configuration.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Run two in-process media workers
    /// - Start the HTTP server in the background and mark itself ready
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::builder().spawn().await
    }

    pub fn builder() -> TestRoomServerBuilder {
        TestRoomServerBuilder::default()
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Signaling URL for a session token.
    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registry handle, for direct state inspection.
    pub fn registry(&self) -> &RoomRegistryActorHandle {
        &self.registry
    }

    /// Token issuer sharing the server's signing key.
    pub fn issuer(&self) -> &SessionTokenIssuer {
        &self.issuer
    }

    pub fn workers(&self) -> Vec<Arc<LocalWorker>> {
        self.engine.workers()
    }

    pub fn transport(&self, transport_id: &str) -> Option<Arc<LocalTransport>> {
        self.engine.find_transport(transport_id)
    }

    /// Make every transport refuse bitrate caps.
    pub fn reject_bitrate_caps(&self) {
        self.engine.reject_bitrate_caps();
    }

    /// First reported worker death, if any.
    pub fn worker_death(&self) -> Option<WorkerDeath> {
        self.worker_death.borrow().clone()
    }

    /// Wait until a worker death has been reported.
    pub async fn wait_for_worker_death(&self) -> Result<WorkerDeath, anyhow::Error> {
        let mut rx = self.worker_death.clone();
        let death = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| anyhow::anyhow!("Worker supervisor stopped: {}", e))?;
        death
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Worker death missing"))
    }

    /// `POST /api/rooms/create` and return status plus JSON body.
    pub async fn create_room(
        &self,
        room_name: &str,
        password: &str,
        display_name: &str,
        tier: &str,
    ) -> Result<(u16, Value), anyhow::Error> {
        self.post(
            "/api/rooms/create",
            &json!({
                "roomName": room_name,
                "password": password,
                "displayName": display_name,
                "tier": tier,
            }),
        )
        .await
    }

    /// `POST /api/rooms/join` and return status plus JSON body.
    pub async fn join_room(
        &self,
        room_name: &str,
        password: &str,
        display_name: &str,
    ) -> Result<(u16, Value), anyhow::Error> {
        self.post(
            "/api/rooms/join",
            &json!({
                "roomName": room_name,
                "password": password,
                "displayName": display_name,
            }),
        )
        .await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<(u16, Value), anyhow::Error> {
        let response = reqwest::Client::new()
            .post(format!("{}{}", self.url(), path))
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    pub async fn get(&self, path: &str) -> Result<(u16, Value), anyhow::Error> {
        let response = reqwest::get(format!("{}{}", self.url(), path)).await?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }
}

impl Drop for TestRoomServer {
    fn drop(&mut self) {
        // Stop the HTTP server, the supervisor and the registry actor when
        // the test completes.
        self._handle.abort();
        self._supervisor.abort();
        self.registry.cancel();
    }
}
