//! Worker/router allocation.
//!
//! A fixed pool of media workers is created once at startup. Routers are
//! placed on workers in strict round-robin order. There is no in-place worker
//! replacement: the first worker death is reported through
//! [`WorkerPool::wait_for_worker_death`] and the binary exits, leaving the
//! restart to the process supervisor.

use super::{
    media_codecs, Direction, EngineObject, MediaEngine, MediaError, MediaEvent, MediaRouter,
    MediaTransport, MediaWorker, TransportOptions, TransportParams, WorkerSettings,
};
use crate::config::MediaConfig;
use crate::observability::{metrics, HealthState};
use futures_util::future::select_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, instrument, warn};

/// Report of a dead worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub worker_id: String,
    pub reason: String,
}

/// Round-robin pool of media workers.
pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    next: AtomicUsize,
    media_codecs: EngineObject,
    initial_outgoing_bitrate: u32,
    max_incoming_bitrate: u32,
    announced_address: Option<String>,
}

impl WorkerPool {
    /// Spawn `config.num_workers` workers on `engine`.
    #[instrument(skip_all, name = "room.media.start", fields(num_workers = config.num_workers))]
    pub async fn start(engine: &dyn MediaEngine, config: &MediaConfig) -> Result<Self, MediaError> {
        if config.num_workers == 0 {
            return Err(MediaError::NoWorkers);
        }

        let settings = WorkerSettings {
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
        };

        let mut workers = Vec::with_capacity(config.num_workers);
        for _ in 0..config.num_workers {
            let worker = engine.create_worker(&settings).await?;
            info!(target: "room.media", worker_id = %worker.id(), "Media worker started");
            workers.push(worker);
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            media_codecs: media_codecs(),
            initial_outgoing_bitrate: config.initial_outgoing_bitrate,
            max_incoming_bitrate: config.max_incoming_bitrate,
            announced_address: config.announced_address.clone(),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Next worker in round-robin order.
    pub fn next_worker(&self) -> Result<Arc<dyn MediaWorker>, MediaError> {
        if self.workers.is_empty() {
            return Err(MediaError::NoWorkers);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers.get(index).cloned().ok_or(MediaError::NoWorkers)
    }

    /// Create a router for a new room on the next worker.
    pub async fn create_router(&self) -> Result<Arc<dyn MediaRouter>, MediaError> {
        let worker = self.next_worker()?;
        let router = worker.create_router(&self.media_codecs).await?;
        debug!(
            target: "room.media",
            worker_id = %worker.id(),
            router_id = %router.id(),
            "Router created"
        );
        Ok(router)
    }

    /// Create a transport on `router` and apply the incoming bitrate ceiling.
    ///
    /// `bitrate_ceiling` is the room's tier limit. The effective cap is the
    /// lower of that and the configured global maximum. Failing to apply the
    /// cap is logged and otherwise ignored.
    pub async fn create_transport(
        &self,
        router: &dyn MediaRouter,
        direction: Direction,
        bitrate_ceiling: Option<u32>,
    ) -> Result<(Arc<dyn MediaTransport>, TransportParams), MediaError> {
        let options = TransportOptions {
            direction,
            initial_available_outgoing_bitrate: self.initial_outgoing_bitrate,
            announced_address: self.announced_address.clone(),
        };
        let transport = router.create_transport(&options).await?;

        let cap = match bitrate_ceiling {
            Some(ceiling) if self.max_incoming_bitrate > 0 => ceiling.min(self.max_incoming_bitrate),
            Some(ceiling) => ceiling,
            None => self.max_incoming_bitrate,
        };
        if cap > 0 {
            if let Err(e) = transport.set_max_incoming_bitrate(cap).await {
                warn!(
                    target: "room.media",
                    transport_id = %transport.id(),
                    error = %e,
                    "Failed to set max incoming bitrate, continuing without cap"
                );
            }
        }

        let params = transport.params();
        Ok((transport, params))
    }

    /// Future that resolves when the first worker dies.
    ///
    /// Every worker is subscribed before this returns, so a death after the
    /// call is never missed even if the future is polled later. Never
    /// resolves if the pool is empty or every worker is closed cleanly.
    pub fn wait_for_worker_death(&self) -> impl Future<Output = WorkerDeath> + Send + 'static {
        let watches: Vec<_> = self
            .workers
            .iter()
            .map(|worker| Box::pin(watch_worker(worker.id().to_string(), worker.subscribe())))
            .collect();

        async move {
            if watches.is_empty() {
                return std::future::pending().await;
            }
            let (death, _, _) = select_all(watches).await;
            death
        }
    }

    /// Close every worker.
    pub fn close(&self) {
        for worker in &self.workers {
            worker.close();
        }
    }
}

async fn watch_worker(
    worker_id: String,
    mut events: broadcast::Receiver<MediaEvent>,
) -> WorkerDeath {
    loop {
        match events.recv().await {
            Ok(MediaEvent::WorkerDied { reason }) => {
                error!(
                    target: "room.media",
                    worker_id = %worker_id,
                    reason = %reason,
                    "Media worker died"
                );
                return WorkerDeath { worker_id, reason };
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            // Closed without dying: nothing left to watch.
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}

/// Wait for the first worker death and take the service out of rotation.
///
/// Workers are subscribed when this is called. The caller decides what
/// happens after the death; the binary exits after `worker_death_exit_delay`.
pub fn supervise_workers(
    workers: &WorkerPool,
    health: Arc<HealthState>,
) -> impl Future<Output = WorkerDeath> + Send + 'static {
    let death = workers.wait_for_worker_death();
    async move {
        let death = death.await;
        health.set_not_ready();
        metrics::record_worker_death();
        death
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::local::LocalEngine;
    use std::time::Duration;

    fn media_config(num_workers: usize) -> MediaConfig {
        MediaConfig {
            num_workers,
            initial_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: 1_500_000,
            rtc_min_port: 40_000,
            rtc_max_port: 40_099,
            announced_address: None,
            worker_death_exit_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_next_worker_is_round_robin() {
        let engine = LocalEngine::new();
        let pool = WorkerPool::start(&engine, &media_config(3)).await.unwrap();

        let ids: Vec<String> = (0..7)
            .map(|_| pool.next_worker().unwrap().id().to_string())
            .collect();
        let workers: Vec<String> = engine
            .workers()
            .iter()
            .map(|w| w.id().to_string())
            .collect();

        let expected: Vec<String> = (0..7)
            .map(|i| workers.get(i % 3).unwrap().clone())
            .collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_routers_spread_across_workers() {
        let engine = LocalEngine::new();
        let pool = WorkerPool::start(&engine, &media_config(2)).await.unwrap();

        for _ in 0..4 {
            pool.create_router().await.unwrap();
        }

        for worker in engine.workers() {
            assert_eq!(worker.routers().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let engine = LocalEngine::new();
        assert_eq!(
            WorkerPool::start(&engine, &media_config(0)).await.err(),
            Some(MediaError::NoWorkers)
        );
    }

    #[tokio::test]
    async fn test_transport_gets_lowest_bitrate_cap() {
        let engine = LocalEngine::new();
        let pool = WorkerPool::start(&engine, &media_config(1)).await.unwrap();
        let router = pool.create_router().await.unwrap();

        let (transport, params) = pool
            .create_transport(router.as_ref(), Direction::Send, Some(800_000))
            .await
            .unwrap();
        assert_eq!(params.id, transport.id());
        let local = engine.find_transport(transport.id()).unwrap();
        assert_eq!(local.max_incoming_bitrate(), 800_000);

        let (transport, _) = pool
            .create_transport(router.as_ref(), Direction::Send, Some(4_000_000))
            .await
            .unwrap();
        let local = engine.find_transport(transport.id()).unwrap();
        assert_eq!(local.max_incoming_bitrate(), 1_500_000);
    }

    #[tokio::test]
    async fn test_bitrate_cap_failure_is_swallowed() {
        let engine = LocalEngine::new();
        engine.reject_bitrate_caps();
        let pool = WorkerPool::start(&engine, &media_config(1)).await.unwrap();
        let router = pool.create_router().await.unwrap();

        let result = pool
            .create_transport(router.as_ref(), Direction::Recv, None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_worker_death_is_reported() {
        let engine = LocalEngine::new();
        let pool = Arc::new(WorkerPool::start(&engine, &media_config(2)).await.unwrap());

        let watcher = tokio::spawn(pool.wait_for_worker_death());

        let victim = engine.workers().get(1).unwrap().clone();
        victim.kill("out of memory");

        let death = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("death should be reported")
            .unwrap();
        assert_eq!(death.worker_id, victim.id());
        assert_eq!(death.reason, "out of memory");
    }

    #[tokio::test]
    async fn test_supervisor_clears_readiness() {
        let engine = LocalEngine::new();
        let pool = WorkerPool::start(&engine, &media_config(1)).await.unwrap();
        let health = Arc::new(HealthState::new());
        health.set_ready();

        let supervisor = supervise_workers(&pool, Arc::clone(&health));
        engine.workers().first().unwrap().kill("segfault");
        let death = tokio::time::timeout(Duration::from_secs(1), supervisor)
            .await
            .expect("death should be reported");

        assert_eq!(death.reason, "segfault");
        assert!(!health.is_ready());
    }

    #[tokio::test]
    async fn test_clean_close_is_not_a_death() {
        let engine = LocalEngine::new();
        let pool = WorkerPool::start(&engine, &media_config(1)).await.unwrap();

        let watcher = pool.wait_for_worker_death();
        pool.close();

        assert!(tokio::time::timeout(Duration::from_millis(50), watcher)
            .await
            .is_err());
    }
}
