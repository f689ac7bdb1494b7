//! HTTP authorization endpoint in front of a pool of workers.
//!
//! Each worker owns an isolated [`Limiter`] and its own refill task; the only
//! thing workers share is the store. Requests are handed to workers
//! round-robin, so consecutive requests for the same key are decided by
//! different workers against the same bucket.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{KeyrateError, Result};
use crate::ratelimit::{Decision, KeyRateConfig, Limiter, LimiterSettings, REJECT_BODY, REJECT_STATUS};
use crate::store::SharedStore;

/// A pool of isolated workers sharing one store.
pub struct Gateway {
    workers: Vec<Arc<Limiter>>,
    next: AtomicUsize,
}

impl Gateway {
    /// Start `count` workers, each with its own rule table built from `rules`.
    pub async fn start(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        rules: &KeyRateConfig,
        settings: LimiterSettings,
        count: usize,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for worker in 0..count.max(1) {
            let limiter = Limiter::start(store.clone(), clock.clone(), rules, settings).await?;
            debug!(worker, generation = %limiter.generation(), "Worker started");
            workers.push(Arc::new(limiter));
        }
        info!(workers = workers.len(), "Gateway started");

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn workers(&self) -> &[Arc<Limiter>] {
        &self.workers
    }

    /// Decide a request on the next worker.
    pub async fn check(&self, headers: &HeaderMap, uri: &Uri) -> Decision {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].check(headers, uri).await
    }

    /// Start one refill task per worker.
    pub fn spawn_refill_tasks(&self, period: Duration) -> Vec<JoinHandle<()>> {
        self.workers
            .iter()
            .map(|worker| worker.spawn_refill_task(period))
            .collect()
    }

    /// Reload every worker. Workers that reject the rules keep their current ones.
    pub async fn reload(&self, rules: &KeyRateConfig) -> Result<()> {
        let results =
            futures::future::join_all(self.workers.iter().map(|worker| worker.reload(rules))).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}

/// Build the router: every path and method is a rate limit check.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new().fallback(check_request).with_state(gateway)
}

async fn check_request(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    decision_response(&gateway.check(&headers, &uri).await)
}

/// Map a decision to the response sent to the client.
pub fn decision_response(decision: &Decision) -> Response {
    match decision {
        Decision::Allowed(_) => (StatusCode::OK, "ok").into_response(),
        Decision::Denied { .. } => (REJECT_STATUS, REJECT_BODY).into_response(),
    }
}

/// Watches the rules file and reloads the gateway when its content changes.
pub fn spawn_rules_watcher(
    gateway: Arc<Gateway>,
    path: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = tokio::fs::read_to_string(&path).await.ok();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read rules file");
                    continue;
                }
            };
            if last.as_deref() == Some(contents.as_str()) {
                continue;
            }

            match KeyRateConfig::parse(&contents, &path) {
                Ok(rules) => match gateway.reload(&rules).await {
                    Ok(()) => info!(path = %path.display(), "Rules reloaded"),
                    Err(e) => warn!(error = %e, "Rules reload failed, keeping current rules"),
                },
                Err(e) => warn!(error = %e, "Invalid rules file, keeping current rules"),
            }
            last = Some(contents);
        }
    })
}

/// HTTP server for the authorization endpoint.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    pub fn new(addr: SocketAddr, gateway: Arc<Gateway>) -> Self {
        Self { addr, gateway }
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server for rate limit checks");

        axum::serve(listener, router(self.gateway))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                KeyrateError::Server(e.to_string())
            })
    }
}
