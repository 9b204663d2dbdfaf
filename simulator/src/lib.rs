//! A local stand-in for the PsiCash reward API.
//!
//! Serves `POST /v1/transaction` and `GET /v1/validate-tokens` with per-token cooldowns,
//! and lets tests inject failures and latency and inspect every request received.

use psicash_types::{Clock, SystemClock};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::info;

mod api;
pub use api::Api;

mod metrics;
pub use metrics::{HttpMetrics, HttpMetricsSnapshot};

mod state;
pub use state::{
    format_time, RequestRecord, SimulatorConfig, State, TransactionOutcome,
    DEFAULT_COOLDOWN_SECS, REWARD_CLASSES,
};

/// Prefix of every API route, matching the production API.
pub const API_PREFIX: &str = "/v1";

pub struct Simulator {
    pub config: SimulatorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    http_metrics: HttpMetrics,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a simulator whose cooldowns follow `clock`.
    pub fn with_clock(config: SimulatorConfig, clock: Arc<dyn Clock>) -> Self {
        let state = State::new(&config);
        Self {
            config,
            clock,
            state: Mutex::new(state),
            http_metrics: HttpMetrics::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_token(&self, token: &str) {
        self.state().add_token(token);
    }

    /// Makes the server answer `401` for `token` from now on.
    pub fn revoke_token(&self, token: &str) {
        info!(token, "revoking token");
        self.state().revoke_token(token);
    }

    /// Makes the next `count` API requests fail with `503`.
    pub fn fail_next(&self, count: usize) {
        self.state().fail_next(count);
    }

    /// Delays every API response by `latency` from now on.
    pub fn set_latency(&self, latency: std::time::Duration) {
        self.state().set_latency(latency);
    }

    pub(crate) fn latency(&self) -> std::time::Duration {
        self.state().latency()
    }

    pub(crate) fn take_failure(&self) -> bool {
        self.state().take_failure()
    }

    pub fn transaction(&self, auth: Option<&str>, class: &str, distinguisher: &str) -> TransactionOutcome {
        let now = self.clock.now();
        self.state()
            .transaction(auth, class, distinguisher, now, self.config.cooldown)
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state())
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state().requests().to_vec()
    }

    pub fn clear_requests(&self) {
        self.state().clear_requests();
    }

    /// Number of rewards granted so far.
    pub fn transactions(&self) -> u64 {
        self.state().transactions()
    }

    pub fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }
}

/// Serves the simulator on `addr` (port 0 picks a free port).
///
/// Returns the bound address and the server task.
pub async fn serve(
    simulator: Arc<Simulator>,
    addr: SocketAddr,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let app = Api::new(simulator).router();
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "simulator server stopped");
        }
    });
    info!(%addr, "simulator listening");
    Ok((addr, server))
}
