//! Test harness for multi-runner failover integration tests.
//!
//! Runs several in-process runners against shared in-memory stores and a
//! shared in-memory broker, the way production runners share one database
//! and one consumer group, plus a loopback HTTP server standing in for the
//! delegate endpoints.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use drover::broker::MemoryBroker;
use drover::config::RunnerConfig;
use drover::dispatcher::Dispatcher;
use drover::monitor::HeartbeatMonitor;
use drover::store::{MemoryHeartbeatStore, MemoryUnitStore};
use drover::unit::RunnerId;
use drover::worker::{DelegateExecutor, UnitWorker};

pub const UNIT_TOPIC: &str = "units";

/// Runner tuning with short timings for fast tests. The multiplier keeps a
/// comfortable margin over the worst-case gap between two jittered touches
/// so a live runner never looks dead.
pub fn test_runner_config() -> RunnerConfig {
    RunnerConfig {
        heartbeat_interval_ms: 100,
        threshold_multiplier: 6,
        request_timeout_ms: 5_000,
        max_in_flight: 8,
    }
}

/// Shared state standing in for the production database and message log.
pub struct TestFleet {
    pub units: Arc<MemoryUnitStore>,
    pub heartbeats: Arc<MemoryHeartbeatStore>,
    pub broker: Arc<MemoryBroker>,
}

impl TestFleet {
    pub fn new() -> Self {
        Self {
            units: Arc::new(MemoryUnitStore::new()),
            heartbeats: Arc::new(MemoryHeartbeatStore::new()),
            broker: Arc::new(MemoryBroker::new(UNIT_TOPIC)),
        }
    }

    /// Start a runner with its own fresh identity: heartbeat registered,
    /// monitor and dispatcher loops spawned.
    pub async fn start_runner(&self, config: RunnerConfig) -> TestRunner {
        let id = RunnerId::generate();
        let executor =
            DelegateExecutor::new(config.request_timeout()).expect("build http client");
        let worker = UnitWorker::new(
            id,
            self.units.clone(),
            self.broker.clone(),
            executor,
            config.max_in_flight,
        );

        let monitor = HeartbeatMonitor::new(
            id,
            self.heartbeats.clone(),
            self.units.clone(),
            Arc::clone(&worker),
            config.heartbeat_interval(),
            config.expiry_threshold(),
        );
        monitor.register().await.expect("register heartbeat");

        let cancel = CancellationToken::new();
        let monitor_cancel = cancel.clone();
        let monitor_handle = tokio::spawn(async move {
            monitor.run(monitor_cancel).await;
        });

        let dispatcher = Dispatcher::new(id, self.broker.clone(), self.units.clone(), worker);
        let dispatcher_cancel = cancel.clone();
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run(dispatcher_cancel).await;
        });

        TestRunner {
            id,
            cancel,
            monitor_handle,
            dispatcher_handle,
        }
    }

    /// Append a well-formed unit message to the unit topic.
    pub async fn enqueue_unit(
        &self,
        id: &str,
        url: &str,
        tenant: &str,
        response_topic: Option<&str>,
    ) {
        let mut message = serde_json::json!({
            "url": url,
            "body": {"x": 1},
            "tenant": tenant,
        });
        if let Some(topic) = response_topic {
            message["response_topic"] = serde_json::Value::String(topic.to_string());
        }
        self.broker
            .enqueue(Some(id), &serde_json::to_vec(&message).unwrap())
            .await;
    }
}

/// Handle to a running test runner.
pub struct TestRunner {
    pub id: RunnerId,
    cancel: CancellationToken,
    monitor_handle: JoinHandle<()>,
    dispatcher_handle: JoinHandle<()>,
}

impl TestRunner {
    /// Kill both loops without any cleanup, simulating a process crash:
    /// the heartbeat row stays behind and goes stale.
    pub fn crash(&self) {
        self.monitor_handle.abort();
        self.dispatcher_handle.abort();
    }

    /// Graceful stop via the cancellation token.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        self.monitor_handle.abort();
        self.dispatcher_handle.abort();
    }
}

#[derive(Clone, Default)]
struct DelegateState {
    hits: Arc<AtomicUsize>,
    slow_in_flight: Arc<AtomicUsize>,
    slow_peak: Arc<AtomicUsize>,
}

/// Loopback server playing the business microservices behind unit urls.
pub struct DelegateServer {
    pub addr: SocketAddr,
    /// Total requests across every route.
    pub hits: Arc<AtomicUsize>,
    /// Highest number of `/slow` requests ever in flight at once.
    pub slow_peak: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl DelegateServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for DelegateServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn delegate_ok(
    State(state): State<DelegateState>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({"echo": body}))
}

async fn delegate_fail(State(state): State<DelegateState>) -> (StatusCode, &'static str) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (StatusCode::INTERNAL_SERVER_ERROR, "delegate exploded")
}

async fn delegate_slow(State(state): State<DelegateState>) -> Json<serde_json::Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let in_flight = state.slow_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.slow_peak.fetch_max(in_flight, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    state.slow_in_flight.fetch_sub(1, Ordering::SeqCst);
    Json(serde_json::json!({"slept": true}))
}

async fn delegate_text(State(state): State<DelegateState>) -> &'static str {
    state.hits.fetch_add(1, Ordering::SeqCst);
    "plain text reply"
}

/// Bind a delegate server on an ephemeral loopback port.
pub async fn start_delegate_server() -> DelegateServer {
    let state = DelegateState::default();
    let router = Router::new()
        .route("/ok", post(delegate_ok))
        .route("/fail", post(delegate_fail))
        .route("/slow", post(delegate_slow))
        .route("/text", post(delegate_text))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind delegate server");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    DelegateServer {
        addr,
        hits: state.hits,
        slow_peak: state.slow_peak,
        handle,
    }
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
