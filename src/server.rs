//! Control server lifecycle.
//!
//! [`ControlServer`] owns the bind + serve pair. `start` runs the bind
//! cascade and spawns the accept loop; `stop` cancels it and waits, with a
//! bounded timeout, for every connection task to finish. Start and stop are
//! serialized: a second transition while one is in flight is rejected rather
//! than queued.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::Router;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bind::{self, ReachabilityScope};
use crate::monitor::Supervised;

/// Bounded wait for in-flight connections during `stop`.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const SHUTDOWN_RETRY: Duration = Duration::from_millis(20);

/// After this many back-to-back accept failures the listener is treated as
/// closed and the server marks itself down for the health monitor.
const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("a start or stop is already in progress")]
    TransitionInProgress,
    #[error("server is already running on {0}")]
    AlreadyRunning(SocketAddr),
    #[error(transparent)]
    Bind(#[from] bind::BindError),
}

#[derive(Debug, Default)]
struct State {
    running: bool,
    addr: Option<SocketAddr>,
    scope: Option<ReachabilityScope>,
    lan_addrs: Vec<Ipv4Addr>,
    last_error: Option<String>,
}

/// Snapshot reported by the status route.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub running: bool,
    pub port: u16,
    pub scope: Option<ReachabilityScope>,
    pub last_error: Option<String>,
    pub urls: Vec<String>,
}

/// Shared view of the server state. Cloned into request handlers so they can
/// report status without holding the server itself.
#[derive(Clone, Debug)]
pub struct StatusHandle {
    port: u16,
    state: Arc<Mutex<State>>,
}

impl StatusHandle {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock();
        state.running.then_some(state.addr).flatten()
    }

    pub fn snapshot(&self) -> ServerStatus {
        let state = self.state.lock();
        let port = state.addr.map_or(self.port, |a| a.port());
        let urls = if state.running {
            state
                .addr
                .map(|a| base_urls(a, state.scope, &state.lan_addrs))
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        ServerStatus {
            running: state.running,
            port,
            scope: state.scope,
            last_error: state.last_error.clone(),
            urls,
        }
    }

    /// Record a terminal failure reported by the supervisor.
    pub fn set_last_error(&self, message: impl Into<String>) {
        self.state.lock().last_error = Some(message.into());
    }

    fn mark_up(&self, addr: SocketAddr, scope: ReachabilityScope, lan_addrs: Vec<Ipv4Addr>) {
        let mut state = self.state.lock();
        state.running = true;
        state.addr = Some(addr);
        state.scope = Some(scope);
        state.lan_addrs = lan_addrs;
        state.last_error = None;
    }

    fn mark_down(&self, error: Option<String>) {
        let mut state = self.state.lock();
        state.running = false;
        if error.is_some() {
            state.last_error = error;
        }
    }
}

fn base_urls(addr: SocketAddr, scope: Option<ReachabilityScope>, lan: &[Ipv4Addr]) -> Vec<String> {
    let port = addr.port();
    match scope {
        Some(ReachabilityScope::All) => std::iter::once(Ipv4Addr::LOCALHOST)
            .chain(lan.iter().copied())
            .map(|ip| format!("http://{ip}:{port}/"))
            .collect(),
        _ => vec![format!("http://{addr}/")],
    }
}

struct Serving {
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

pub struct ControlServer {
    port: u16,
    router: Router,
    status: StatusHandle,
    serving: tokio::sync::Mutex<Option<Serving>>,
    in_flight: AtomicBool,
    desired: AtomicBool,
    stop_timeout: Duration,
}

impl ControlServer {
    pub fn new(router: Router, status: StatusHandle) -> Self {
        Self {
            port: status.port,
            router,
            status,
            serving: tokio::sync::Mutex::new(None),
            in_flight: AtomicBool::new(false),
            desired: AtomicBool::new(false),
            stop_timeout: STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    /// Bind and start serving. Marks the server as wanted, so the health
    /// monitor keeps it alive until an explicit [`ControlServer::shutdown`].
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let _guard = TransitionGuard::acquire(&self.in_flight)?;
        self.desired.store(true, Ordering::SeqCst);
        self.start_serving().await
    }

    /// Supervisor restart. Leaves the wanted flag alone and does nothing
    /// once the operator has shut the server down.
    async fn restart_serving(&self) -> Result<Option<SocketAddr>, ServerError> {
        let _guard = TransitionGuard::acquire(&self.in_flight)?;
        if !self.desired.load(Ordering::SeqCst) {
            tracing::debug!("restart skipped, server was shut down");
            return Ok(None);
        }
        self.start_serving().await.map(Some)
    }

    async fn start_serving(&self) -> Result<SocketAddr, ServerError> {
        let mut serving = self.serving.lock().await;
        if let Some(existing) = serving.as_ref() {
            if !existing.accept_task.is_finished() {
                if let Some(addr) = self.status.local_addr() {
                    return Err(ServerError::AlreadyRunning(addr));
                }
            }
            // The previous accept loop died on its own; reap it first.
            if let Some(dead) = serving.take() {
                self.drain(dead).await;
            }
        }

        let locals = bind::local_ipv4_addrs().await;
        let strategies = bind::strategies(self.port, &locals);
        let bound = match bind::bind_with(strategies, self.port).await {
            Ok(bound) => bound,
            Err(e) => {
                tracing::error!(port = self.port, "{}", e.diagnostic());
                self.status.mark_down(Some(e.diagnostic()));
                return Err(e.into());
            }
        };
        if bound.scope != ReachabilityScope::All {
            tracing::warn!(
                scope = %bound.scope,
                "server reachable with reduced scope\n{}",
                bind::remediation_hints(self.port)
            );
        }

        let addr = bound.addr;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            bound.listener,
            self.router.clone(),
            self.status.clone(),
            cancel.clone(),
            tracker.clone(),
        ));
        self.status.mark_up(addr, bound.scope, locals);
        *serving = Some(Serving {
            cancel,
            tracker,
            accept_task,
        });
        tracing::info!(%addr, scope = %bound.scope, "control server started");
        Ok(addr)
    }

    /// Stop serving without changing whether the server is wanted. Used by
    /// the health monitor between restart attempts.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let _guard = TransitionGuard::acquire(&self.in_flight)?;
        let serving = self.serving.lock().await.take();
        if let Some(serving) = serving {
            self.drain(serving).await;
            tracing::info!("control server stopped");
        }
        self.status.mark_down(None);
        Ok(())
    }

    /// Explicit operator stop: the health monitor will not restart it.
    ///
    /// A transition already in flight (usually a monitor restart) is waited
    /// out, then the server is stopped.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        self.desired.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.stop_timeout * 2;
        loop {
            match self.stop().await {
                Err(ServerError::TransitionInProgress)
                    if tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(SHUTDOWN_RETRY).await;
                }
                result => return result,
            }
        }
    }

    async fn drain(&self, serving: Serving) {
        serving.cancel.cancel();
        serving.tracker.close();
        let Serving {
            tracker,
            accept_task,
            ..
        } = serving;
        let wait = async move {
            if let Err(e) = accept_task.await {
                tracing::warn!(error = %e, "accept loop ended abnormally");
            }
            tracker.wait().await;
        };
        if tokio::time::timeout(self.stop_timeout, wait).await.is_err() {
            tracing::warn!(
                timeout = ?self.stop_timeout,
                "connections still open after stop timeout, continuing"
            );
        }
    }
}

impl Supervised for ControlServer {
    fn is_running(&self) -> bool {
        self.status.is_running()
    }

    fn should_be_running(&self) -> bool {
        self.desired.load(Ordering::SeqCst)
    }

    async fn start(&self) -> Result<(), String> {
        self.restart_serving()
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn stop(&self) -> Result<(), String> {
        ControlServer::stop(self).await.map_err(|e| e.to_string())
    }

    fn on_terminal_failure(&self, message: &str) {
        self.status.set_last_error(message);
    }
}

/// Single in-flight flag for start/stop. Released on drop.
struct TransitionGuard<'a>(&'a AtomicBool);

impl<'a> TransitionGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ServerError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self(flag))
            .map_err(|_| ServerError::TransitionInProgress)
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Router,
    status: StatusHandle,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let mut consecutive_errors = 0u32;
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("accept loop received cancel signal");
                break;
            }
            result = listener.accept() => match result {
                Ok(conn) => {
                    consecutive_errors = 0;
                    conn
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                        tracing::error!(error = %e, "listener keeps failing, marking server down");
                        status.mark_down(Some(format!("listener failed: {e}")));
                        break;
                    }
                    tracing::warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            }
        };
        tracker.spawn(serve_connection(stream, peer, router.clone(), cancel.clone()));
    }
    // Dropping the listener here closes the socket before stop() returns.
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    cancel: CancellationToken,
) {
    let service = tower::ServiceBuilder::new()
        .map_request(move |mut req: axum::http::Request<hyper::body::Incoming>| {
            req.extensions_mut().insert(ConnectInfo(peer));
            req
        })
        .service(router);
    let service = hyper_util::service::TowerToHyperService::new(service);
    let builder =
        hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
    let conn = builder.serve_connection(hyper_util::rt::TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "connection ended with error");
    }
}
