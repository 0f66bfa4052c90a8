//! Reference-counted start/stop of the bridge
//!
//! Every caller that needs the bridge holds a [`BridgeHandle`]. The first
//! handle binds the listener and starts the accept loop, dropping the last
//! one stops it. The count is trusted as given: sessions still relaying
//! when the last handle goes away are not tracked and finish on their own.

use crate::config::{BridgeSettings, ProxyConfig};
use crate::error::SocksError;
use crate::server::BridgeServer;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// BridgeLifecycle owns the single bridge instance of one upstream
/// configuration. Clones share the same bridge
#[derive(Clone)]
pub struct BridgeLifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    config: ProxyConfig,
    settings: BridgeSettings,
    state: Mutex<BridgeState>,
    // Serialises starts so two first callers never both bind
    start_lock: tokio::sync::Mutex<()>,
    starts: AtomicU64,
    stops: AtomicU64,
}

#[derive(Default)]
struct BridgeState {
    in_flight: usize,
    running: Option<RunningBridge>,
    stopping: Option<JoinHandle<()>>,
}

struct RunningBridge {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// BridgeLifecycle implementation block
impl BridgeLifecycle {
    /// new is a constructor for the BridgeLifecycle type. Nothing is bound
    /// until the first `acquire`
    pub fn new(config: ProxyConfig, settings: BridgeSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                settings,
                state: Mutex::new(BridgeState::default()),
                start_lock: tokio::sync::Mutex::new(()),
                starts: AtomicU64::new(0),
                stops: AtomicU64::new(0),
            }),
        }
    }

    /// acquire registers one more user of the bridge, starting it when it
    /// is not running. A bind failure leaves the count untouched
    pub async fn acquire(&self) -> Result<BridgeHandle, SocksError> {
        let _start = self.inner.start_lock.lock().await;

        let stopping = {
            let mut state = self.inner.lock_state();
            if let Some(running) = &state.running {
                let local_addr = running.local_addr;
                state.in_flight += 1;
                debug!("proxy bridge in use by {} callers", state.in_flight);
                return Ok(self.handle(local_addr));
            }
            state.stopping.take()
        };

        // The previous accept loop must have let go of the port
        if let Some(task) = stopping {
            await_accept_loop(task).await;
        }

        let mut server = BridgeServer::new(self.inner.config.clone(), self.inner.settings.clone());
        let local_addr = server.bind().await?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            if let Err(e) = server.run(shutdown_rx).await {
                error!("proxy bridge accept loop failed: {}", e);
            }
        });

        {
            let mut state = self.inner.lock_state();
            state.in_flight = 1;
            state.running = Some(RunningBridge {
                local_addr,
                shutdown,
                task,
            });
        }
        self.inner.starts.fetch_add(1, Ordering::SeqCst);

        info!("starting proxy bridge on {}", local_addr);
        Ok(self.handle(local_addr))
    }

    fn handle(&self, local_addr: SocketAddr) -> BridgeHandle {
        BridgeHandle {
            inner: Arc::clone(&self.inner),
            local_addr,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running.is_some()
    }

    /// in_flight is the number of live handles
    pub fn in_flight(&self) -> usize {
        self.inner.lock_state().in_flight
    }

    /// local_addr of the running bridge, if any
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lock_state()
            .running
            .as_ref()
            .map(|running| running.local_addr)
    }

    /// starts counts how many times the listener was bound
    pub fn starts(&self) -> u64 {
        self.inner.starts.load(Ordering::SeqCst)
    }

    /// stops counts how many times the accept loop was told to stop
    pub fn stops(&self) -> u64 {
        self.inner.stops.load(Ordering::SeqCst)
    }

    /// wait_stopped resolves once the most recently stopped accept loop
    /// has exited and its listener is closed
    pub async fn wait_stopped(&self) {
        let _start = self.inner.start_lock.lock().await;
        let stopping = self.inner.lock_state().stopping.take();
        if let Some(task) = stopping {
            await_accept_loop(task).await;
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, BridgeState> {
        // The guarded counters stay consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self) {
        let mut state = self.lock_state();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight > 0 {
            debug!("proxy bridge still in use by {} callers", state.in_flight);
            return;
        }

        if let Some(running) = state.running.take() {
            info!("stopping proxy bridge on {}", running.local_addr);
            // The loop may already be gone, in which case there is nothing to stop
            let _ = running.shutdown.send(());
            state.stopping = Some(running.task);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

async fn await_accept_loop(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!("proxy bridge accept loop panicked: {}", e);
    }
}

/// BridgeHandle keeps the bridge running for as long as it lives
pub struct BridgeHandle {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
}

impl BridgeHandle {
    /// local_addr the bridge was listening on when this handle was taken
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// release is an explicit drop
    pub fn release(self) {}
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    fn lifecycle() -> BridgeLifecycle {
        BridgeLifecycle::new(
            ProxyConfig::new("127.0.0.1", 1080, 0),
            BridgeSettings::default().with_io_timeout(Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn first_acquire_starts_and_last_release_stops() {
        let bridge = lifecycle();
        assert!(!bridge.is_running());

        let handles: Vec<_> = acquire_concurrently(&bridge, 5).await;
        assert!(bridge.is_running());
        assert_eq!(bridge.in_flight(), 5);
        assert_eq!(bridge.starts(), 1);

        let addr = bridge.local_addr().unwrap();
        assert!(handles.iter().all(|h| h.local_addr() == addr));

        let mut handles = handles.into_iter();
        for released in 1..5 {
            handles.next().unwrap().release();
            assert!(bridge.is_running(), "stopped after {released} of 5 releases");
            assert_eq!(bridge.stops(), 0);
        }

        drop(handles);
        assert!(!bridge.is_running());
        assert_eq!(bridge.in_flight(), 0);
        assert_eq!(bridge.stops(), 1);

        bridge.wait_stopped().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    async fn acquire_concurrently(bridge: &BridgeLifecycle, n: usize) -> Vec<BridgeHandle> {
        let tasks: Vec<_> = (0..n)
            .map(|_| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.acquire().await.unwrap() })
            })
            .collect();

        let mut handles = Vec::with_capacity(n);
        for task in tasks {
            handles.push(task.await.unwrap());
        }
        handles
    }

    #[tokio::test]
    async fn bridge_restarts_after_stop() {
        let bridge = lifecycle();

        let first = bridge.acquire().await.unwrap();
        drop(first);
        let second = bridge.acquire().await.unwrap();

        assert!(bridge.is_running());
        assert_eq!(bridge.starts(), 2);
        assert_eq!(bridge.stops(), 1);
        assert!(TcpStream::connect(second.local_addr()).await.is_ok());
    }

    #[tokio::test]
    async fn fixed_port_is_rebound_after_stop() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let bridge = BridgeLifecycle::new(
            ProxyConfig::new("127.0.0.1", 1080, port),
            BridgeSettings::default(),
        );

        for _ in 0..3 {
            let handle = bridge.acquire().await.unwrap();
            assert_eq!(handle.local_addr().port(), port);
        }
        assert_eq!(bridge.starts(), 3);
        assert_eq!(bridge.stops(), 3);
    }

    #[tokio::test]
    async fn bind_failure_leaves_count_unchanged() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let bridge = BridgeLifecycle::new(
            ProxyConfig::new("127.0.0.1", 1080, port),
            BridgeSettings::default(),
        );

        let err = bridge.acquire().await.unwrap_err();
        assert!(matches!(err, SocksError::BindFailed { .. }));
        assert_eq!(bridge.in_flight(), 0);
        assert_eq!(bridge.starts(), 0);
        assert!(!bridge.is_running());

        drop(taken);
        let handle = bridge.acquire().await.unwrap();
        assert_eq!(bridge.in_flight(), 1);
        drop(handle);
        assert_eq!(bridge.stops(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_releases_stop_exactly_once() {
        let bridge = lifecycle();
        let handles = acquire_concurrently(&bridge, 16).await;
        assert_eq!(bridge.in_flight(), 16);

        let barrier = Arc::new(tokio::sync::Barrier::new(handles.len()));
        let releases: Vec<_> = handles
            .into_iter()
            .map(|handle| {
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    handle.release();
                })
            })
            .collect();
        for release in releases {
            release.await.unwrap();
        }

        assert_eq!(bridge.stops(), 1);
        assert_eq!(bridge.starts(), 1);
        assert_eq!(bridge.in_flight(), 0);
        assert!(!bridge.is_running());
    }
}
