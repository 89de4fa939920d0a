use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::error::{Result, RtspError};
use crate::hooks::Hooks;
use crate::mount::MountRegistry;
use crate::pool::PortPool;
use crate::protocol::{PublisherHandler, SubscriberHandler};
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, SessionManager};
use crate::transport::BindPolicy;
use crate::transport::tcp;

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address both RTSP listeners and every RTP/RTCP socket bind to.
    pub bind_host: IpAddr,
    /// RTSP port publishers connect to. `0` lets the OS pick.
    pub publisher_port: u16,
    /// RTSP port players connect to. `0` lets the OS pick.
    pub subscriber_port: u16,
    /// First port of the RTP range. Must be even.
    pub rtp_port_start: u16,
    /// Number of ports in the RTP range. Must be even and non-zero.
    pub rtp_port_count: u16,
    /// Idle time after which a subscriber session is closed.
    pub session_timeout: Duration,
    /// Port pairs tried per bind before giving up.
    pub bind_attempts: u32,
    /// Pause between a conflicting bind and the next attempt.
    pub bind_retry_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::from([0, 0, 0, 0]),
            publisher_port: 5554,
            subscriber_port: 6554,
            rtp_port_start: 10000,
            rtp_port_count: 10000,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            bind_attempts: 10,
            bind_retry_delay: Duration::from_millis(10),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.rtp_port_start % 2 != 0 {
            return Err(RtspError::Config(format!(
                "rtp_port_start must be even, got {}",
                self.rtp_port_start
            )));
        }
        if self.rtp_port_count == 0 || self.rtp_port_count % 2 != 0 {
            return Err(RtspError::Config(format!(
                "rtp_port_count must be even and non-zero, got {}",
                self.rtp_port_count
            )));
        }
        if u32::from(self.rtp_port_start) + u32::from(self.rtp_port_count) > 65_536 {
            return Err(RtspError::Config(format!(
                "RTP range {}+{} runs past port 65535",
                self.rtp_port_start, self.rtp_port_count
            )));
        }
        if self.session_timeout.is_zero() {
            return Err(RtspError::Config("session_timeout must be non-zero".into()));
        }
        if self.bind_attempts == 0 {
            return Err(RtspError::Config("bind_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn bind_policy(&self) -> BindPolicy {
        BindPolicy {
            host: self.bind_host,
            max_attempts: self.bind_attempts,
            retry_delay: self.bind_retry_delay,
        }
    }

    pub fn publisher_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.publisher_port)
    }

    pub fn subscriber_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.subscriber_port)
    }
}

/// Tables shared by every connection of both roles.
#[derive(Clone)]
pub struct RelayState {
    pub mounts: MountRegistry,
    pub sessions: SessionManager,
    pub pool: PortPool,
    pub hooks: Arc<Hooks>,
    pub bind_policy: BindPolicy,
}

impl RelayState {
    pub fn new(config: &ServerConfig, hooks: Hooks) -> Self {
        let hooks = Arc::new(hooks);
        let pool = PortPool::new(config.rtp_port_start, config.rtp_port_count);
        Self {
            mounts: MountRegistry::new(pool.clone(), hooks.clone()),
            sessions: SessionManager::new(hooks.clone(), config.session_timeout),
            pool,
            hooks,
            bind_policy: config.bind_policy(),
        }
    }

    /// Accept publishers and players until `shutdown` resolves, then close
    /// everything.
    pub async fn run_until<F>(&self, publisher: TcpListener, subscriber: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let state = self.clone();
        let publishers = tcp::accept_loop(publisher, "publisher", move |peer_addr, _| {
            PublisherHandler::new(state.clone(), peer_addr)
        });

        let state = self.clone();
        let subscribers = tcp::accept_loop(subscriber, "subscriber", move |peer_addr, control| {
            SubscriberHandler::new(state.clone(), peer_addr, control)
        });

        tokio::select! {
            _ = publishers => {}
            _ = subscribers => {}
            _ = shutdown => {}
        }

        self.shutdown().await;
    }

    /// Close every session and tear down every mount, returning all ports
    /// to the pool.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.len();
        let mounts = self.mounts.len();
        self.sessions.close_all().await;
        self.mounts.clear().await;
        tracing::info!(sessions, mounts, free_ports = self.pool.available(), "relay shut down");
    }
}

/// RTSP relay server: one publisher listener, one subscriber listener,
/// and the shared mount/session tables behind them.
///
/// [`start`](Self::start) runs everything on a dedicated thread with a
/// single-threaded tokio runtime; [`run_until`](Self::run_until) serves on
/// the caller's runtime instead.
pub struct Server {
    config: ServerConfig,
    state: RelayState,
    running: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
    publisher_addr: Option<SocketAddr>,
    subscriber_addr: Option<SocketAddr>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_hooks(config, Hooks::new())
    }

    pub fn with_hooks(config: ServerConfig, hooks: Hooks) -> Self {
        let state = RelayState::new(&config, hooks);
        Self {
            config,
            state,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: None,
            thread: None,
            publisher_addr: None,
            subscriber_addr: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(RtspError::AlreadyRunning);
        }
        self.config.validate()?;

        let publisher = std::net::TcpListener::bind(self.config.publisher_addr())?;
        let subscriber = std::net::TcpListener::bind(self.config.subscriber_addr())?;
        publisher.set_nonblocking(true)?;
        subscriber.set_nonblocking(true)?;
        self.publisher_addr = Some(publisher.local_addr()?);
        self.subscriber_addr = Some(subscriber.local_addr()?);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = self.state.clone();
        let running = self.running.clone();

        self.running.store(true, Ordering::SeqCst);
        self.log_listening();

        let spawned = thread::Builder::new()
            .name("rtsp-relay".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let listeners = TcpListener::from_std(publisher)
                        .and_then(|p| TcpListener::from_std(subscriber).map(|s| (p, s)));
                    match listeners {
                        Ok((publisher, subscriber)) => {
                            state
                                .run_until(publisher, subscriber, async {
                                    let _ = shutdown_rx.await;
                                })
                                .await;
                        }
                        Err(e) => tracing::error!(error = %e, "failed to register listeners"),
                    }
                });
                running.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.shutdown = Some(shutdown_tx);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Serve on the current tokio runtime until `shutdown` resolves.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.is_running() {
            return Err(RtspError::AlreadyRunning);
        }
        self.config.validate()?;

        let publisher = TcpListener::bind(self.config.publisher_addr()).await?;
        let subscriber = TcpListener::bind(self.config.subscriber_addr()).await?;
        self.publisher_addr = Some(publisher.local_addr()?);
        self.subscriber_addr = Some(subscriber.local_addr()?);

        self.running.store(true, Ordering::SeqCst);
        self.log_listening();
        self.state.run_until(publisher, subscriber, shutdown).await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop serving. Returns once every session is closed and every mount
    /// torn down.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        tracing::info!("server stopping");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if thread.join().is_err() {
            tracing::error!("server thread panicked");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound publisher address, once started.
    pub fn publisher_addr(&self) -> Option<SocketAddr> {
        self.publisher_addr
    }

    /// Bound subscriber address, once started.
    pub fn subscriber_addr(&self) -> Option<SocketAddr> {
        self.subscriber_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn mounts(&self) -> &MountRegistry {
        &self.state.mounts
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.state.sessions
    }

    pub fn port_pool(&self) -> &PortPool {
        &self.state.pool
    }

    /// Sessions currently playing.
    pub fn viewers(&self) -> Vec<Viewer> {
        self.state
            .sessions
            .get_playing_sessions()
            .iter()
            .map(|session| Viewer {
                session_id: session.id().to_string(),
                mount: session.mount().path().to_string(),
                transports: session.transports().iter().map(|t| t.to_string()).collect(),
            })
            .collect()
    }

    fn log_listening(&self) {
        if let (Some(publisher), Some(subscriber)) = (self.publisher_addr, self.subscriber_addr) {
            tracing::info!(
                %publisher,
                %subscriber,
                rtp_port_start = self.config.rtp_port_start,
                rtp_port_count = self.config.rtp_port_count,
                "RTSP relay listening"
            );
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Information about a playing subscriber session.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    /// Mount path, e.g. `/live`.
    pub mount: String,
    /// One description per transport, e.g.
    /// `udp /live/streamid=0 10002-10003 -> 192.0.2.7:5000`.
    pub transports: Vec<String>,
}
