//! Subscriber session management (RFC 2326 §3, §12.37).
//!
//! A [`ClientSession`] is created by the first SETUP of a player and groups
//! every [`ClientTransport`] it sets up on one mount. It tracks:
//!
//! - A unique session ID (hex string, returned in the `Session` header).
//! - The playback state: Ready -> Playing -> Closed.
//! - A keepalive timer; a session that hears nothing for the configured
//!   timeout closes itself and returns its ports to the pool.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP            -> Ready    (keepalive armed)
//! PLAY             -> Playing  (keepalive re-armed)
//! OPTIONS / RTCP   -> keepalive re-armed
//! TEARDOWN         -> Closed
//! keepalive expiry -> Closed
//! mount TEARDOWN   -> Closed   (once its last transport is gone)
//! ```

pub mod transport;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::hooks::Hooks;
use crate::mount::Mount;
use crate::transport::{ClientTransport, ControlSender, Delivery};
pub use transport::{TransportHeader, TransportRequest};

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

type SessionTable = RwLock<HashMap<String, Arc<ClientSession>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transports set up, nothing relayed yet.
    Ready,
    /// Transports are relay targets.
    Playing,
    /// Closed by TEARDOWN, timeout, or disconnect. Terminal.
    Closed,
}

#[derive(Default)]
struct Keepalive {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// One player's session on one mount.
pub struct ClientSession {
    id: String,
    mount: Arc<Mount>,
    timeout: Duration,
    transports: Mutex<Vec<Arc<ClientTransport>>>,
    state: RwLock<SessionState>,
    keepalive: Mutex<Keepalive>,
    table: Weak<SessionTable>,
    hooks: Arc<Hooks>,
    me: Weak<ClientSession>,
}

impl ClientSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"3F2A9C0B11D4E870;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout.as_secs())
    }

    /// Record a transport set up under this session.
    ///
    /// For UDP delivery, any datagram the player sends to the RTCP port
    /// counts as a keepalive.
    pub fn add_transport(&self, transport: Arc<ClientTransport>) {
        transport.set_owner(self.me.clone());
        if let Delivery::Udp(udp) = transport.delivery() {
            let me = self.me.clone();
            udp.watch_rtcp(move || {
                if let Some(session) = me.upgrade() {
                    session.keepalive();
                }
            });
        }

        tracing::debug!(session_id = %self.id, transport = %transport, "transport added");
        self.transports.lock().push(transport);
    }

    pub fn transports(&self) -> Vec<Arc<ClientTransport>> {
        self.transports.lock().clone()
    }

    /// Make every transport a relay target and re-arm the keepalive.
    pub fn play(&self) {
        {
            let mut state = self.state.write();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Playing;
        }

        for transport in self.transports() {
            transport.play();
        }
        self.keepalive();
        tracing::info!(session_id = %self.id, mount = %self.mount.path(), "session playing");
    }

    /// (Re)arm the keepalive timer. Expiry closes the session.
    pub fn keepalive(&self) {
        if self.is_closed() {
            return;
        }

        let me = self.me.clone();
        let timeout = self.timeout;
        let mut keepalive = self.keepalive.lock();
        keepalive.generation += 1;
        let generation = keepalive.generation;

        if let Some(previous) = keepalive.timer.take() {
            previous.abort();
        }
        keepalive.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = me.upgrade() {
                session.expire(generation).await;
            }
        }));
        tracing::trace!(session_id = %self.id, generation, "keepalive armed");
    }

    async fn expire(&self, generation: u64) {
        {
            let mut keepalive = self.keepalive.lock();
            if keepalive.generation != generation {
                return;
            }
            // This runs inside the timer task; detach rather than abort it.
            keepalive.timer = None;
        }

        tracing::info!(session_id = %self.id, timeout_secs = self.timeout.as_secs(), "session timed out");
        self.close().await;
    }

    /// Close every transport and leave the session table.
    ///
    /// Fires the `client_close` hook. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        let timer = self.keepalive.lock().timer.take();
        if let Some(timer) = timer {
            timer.abort();
        }

        let transports = std::mem::take(&mut *self.transports.lock());
        for transport in transports {
            transport.close().await;
        }

        if let Some(table) = self.table.upgrade() {
            table.write().remove(&self.id);
        }

        tracing::info!(session_id = %self.id, mount = %self.mount.path(), "session closed");
        self.hooks.notify_client_close(&self.mount);
    }

    /// A transport was closed from outside (mount teardown). Closes the
    /// session once nothing is left.
    pub(crate) async fn transport_closed(&self, transport_id: u64) {
        let now_empty = {
            let mut transports = self.transports.lock();
            transports.retain(|t| t.id() != transport_id);
            transports.is_empty()
        };

        if now_empty {
            tracing::debug!(session_id = %self.id, "last transport closed");
            self.close().await;
        }
    }

    /// Whether any transport frames media onto the connection behind
    /// `control`.
    pub fn uses_connection(&self, control: &ControlSender) -> bool {
        self.transports
            .lock()
            .iter()
            .any(|t| t.uses_connection(control))
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("mount", &self.mount.path())
            .field("state", &self.state())
            .field("transports", &self.transports.lock().len())
            .finish()
    }
}

/// Thread-safe registry of active subscriber sessions, keyed by the
/// `Session` header value.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<SessionTable>,
    hooks: Arc<Hooks>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(hooks: Arc<Hooks>, timeout: Duration) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            hooks,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create and register a session on `mount`, with its keepalive armed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create_session(&self, mount: Arc<Mount>) -> Arc<ClientSession> {
        let session = {
            let mut sessions = self.sessions.write();
            let id = loop {
                let candidate = format!("{:016X}", rand::random::<u64>());
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            };

            let session = Arc::new_cyclic(|me| ClientSession {
                id: id.clone(),
                mount,
                timeout: self.timeout,
                transports: Mutex::new(Vec::new()),
                state: RwLock::new(SessionState::Ready),
                keepalive: Mutex::new(Keepalive::default()),
                table: Arc::downgrade(&self.sessions),
                hooks: self.hooks.clone(),
                me: me.clone(),
            });
            sessions.insert(id, session.clone());
            session
        };

        session.keepalive();
        tracing::debug!(
            session_id = %session.id,
            mount = %session.mount.path(),
            total_sessions = self.len(),
            "session created"
        );
        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Returns all sessions currently in the [`SessionState::Playing`] state.
    pub fn get_playing_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    /// Sessions with an interleaved transport on the connection behind
    /// `control`.
    pub fn sessions_using(&self, control: &ControlSender) -> Vec<Arc<ClientSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.uses_connection(control))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close every session (server shutdown).
    pub async fn close_all(&self) {
        for session in self.all() {
            session.close().await;
        }
    }
}
