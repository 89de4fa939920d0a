use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, RtspError};
use crate::hooks::Hooks;
use crate::pool::PortPool;
use crate::relay::RtpRelay;
use crate::transport::ClientTransport;
use crate::transport::udp::{BindPolicy, bind_pair};

/// Mount path and stream id addressed by an RTSP URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub path: String,
    pub stream_id: Option<u32>,
}

/// Split an RTSP URI into mount path and optional stream id.
///
/// `rtsp://host:5554/live/streamid=1` → (`/live`, `Some(1)`)
/// `rtsp://host:5554/live`            → (`/live`, `None`)
/// `rtsp://host:5554/a/b/`            → (`/a/b`, `None`)
/// `rtsp://host:5554`                 → (`/`, `None`)
pub fn parse_mount_uri(uri: &str) -> MountInfo {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else {
        uri
    };

    let path = path.split(['?', '#']).next().unwrap_or(path);

    let (path, stream_id) = match path.rfind("/streamid=") {
        Some(pos) => {
            let id = path[pos + "/streamid=".len()..]
                .trim_end_matches('/')
                .parse()
                .ok();
            (&path[..pos], id)
        }
        None => (path, None),
    };

    let trimmed = path.trim_end_matches('/');
    let path = if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };

    MountInfo { path, stream_id }
}

/// Port pair plus, once recording, the two listeners bound on it.
#[derive(Debug, Default)]
struct StreamPorts {
    port: Option<u16>,
    relays: Option<(RtpRelay, RtpRelay)>,
}

/// One media sub-stream of a [`Mount`], addressed by its `streamid`.
///
/// Holds a lookup table of the clients playing it. The table does not own
/// them: entries are weak, and removal is driven by the client's session.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    ports: Mutex<StreamPorts>,
    clients: RwLock<HashMap<u64, Weak<ClientTransport>>>,
}

impl Stream {
    fn new(id: u32, port: u16) -> Self {
        Self {
            id,
            ports: Mutex::new(StreamPorts {
                port: Some(port),
                relays: None,
            }),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Server-side (RTP, RTCP) ports the publisher sends to.
    pub fn ports(&self) -> Option<(u16, u16)> {
        self.ports.lock().port.map(|p| (p, p + 1))
    }

    /// Whether both listeners are bound.
    pub fn is_recording(&self) -> bool {
        self.ports.lock().relays.is_some()
    }

    /// Register a client for fan-out (called on PLAY).
    pub fn add_client(&self, client: &Arc<ClientTransport>) {
        self.clients
            .write()
            .insert(client.id(), Arc::downgrade(client));
        tracing::debug!(stream = self.id, client = client.id(), "client playing");
    }

    fn remove_client(&self, client_id: u64) -> bool {
        self.clients.write().remove(&client_id).is_some()
    }

    /// Snapshot of the clients currently playing.
    pub fn clients(&self) -> Vec<Arc<ClientTransport>> {
        self.clients
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }
}

/// A published stream path (e.g. `/live`), created by ANNOUNCE.
///
/// Owns an opaque SDP body and the [`Stream`]s set up by the publisher.
pub struct Mount {
    id: String,
    path: String,
    sdp: String,
    range: RwLock<Option<String>>,
    streams: RwLock<BTreeMap<u32, Arc<Stream>>>,
    /// Serializes RECORD binding against TEARDOWN.
    lifecycle: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    pool: PortPool,
    hooks: Arc<Hooks>,
}

impl Mount {
    pub fn new(path: &str, sdp: String, pool: PortPool, hooks: Arc<Hooks>) -> Self {
        Self {
            id: format!("{:016X}", rand::random::<u64>()),
            path: path.to_string(),
            sdp,
            range: RwLock::new(None),
            streams: RwLock::new(BTreeMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            pool,
            hooks,
        }
    }

    /// Publisher session id issued on ANNOUNCE.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn range(&self) -> Option<String> {
        self.range.read().clone()
    }

    pub fn set_range(&self, range: &str) {
        *self.range.write() = Some(range.to_string());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Create the stream for `stream_id`, allocating its port pair.
    ///
    /// A repeated SETUP for an existing id returns the existing stream.
    pub fn create_stream(&self, stream_id: u32) -> Result<Arc<Stream>> {
        let mut streams = self.streams.write();
        if let Some(existing) = streams.get(&stream_id) {
            return Ok(existing.clone());
        }

        let port = self.pool.allocate()?;
        let stream = Arc::new(Stream::new(stream_id, port));
        streams.insert(stream_id, stream.clone());

        tracing::debug!(mount = %self.path, stream_id, rtp_port = port, "stream created");
        Ok(stream)
    }

    pub fn stream(&self, stream_id: u32) -> Option<Arc<Stream>> {
        self.streams.read().get(&stream_id).cloned()
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams.read().values().cloned().collect()
    }

    /// Bind RTP/RTCP listeners for every stream that lacks them.
    ///
    /// A stream whose pair is in use is moved to a fresh pair from the pool;
    /// streams already bound are left alone. Any other bind error aborts.
    pub async fn start_recording(&self, policy: &BindPolicy) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_closed() {
            return Err(RtspError::MountNotFound(self.path.clone()));
        }

        for stream in self.streams() {
            let port = {
                let ports = stream.ports.lock();
                if ports.relays.is_some() {
                    continue;
                }
                ports.port
            };
            let port = match port {
                Some(port) => port,
                None => self.pool.allocate()?,
            };

            let pair = match bind_pair(&self.pool, port, policy).await {
                Ok(pair) => pair,
                Err(e) => {
                    stream.ports.lock().port = None;
                    tracing::error!(mount = %self.path, stream = stream.id, error = %e, "failed to bind stream listeners");
                    return Err(e);
                }
            };

            let weak = Arc::downgrade(&stream);
            let rtp = RtpRelay::spawn(pair.rtp, pair.port, weak.clone());
            let rtcp = RtpRelay::spawn(pair.rtcp, pair.port + 1, weak);

            let mut ports = stream.ports.lock();
            ports.port = Some(pair.port);
            ports.relays = Some((rtp, rtcp));
        }

        tracing::info!(mount = %self.path, streams = self.streams.read().len(), "recording");
        Ok(())
    }

    /// Close every listener and playing client, returning the freed ports.
    ///
    /// Client transports are closed here and reported to their sessions;
    /// the caller returns the stream ports to the pool.
    pub async fn teardown(&self) -> Vec<u16> {
        let _guard = self.lifecycle.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        let streams: Vec<Arc<Stream>> = std::mem::take(&mut *self.streams.write())
            .into_values()
            .collect();

        let mut freed = Vec::with_capacity(streams.len());
        for stream in streams {
            for client in stream.clients() {
                tracing::debug!(mount = %self.path, client = client.id(), "closing client on teardown");
                client.close().await;
                client.notify_owner_closed().await;
            }

            let (port, relays) = {
                let mut ports = stream.ports.lock();
                (ports.port.take(), ports.relays.take())
            };
            if let Some((rtp, rtcp)) = relays {
                rtp.close().await;
                rtcp.close().await;
            }
            if let Some(port) = port {
                freed.push(port);
            }
        }

        tracing::info!(mount = %self.path, freed = freed.len(), "mount torn down");
        freed
    }

    /// Remove a client from a stream's fan-out table.
    ///
    /// Fires the `mount_now_empty` hook when that leaves every stream with
    /// no clients.
    pub fn notify_client_left(&self, stream_id: u32, client_id: u64) {
        let removed = self
            .stream(stream_id)
            .is_some_and(|stream| stream.remove_client(client_id));
        if !removed {
            return;
        }

        tracing::debug!(mount = %self.path, stream_id, client = client_id, "client left");
        if self.is_empty() {
            tracing::debug!(mount = %self.path, "mount now empty");
            self.hooks.notify_mount_empty(self);
        }
    }

    /// No stream has a playing client.
    pub fn is_empty(&self) -> bool {
        self.streams
            .read()
            .values()
            .all(|stream| stream.client_count() == 0)
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("streams", &self.streams.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Registry of published mounts, keyed by path.
#[derive(Clone)]
pub struct MountRegistry {
    mounts: Arc<RwLock<HashMap<String, Arc<Mount>>>>,
    pool: PortPool,
    hooks: Arc<Hooks>,
}

impl MountRegistry {
    pub fn new(pool: PortPool, hooks: Arc<Hooks>) -> Self {
        Self {
            mounts: Arc::new(RwLock::new(HashMap::new())),
            pool,
            hooks,
        }
    }

    /// Register a new mount at `path`. Only one mount may exist per path.
    pub fn announce(&self, path: &str, sdp: String) -> Result<Arc<Mount>> {
        let mut mounts = self.mounts.write();
        if mounts.contains_key(path) {
            return Err(RtspError::MountAlreadyExists(path.to_string()));
        }

        let mount = Arc::new(Mount::new(
            path,
            sdp,
            self.pool.clone(),
            self.hooks.clone(),
        ));
        mounts.insert(path.to_string(), mount.clone());
        tracing::info!(path, mount_id = %mount.id(), "mount announced");
        Ok(mount)
    }

    /// Look up a mount by exact path.
    pub fn get(&self, path: &str) -> Option<Arc<Mount>> {
        self.mounts.read().get(path).cloned()
    }

    /// Resolve the mount addressed by an RTSP URI.
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Arc<Mount>> {
        self.get(&parse_mount_uri(uri).path)
    }

    /// Remove and tear down the mount at `path`, returning its ports to the
    /// pool. Returns `false` if nothing was mounted there.
    pub async fn remove(&self, path: &str) -> bool {
        let removed = self.mounts.write().remove(path);
        let Some(mount) = removed else {
            return false;
        };

        for port in mount.teardown().await {
            self.pool.release(port);
        }
        true
    }

    /// Tear down every mount.
    pub async fn clear(&self) {
        for path in self.paths() {
            self.remove(&path).await;
        }
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.mounts.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn registry(start: u16, count: u16) -> MountRegistry {
        MountRegistry::new(PortPool::new(start, count), Arc::new(Hooks::new()))
    }

    fn localhost() -> BindPolicy {
        BindPolicy {
            host: IpAddr::from([127, 0, 0, 1]),
            max_attempts: 5,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn parse_uri_with_stream_id() {
        assert_eq!(
            parse_mount_uri("rtsp://localhost:5554/live/streamid=1"),
            MountInfo {
                path: "/live".into(),
                stream_id: Some(1)
            }
        );
    }

    #[test]
    fn parse_uri_without_stream_id() {
        let info = parse_mount_uri("rtsp://10.0.0.1:6554/cams/front/");
        assert_eq!(info.path, "/cams/front");
        assert_eq!(info.stream_id, None);
    }

    #[test]
    fn parse_uri_no_path() {
        assert_eq!(parse_mount_uri("rtsp://localhost:5554").path, "/");
    }

    #[test]
    fn parse_bare_path() {
        let info = parse_mount_uri("/live/streamid=0");
        assert_eq!(info.path, "/live");
        assert_eq!(info.stream_id, Some(0));
    }

    #[test]
    fn second_announce_rejected() {
        let mounts = registry(40000, 10);
        mounts.announce("/live", "v=0\r\n".into()).unwrap();
        assert!(matches!(
            mounts.announce("/live", "v=0\r\n".into()),
            Err(RtspError::MountAlreadyExists(_))
        ));
        assert_eq!(mounts.len(), 1);
    }

    #[test]
    fn streams_get_consecutive_pairs() {
        let mounts = registry(10000, 10);
        let mount = mounts.announce("/live", String::new()).unwrap();

        let s0 = mount.create_stream(0).unwrap();
        let s1 = mount.create_stream(1).unwrap();
        assert_eq!(s0.ports(), Some((10000, 10001)));
        assert_eq!(s1.ports(), Some((10002, 10003)));

        let again = mount.create_stream(0).unwrap();
        assert_eq!(again.ports(), Some((10000, 10001)));
    }

    #[test]
    fn create_stream_on_exhausted_pool() {
        let mounts = registry(10000, 2);
        let mount = mounts.announce("/live", String::new()).unwrap();
        mount.create_stream(0).unwrap();
        assert!(matches!(
            mount.create_stream(1),
            Err(RtspError::NoPortsAvailable)
        ));
    }

    #[tokio::test]
    async fn record_rotates_busy_port_and_teardown_frees_all() {
        let pool = PortPool::new(41000, 8);
        let mounts = MountRegistry::new(pool.clone(), Arc::new(Hooks::new()));
        let mount = mounts.announce("/live", String::new()).unwrap();
        let stream = mount.create_stream(0).unwrap();
        assert_eq!(stream.ports(), Some((41000, 41001)));

        let squatter = std::net::UdpSocket::bind("127.0.0.1:41000").unwrap();
        mount.start_recording(&localhost()).await.unwrap();
        drop(squatter);

        assert!(stream.is_recording());
        assert_eq!(stream.ports(), Some((41002, 41003)));
        assert!(pool.is_free(41000));
        assert_eq!(pool.available(), 3);

        assert!(mounts.remove("/live").await);
        assert_eq!(pool.available(), 4);
        assert!(mounts.get("/live").is_none());
        assert!(!mounts.remove("/live").await);
    }

    #[tokio::test]
    async fn record_leaves_bound_streams_alone() {
        let mounts = registry(41100, 8);
        let mount = mounts.announce("/live", String::new()).unwrap();
        let s0 = mount.create_stream(0).unwrap();
        mount.start_recording(&localhost()).await.unwrap();

        let s1 = mount.create_stream(1).unwrap();
        mount.start_recording(&localhost()).await.unwrap();

        assert_eq!(s0.ports(), Some((41100, 41101)));
        assert_eq!(s1.ports(), Some((41102, 41103)));
        assert!(s1.is_recording());

        mounts.clear().await;
        assert!(mounts.is_empty());
    }

    #[test]
    fn last_client_leaving_fires_empty_hook() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let hooks = Hooks::new().with_mount_now_empty(move |mount| {
            assert_eq!(mount.path(), "/live");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mounts = MountRegistry::new(PortPool::new(41200, 8), Arc::new(hooks));
        let mount = mounts.announce("/live", String::new()).unwrap();
        let s0 = mount.create_stream(0).unwrap();
        let s1 = mount.create_stream(1).unwrap();

        let (a, _rx_a) = ClientTransport::test_interleaved(0, mount.clone(), s0.clone());
        let (b, _rx_b) = ClientTransport::test_interleaved(2, mount.clone(), s1.clone());
        s0.add_client(&a);
        s1.add_client(&b);

        mount.notify_client_left(0, a.id());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Unknown client: nothing removed, no hook.
        mount.notify_client_left(0, u64::MAX);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        mount.notify_client_left(1, b.id());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
