//! RTSP publish/subscribe relay.
//!
//! Encoders connect to the publisher port and ANNOUNCE a mount, SETUP its
//! streams and RECORD. Players connect to the subscriber port, DESCRIBE,
//! SETUP (UDP or TCP-interleaved) and PLAY. Every RTP/RTCP datagram the
//! encoder sends is relayed unmodified to every player of that stream.
//!
//! ```no_run
//! use rtsp::{Hooks, Server, ServerConfig};
//!
//! let hooks = Hooks::new().with_mount_now_empty(|mount| {
//!     println!("{} has no viewers", mount.path());
//! });
//! let mut server = Server::with_hooks(ServerConfig::default(), hooks);
//! server.start()?;
//! // ...
//! server.stop();
//! # Ok::<(), rtsp::RtspError>(())
//! ```

pub mod error;
pub mod hooks;
pub mod mount;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{Result, RtspError};
pub use hooks::Hooks;
pub use mount::{Mount, MountRegistry, Stream};
pub use pool::PortPool;
pub use server::{Server, ServerConfig, Viewer};
