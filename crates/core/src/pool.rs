//! RTP/RTCP server port pool.
//!
//! Each entry is an even port `p` standing for the pair `(p, p + 1)`
//! (RTP on the even port, RTCP on the odd one, RFC 3550 §11). A value is
//! either sitting in the pool or held by exactly one stream or client
//! transport, never both.
//!
//! Allocation takes the head of the queue and release appends to the tail,
//! so a pair that just failed to bind is not handed straight back out.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};

/// Shared free-list of RTP port pairs.
///
/// Cheap to clone; every clone refers to the same underlying pool.
#[derive(Clone)]
pub struct PortPool {
    free: Arc<Mutex<VecDeque<u16>>>,
    start: u16,
    end: u32,
}

impl PortPool {
    /// Build a pool of pairs covering `[start, start + count)`.
    ///
    /// Only pairs whose RTCP port also falls inside the range are included.
    pub fn new(start: u16, count: u16) -> Self {
        let end = u32::from(start) + u32::from(count);
        let free: VecDeque<u16> = (u32::from(start)..end)
            .step_by(2)
            .filter(|p| p + 1 < end && p + 1 <= u32::from(u16::MAX))
            .map(|p| p as u16)
            .collect();

        tracing::debug!(start, count, pairs = free.len(), "port pool created");

        Self {
            free: Arc::new(Mutex::new(free)),
            start,
            end,
        }
    }

    /// Take the next free pair, returning its RTP (even) port.
    pub fn allocate(&self) -> Result<u16> {
        let mut free = self.free.lock();
        let port = free.pop_front().ok_or(RtspError::NoPortsAvailable)?;
        tracing::trace!(port, remaining = free.len(), "allocated port pair");
        Ok(port)
    }

    /// Return a pair to the pool.
    ///
    /// The caller must have closed both sockets of the pair. Ports outside
    /// the pool's range and pairs already free are ignored so the
    /// "free XOR held" invariant cannot be broken by a stray release.
    pub fn release(&self, port: u16) {
        if !self.owns(port) {
            tracing::warn!(port, "release of port outside the pool range ignored");
            return;
        }

        let mut free = self.free.lock();
        if free.contains(&port) {
            tracing::warn!(port, "double release of port pair ignored");
            return;
        }
        free.push_back(port);
        tracing::trace!(port, remaining = free.len(), "released port pair");
    }

    /// Number of free pairs.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Whether `port` is currently free.
    pub fn is_free(&self, port: u16) -> bool {
        self.free.lock().contains(&port)
    }

    fn owns(&self, port: u16) -> bool {
        let p = u32::from(port);
        p >= u32::from(self.start) && p + 1 < self.end && (p - u32::from(self.start)) % 2 == 0
    }
}

impl std::fmt::Debug for PortPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortPool")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("available", &self.available())
            .finish()
    }
}
