use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::interleaved;
use crate::transport::tcp::ControlSender;

/// Delivery of relayed media as `$`-framed packets on the player's own
/// RTSP control connection (RFC 2326 §10.12). No ports are involved.
pub struct InterleavedDelivery {
    rtp_channel: u8,
    rtcp_channel: u8,
    control: Mutex<Option<ControlSender>>,
}

impl InterleavedDelivery {
    pub fn new(control: ControlSender, rtp_channel: u8, rtcp_channel: u8) -> Self {
        Self {
            rtp_channel,
            rtcp_channel,
            control: Mutex::new(Some(control)),
        }
    }

    pub fn channels(&self) -> (u8, u8) {
        (self.rtp_channel, self.rtcp_channel)
    }

    pub fn send_rtp(&self, buf: &[u8]) -> bool {
        self.send(self.rtp_channel, buf)
    }

    pub fn send_rtcp(&self, buf: &[u8]) -> bool {
        self.send(self.rtcp_channel, buf)
    }

    fn send(&self, channel: u8, buf: &[u8]) -> bool {
        let Some(control) = self.control.lock().clone() else {
            return false;
        };

        let frame = match interleaved::encode(channel, buf) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(channel, error = %e, "dropping packet");
                return false;
            }
        };

        match control.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!(channel, "control connection backlogged, dropping packet");
                false
            }
            Err(TrySendError::Closed(_)) => {
                // Connection is gone; stop framing for it.
                self.control.lock().take();
                false
            }
        }
    }

    /// Whether frames go out on the connection behind `control`.
    pub fn uses_connection(&self, control: &ControlSender) -> bool {
        self.control
            .lock()
            .as_ref()
            .is_some_and(|own| own.same_channel(control))
    }

    pub fn close(&self) {
        self.control.lock().take();
    }
}
