//! Pluggable datagram transports carrying fixed-size state payloads.
//!
//! A transport opens two kinds of endpoints: a fire-and-forget sender and a
//! listener that invokes a handler from its own I/O thread for every message
//! it receives. Which implementation is used is a configuration choice
//! ([`TransportKind`]), not a build-time one.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::{DistributionConfig, Result, TransportKind};

pub mod broadcast;
pub mod loopback;
pub mod osc;
mod udp;

pub use broadcast::BroadcastTransport;
pub use loopback::LoopbackTransport;
pub use osc::OscTransport;

/// Topic every state update is published under.
pub const STATE_TOPIC: &str = "/_state";

/// Callback invoked with `(topic, payload)` for each inbound message. Runs on
/// the transport's I/O thread.
pub type MessageHandler = Box<dyn FnMut(&str, &[u8]) + Send>;

pub trait DatagramSender: Send {
    /// Transmits one message. Delivery is never confirmed.
    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// An open listening endpoint. Dropping it stops delivery.
pub trait Listener: Send {
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stops delivering messages. Once this returns the handler is not called again.
    fn stop(&mut self);
}

pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Largest payload a single `send` can carry on `topic` when no datagram
    /// may exceed `max_packet_size` bytes.
    fn payload_capacity(&self, max_packet_size: u16, topic: &str) -> usize;

    fn open_sender(&self, config: &DistributionConfig) -> Result<Box<dyn DatagramSender>>;

    /// Binds to `config.address:config.port`. Failing to bind returns
    /// [`crate::StateSyncError::Bind`].
    fn open_listener(
        &self,
        config: &DistributionConfig,
        handler: MessageHandler,
    ) -> Result<Box<dyn Listener>>;
}

/// Returns the transport implementation selected by `kind`. Loopback resolves
/// to the process-wide bus so independently built domains can reach each other.
pub fn transport_for(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Osc => Arc::new(OscTransport),
        TransportKind::Broadcast => Arc::new(BroadcastTransport),
        TransportKind::Loopback => Arc::new(LoopbackTransport::shared()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_implementation_by_kind() {
        for kind in [
            TransportKind::Osc,
            TransportKind::Broadcast,
            TransportKind::Loopback,
        ] {
            assert_eq!(transport_for(kind).kind(), kind);
        }
    }
}
