//! In-process transport: listeners registered on a port receive every message
//! sent to that port, delivered synchronously on the sending thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tracing::{debug, trace};

use super::{DatagramSender, Listener, MessageHandler, Transport};
use crate::{DistributionConfig, Result, StateSyncError, TransportKind};

type SharedHandler = Arc<Mutex<MessageHandler>>;

#[derive(Default)]
struct Bus {
    next_id: u64,
    ports: HashMap<u16, Vec<(u64, SharedHandler)>>,
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    bus: Arc<Mutex<Bus>>,
}

impl LoopbackTransport {
    /// A private bus, isolated from every other `LoopbackTransport::new()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus.
    pub fn shared() -> Self {
        static SHARED: OnceLock<LoopbackTransport> = OnceLock::new();
        SHARED.get_or_init(LoopbackTransport::new).clone()
    }

    /// Number of listeners currently registered on `port`.
    pub fn listeners(&self, port: u16) -> usize {
        lock_bus(&self.bus)
            .map(|bus| bus.ports.get(&port).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

fn lock_bus(bus: &Mutex<Bus>) -> Result<MutexGuard<'_, Bus>> {
    bus.lock()
        .map_err(|_| StateSyncError::msg("loopback bus has been poisoned"))
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport").finish()
    }
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn payload_capacity(&self, max_packet_size: u16, _topic: &str) -> usize {
        max_packet_size as usize
    }

    fn open_sender(&self, config: &DistributionConfig) -> Result<Box<dyn DatagramSender>> {
        Ok(Box::new(LoopbackSender {
            bus: self.bus.clone(),
            port: config.port,
            max_packet_size: config.max_packet_size as usize,
        }))
    }

    fn open_listener(
        &self,
        config: &DistributionConfig,
        handler: MessageHandler,
    ) -> Result<Box<dyn Listener>> {
        let mut bus = lock_bus(&self.bus)?;
        let id = bus.next_id;
        bus.next_id += 1;
        bus.ports
            .entry(config.port)
            .or_default()
            .push((id, Arc::new(Mutex::new(handler))));
        debug!(port = config.port, id, "loopback listener registered");

        Ok(Box::new(LoopbackListener {
            bus: Arc::downgrade(&self.bus),
            port: config.port,
            id,
            active: true,
        }))
    }
}

struct LoopbackSender {
    bus: Arc<Mutex<Bus>>,
    port: u16,
    max_packet_size: usize,
}

impl DatagramSender for LoopbackSender {
    fn send(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_packet_size {
            return Err(StateSyncError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_packet_size,
            });
        }

        // Handlers run outside the bus lock so they may themselves send.
        let handlers: Vec<(u64, SharedHandler)> = lock_bus(&self.bus)?
            .ports
            .get(&self.port)
            .cloned()
            .unwrap_or_default();

        for (id, handler) in handlers {
            // A handler sending to its own port is not delivered its own message.
            if !Delivering::enter(id) {
                trace!(port = self.port, id, "skipping re-entrant loopback delivery");
                continue;
            }
            let _delivering = Delivering(id);
            let mut handler = handler
                .lock()
                .map_err(|_| StateSyncError::msg("loopback handler has been poisoned"))?;
            (*handler)(topic, payload);
        }
        Ok(())
    }
}

thread_local! {
    static DELIVERING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Marks a listener as running on the current thread until dropped.
struct Delivering(u64);

impl Delivering {
    fn enter(id: u64) -> bool {
        DELIVERING.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains(&id) {
                false
            } else {
                active.push(id);
                true
            }
        })
    }
}

impl Drop for Delivering {
    fn drop(&mut self) {
        DELIVERING.with(|active| active.borrow_mut().retain(|id| *id != self.0));
    }
}

struct LoopbackListener {
    bus: Weak<Mutex<Bus>>,
    port: u16,
    id: u64,
    active: bool,
}

impl Listener for LoopbackListener {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn stop(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let Ok(mut bus) = lock_bus(&bus) else {
            return;
        };
        if let Some(listeners) = bus.ports.get_mut(&self.port) {
            listeners.retain(|(id, _)| *id != self.id);
            if listeners.is_empty() {
                bus.ports.remove(&self.port);
            }
        }
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.stop();
    }
}
