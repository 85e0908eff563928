use std::any::type_name;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::domain::{Domain, DomainContext, Lifecycle, LifecycleState, SubdomainOrder, Subdomains};
use crate::mailbox::Mailbox;
use crate::state::{StateGuard, StateHandle};
use crate::transport::{transport_for, Listener, MessageHandler, Transport, STATE_TOPIC};
use crate::{DistributionConfig, Result, StatePayload, StateSyncError};

/// Counters describing what a receive domain has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    /// State messages handed over by the transport.
    pub datagrams: u64,
    /// Updates copied into the shared state.
    pub adopted: u64,
    /// Updates replaced by a newer arrival before a tick consumed them.
    pub overwritten: u64,
    /// Updates discarded because their size did not match the state type.
    pub rejected: u64,
}

/// Listens for state broadcasts and exposes the latest valid one.
///
/// The transport's I/O thread only ever touches the pending-update slot. Each
/// [`tick`](Domain::tick) moves the newest pending payload out of that slot,
/// validates and decodes it, and stores it into the shared state under the
/// state's own lock.
pub struct StateReceiveDomain<T> {
    name: String,
    lifecycle: Lifecycle,
    config: DistributionConfig,
    transport: Option<Arc<dyn Transport>>,
    state: Option<StateHandle<T>>,
    pending: Arc<Mailbox<Vec<u8>>>,
    datagrams: Arc<AtomicU64>,
    stats: ReceiveStats,
    listener: Option<Box<dyn Listener>>,
    new_states: u32,
    subdomains: Subdomains,
}

impl<T> StateReceiveDomain<T>
where
    T: StatePayload + Default + Send + 'static,
{
    pub fn new() -> Self {
        let name = format!("state-receiver<{}>", short_type_name::<T>());
        Self {
            lifecycle: Lifecycle::new(name.clone()),
            name,
            config: DistributionConfig::receiver_defaults(),
            transport: None,
            state: Some(StateHandle::default()),
            pending: Arc::new(Mailbox::new()),
            datagrams: Arc::new(AtomicU64::new(0)),
            stats: ReceiveStats::default(),
            listener: None,
            new_states: 0,
            subdomains: Subdomains::new(),
        }
    }

    /// Uses `transport` instead of the one named by the configuration.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let mut domain = Self::new();
        domain.transport = Some(transport);
        domain
    }

    /// Sets the listening parameters. Only valid before initialization.
    pub fn configure(&mut self, port: u16, address: impl Into<String>, max_packet_size: u16) -> Result<()> {
        self.lifecycle.ensure_uninitialized()?;
        self.config.port = port;
        self.config.address = address.into();
        self.config.max_packet_size = max_packet_size;
        Ok(())
    }

    pub fn configure_with(&mut self, config: DistributionConfig) -> Result<()> {
        self.lifecycle.ensure_uninitialized()?;
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    /// Handle to the live state instance; `None` once cleaned up.
    pub fn state(&self) -> Option<StateHandle<T>> {
        self.state.clone()
    }

    /// Replaces the state instance with one supplied by the application, so
    /// both observe the same object.
    pub fn set_state_pointer(&mut self, state: StateHandle<T>) {
        self.state = Some(state);
    }

    /// Locks the state for a read that cannot interleave with an update.
    pub fn lock_state(&self) -> Result<StateGuard<'_, T>> {
        self.state
            .as_ref()
            .ok_or_else(|| StateSyncError::msg(format!("{} has released its state", self.name)))?
            .lock()
    }

    /// Updates adopted by the most recent tick: 1 if the state changed, else 0.
    pub fn new_states(&self) -> u32 {
        self.new_states
    }

    pub fn stats(&self) -> ReceiveStats {
        ReceiveStats {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            ..self.stats
        }
    }

    /// Address the listener is bound to, when the transport uses sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|listener| listener.local_addr())
    }

    pub fn add_subdomain(&mut self, order: SubdomainOrder, domain: Box<dyn Domain>) {
        self.subdomains.push(order, domain);
    }

    fn open_listener(&mut self) -> Result<()> {
        let transport = self
            .transport
            .clone()
            .unwrap_or_else(|| transport_for(self.config.transport));
        let pending = self.pending.clone();
        let datagrams = self.datagrams.clone();
        let handler: MessageHandler = Box::new(move |topic: &str, bytes: &[u8]| {
            if topic != STATE_TOPIC {
                return;
            }
            datagrams.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = pending.try_send(bytes.to_vec()) {
                debug!(error = %err, "could not stage state update");
            }
        });

        match transport.open_listener(&self.config, handler) {
            Ok(listener) => {
                info!(
                    domain = %self.name,
                    address = %self.config.address,
                    port = self.config.port,
                    "opened state listener"
                );
                self.listener = Some(listener);
                self.transport = Some(transport);
                Ok(())
            }
            Err(err) => {
                error!(domain = %self.name, error = %err, "error opening state listener");
                Err(err)
            }
        }
    }

    fn start(&mut self, context: &DomainContext) -> Result<()> {
        self.subdomains.initialize(true, context)?;
        if self.state.is_none() {
            self.state = Some(StateHandle::default());
        }
        self.open_listener()?;
        self.subdomains.initialize(false, context)
    }

    /// Undoes a partial or complete `start`. The state handle is kept so that a
    /// later initialize keeps publishing into the instance the application holds.
    fn release(&mut self, context: &DomainContext) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        self.subdomains.rollback(context);
        self.new_states = 0;
        if let Err(err) = self.pending.clear() {
            debug!(domain = %self.name, error = %err, "could not clear pending update");
        }
    }

    /// Moves the newest pending payload into the shared state. Returns the
    /// number of states adopted.
    fn adopt_pending(&mut self) -> Result<u32> {
        let Some(delivery) = self.pending.try_receive_latest()? else {
            return Ok(0);
        };
        if delivery.arrivals > 1 {
            let overwritten = delivery.arrivals - 1;
            self.stats.overwritten += u64::from(overwritten);
            debug!(domain = %self.name, overwritten, "newer state superseded unconsumed updates");
        }

        if delivery.value.len() != T::ENCODED_LEN {
            self.stats.rejected += 1;
            warn!(
                domain = %self.name,
                expected = T::ENCODED_LEN,
                actual = delivery.value.len(),
                discarded = delivery.arrivals,
                "received state size inconsistent, ignoring"
            );
            return Ok(0);
        }

        let value = match T::decode(&delivery.value) {
            Ok(value) => value,
            Err(err) => {
                self.stats.rejected += 1;
                warn!(domain = %self.name, error = %err, "could not decode state, ignoring");
                return Ok(0);
            }
        };

        let Some(state) = self.state.as_ref() else {
            return Ok(0);
        };
        *state.lock()? = value;
        self.stats.adopted += 1;
        Ok(1)
    }
}

impl<T> Default for StateReceiveDomain<T>
where
    T: StatePayload + Default + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Domain for StateReceiveDomain<T>
where
    T: StatePayload + Default + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, parent: Option<&DomainContext>) -> Result<()> {
        self.lifecycle.ensure_uninitialized()?;
        if parent.is_none() {
            return Err(StateSyncError::MissingParent(self.name.clone()));
        }
        let context = self.lifecycle.context();
        if let Err(err) = self.start(&context) {
            self.release(&context);
            return Err(err);
        }
        self.lifecycle.mark_initialized();
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        self.lifecycle.ensure_initialized()?;
        self.subdomains.tick(true)?;

        self.new_states = self.adopt_pending()?;
        if let Some(state) = &self.state {
            state.set_new_states(self.new_states);
        }

        self.subdomains.tick(false)
    }

    fn cleanup(&mut self, _parent: Option<&DomainContext>) -> Result<()> {
        if !self.lifecycle.begin_cleanup()? {
            return Ok(());
        }
        let context = self.lifecycle.context();
        let before = self.subdomains.cleanup(true, &context);

        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        self.transport = None;
        self.state = None;
        self.new_states = 0;
        self.pending.clear()?;

        let after = self.subdomains.cleanup(false, &context);
        before.and(after)
    }

    fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn rollback(&mut self, _parent: Option<&DomainContext>) {
        if self.lifecycle.reset() {
            let context = self.lifecycle.context();
            self.release(&context);
        }
    }
}

pub(crate) fn short_type_name<T>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
