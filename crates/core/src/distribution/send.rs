use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error};

use super::receive::short_type_name;
use crate::domain::{Domain, DomainContext, Lifecycle, LifecycleState, SubdomainOrder, Subdomains};
use crate::state::StateHandle;
use crate::transport::{transport_for, DatagramSender, Transport, STATE_TOPIC};
use crate::{DistributionConfig, Result, StatePayload, StateSyncError};

/// Broadcasts the shared state once per tick.
///
/// Sending is fire-and-forget: transmission errors are logged and dropped, and
/// a sender that cannot be opened is retried on the following tick.
pub struct StateSendDomain<T> {
    name: String,
    lifecycle: Lifecycle,
    config: DistributionConfig,
    transport: Option<Arc<dyn Transport>>,
    state: Mutex<Option<StateHandle<T>>>,
    sender: Option<Box<dyn DatagramSender>>,
    sent: u64,
    subdomains: Subdomains,
}

impl<T> StateSendDomain<T>
where
    T: StatePayload + Default + Send + 'static,
{
    pub fn new() -> Self {
        let name = format!("state-sender<{}>", short_type_name::<T>());
        Self {
            lifecycle: Lifecycle::new(name.clone()),
            name,
            config: DistributionConfig::sender_defaults(),
            transport: None,
            state: Mutex::new(Some(StateHandle::default())),
            sender: None,
            sent: 0,
            subdomains: Subdomains::new(),
        }
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let mut domain = Self::new();
        domain.transport = Some(transport);
        domain
    }

    /// Sets the destination. Only valid before initialization.
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

    pub fn state(&self) -> Option<StateHandle<T>> {
        self.slot().ok().and_then(|slot| slot.clone())
    }

    /// Swaps in an application-owned state instance. Safe to call while
    /// another thread holds a reference to this domain.
    pub fn set_state_pointer(&self, state: StateHandle<T>) -> Result<()> {
        *self.slot()? = Some(state);
        Ok(())
    }

    /// Always 0; only receivers fold in remote updates.
    pub fn new_states(&self) -> u32 {
        0
    }

    /// Transmissions attempted so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn add_subdomain(&mut self, order: SubdomainOrder, domain: Box<dyn Domain>) {
        self.subdomains.push(order, domain);
    }

    fn slot(&self) -> Result<MutexGuard<'_, Option<StateHandle<T>>>> {
        self.state
            .lock()
            .map_err(|_| StateSyncError::msg("send state slot has been poisoned"))
    }

    fn resolve_transport(&mut self) -> Arc<dyn Transport> {
        self.transport
            .get_or_insert_with(|| transport_for(self.config.transport))
            .clone()
    }

    fn open_sender(&mut self) {
        let transport = self.resolve_transport();
        match transport.open_sender(&self.config) {
            Ok(sender) => self.sender = Some(sender),
            Err(err) => error!(
                domain = %self.name,
                address = %self.config.address,
                port = self.config.port,
                error = %err,
                "can't create state sender"
            ),
        }
    }

    fn start(&mut self, context: &DomainContext) -> Result<()> {
        self.subdomains.initialize(true, context)?;
        {
            let mut slot = self.slot()?;
            if slot.is_none() {
                *slot = Some(StateHandle::default());
            }
        }

        let transport = self.resolve_transport();
        let capacity = transport.payload_capacity(self.config.max_packet_size, STATE_TOPIC);
        if T::ENCODED_LEN > capacity {
            return Err(StateSyncError::PayloadTooLarge {
                size: T::ENCODED_LEN,
                max: capacity,
            });
        }
        self.open_sender();

        self.subdomains.initialize(false, context)
    }

    /// Undoes a partial or complete `start`, keeping the state handle.
    fn release(&mut self, context: &DomainContext) {
        self.sender = None;
        self.subdomains.rollback(context);
    }

    /// Encodes the current state. The state lock is held only for the copy.
    fn encode_current(&self) -> Result<Option<Vec<u8>>> {
        let slot = self.slot()?;
        match slot.as_ref() {
            Some(state) => Ok(Some(state.lock()?.encode())),
            None => Ok(None),
        }
    }

    fn transmit(&mut self, payload: &[u8]) {
        if self.sender.is_none() {
            self.open_sender();
        }
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        self.sent += 1;
        if let Err(err) = sender.send(STATE_TOPIC, payload) {
            debug!(domain = %self.name, error = %err, "state send failed");
        }
    }
}

impl<T> Default for StateSendDomain<T>
where
    T: StatePayload + Default + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Domain for StateSendDomain<T>
where
    T: StatePayload + Default + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, _parent: Option<&DomainContext>) -> Result<()> {
        self.lifecycle.ensure_uninitialized()?;
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

        if let Some(payload) = self.encode_current()? {
            self.transmit(&payload);
        }

        self.subdomains.tick(false)
    }

    fn cleanup(&mut self, _parent: Option<&DomainContext>) -> Result<()> {
        if !self.lifecycle.begin_cleanup()? {
            return Ok(());
        }
        let context = self.lifecycle.context();
        let before = self.subdomains.cleanup(true, &context);

        self.sender = None;
        self.transport = None;
        *self.slot()? = None;

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

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::transport::{LoopbackTransport, MessageHandler};
    use crate::{DefaultState, TransportKind, Vec3};

    const PORT: u16 = 4200;

    fn config() -> DistributionConfig {
        DistributionConfig::sender_defaults()
            .with_transport(TransportKind::Loopback)
            .with_port(PORT)
    }

    fn sender(transport: &LoopbackTransport) -> StateSendDomain<Vec3> {
        let mut domain = StateSendDomain::<Vec3>::with_transport(Arc::new(transport.clone()));
        domain.configure_with(config()).unwrap();
        domain.initialize(None).unwrap();
        domain
    }

    fn capture(transport: &LoopbackTransport) -> (Box<dyn crate::transport::Listener>, mpsc::Receiver<(String, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        let handler: MessageHandler = Box::new(move |topic: &str, bytes: &[u8]| {
            let _ = tx.send((topic.to_string(), bytes.to_vec()));
        });
        (transport.open_listener(&config(), handler).unwrap(), rx)
    }

    #[test]
    fn tick_sends_current_state_under_the_state_topic() {
        let transport = LoopbackTransport::new();
        let (_listener, rx) = capture(&transport);
        let mut domain = sender(&transport);

        domain
            .state()
            .unwrap()
            .replace(Vec3::new(1.0, 2.0, 3.0))
            .unwrap();
        domain.tick().unwrap();

        let (topic, bytes) = rx.try_recv().unwrap();
        assert_eq!(topic, STATE_TOPIC);
        assert_eq!(Vec3::decode(&bytes).unwrap(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(domain.sent(), 1);
        assert_eq!(domain.new_states(), 0);
    }

    #[test]
    fn injected_handle_is_what_gets_sent() {
        let transport = LoopbackTransport::new();
        let (_listener, rx) = capture(&transport);
        let mut domain = sender(&transport);
        let app_state = StateHandle::new(Vec3::new(7.0, 8.0, 9.0));

        domain.set_state_pointer(app_state.clone()).unwrap();
        domain.tick().unwrap();

        assert!(domain.state().unwrap().ptr_eq(&app_state));
        let (_, bytes) = rx.try_recv().unwrap();
        assert_eq!(Vec3::decode(&bytes).unwrap().z, 9.0);
    }

    #[test]
    fn oversize_state_fails_initialization() {
        let mut domain = StateSendDomain::<[f64; 32]>::with_transport(Arc::new(LoopbackTransport::new()));
        domain.configure(PORT, "127.0.0.1", 128).unwrap();

        let err = domain.initialize(None).unwrap_err();
        assert!(matches!(
            err,
            StateSyncError::PayloadTooLarge { size: 256, max: 128 }
        ));
        assert_eq!(domain.lifecycle_state(), LifecycleState::Uninitialized);
    }

    #[derive(Debug)]
    struct Unreachable;

    impl Transport for Unreachable {
        fn kind(&self) -> TransportKind {
            TransportKind::Broadcast
        }

        fn payload_capacity(&self, max_packet_size: u16, _topic: &str) -> usize {
            max_packet_size as usize
        }

        fn open_sender(&self, _config: &DistributionConfig) -> Result<Box<dyn DatagramSender>> {
            Err(StateSyncError::msg("network is unreachable"))
        }

        fn open_listener(
            &self,
            _config: &DistributionConfig,
            _handler: MessageHandler,
        ) -> Result<Box<dyn crate::transport::Listener>> {
            Err(StateSyncError::msg("network is unreachable"))
        }
    }

    #[test]
    fn unopenable_sender_is_not_fatal() {
        let mut domain = StateSendDomain::<DefaultState>::with_transport(Arc::new(Unreachable));

        domain.initialize(None).unwrap();
        domain.tick().unwrap();
        domain.tick().unwrap();
        assert_eq!(domain.sent(), 0);
    }

    #[test]
    fn cleanup_drops_the_state_handle() {
        let transport = LoopbackTransport::new();
        let mut domain = sender(&transport);
        let app_state = domain.state().unwrap();

        domain.cleanup(None).unwrap();

        assert!(domain.state().is_none());
        assert_eq!(app_state.holders(), 1);
        assert!(domain.tick().is_err());
    }
}
