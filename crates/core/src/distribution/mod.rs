//! State distribution domains.
//!
//! [`StateSendDomain`] and [`StateReceiveDomain`] replicate one state type each;
//! [`StateDistributionDomain`] owns any number of them under one lifecycle so an
//! application can mix several channels (a pose, telemetry, ...).

use std::sync::Arc;

use crate::domain::{Domain, DomainContext, Lifecycle, LifecycleState, SubdomainOrder, Subdomains};
use crate::state::StateHandle;
use crate::transport::Transport;
use crate::{AppConfig, DistributionConfig, Result, StatePayload, StateSyncError};

mod receive;
mod send;

pub use receive::{ReceiveStats, StateReceiveDomain};
pub use send::StateSendDomain;

const NAME: &str = "state-distribution";

/// Factory and owner of typed send and receive domains.
pub struct StateDistributionDomain {
    lifecycle: Lifecycle,
    transport: Option<Arc<dyn Transport>>,
    sender_config: DistributionConfig,
    receiver_config: DistributionConfig,
    subdomains: Subdomains,
}

impl StateDistributionDomain {
    /// Children pick their transport from their own configuration.
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(NAME),
            transport: None,
            sender_config: DistributionConfig::sender_defaults(),
            receiver_config: DistributionConfig::receiver_defaults(),
            subdomains: Subdomains::new(),
        }
    }

    /// Every child uses `transport`, whatever its configuration names.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            ..Self::new()
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new().with_configs(config.sender.clone(), config.receiver.clone())
    }

    /// Sets the configuration inherited by children added afterwards.
    pub fn with_configs(mut self, sender: DistributionConfig, receiver: DistributionConfig) -> Self {
        self.sender_config = sender;
        self.receiver_config = receiver;
        self
    }

    /// Adds a sender for `T`, sharing `state` when given, and returns the handle
    /// the sender broadcasts from.
    pub fn add_state_sender<T>(&mut self, state: Option<StateHandle<T>>) -> Result<StateHandle<T>>
    where
        T: StatePayload + Default + Send + 'static,
    {
        let config = self.sender_config.clone();
        self.add_state_sender_with(config, state)
    }

    pub fn add_state_sender_with<T>(
        &mut self,
        config: DistributionConfig,
        state: Option<StateHandle<T>>,
    ) -> Result<StateHandle<T>>
    where
        T: StatePayload + Default + Send + 'static,
    {
        self.lifecycle.ensure_uninitialized()?;
        let mut domain = match &self.transport {
            Some(transport) => StateSendDomain::<T>::with_transport(transport.clone()),
            None => StateSendDomain::<T>::new(),
        };
        domain.configure_with(config)?;
        if let Some(state) = state {
            domain.set_state_pointer(state)?;
        }
        let handle = domain
            .state()
            .ok_or_else(|| StateSyncError::msg("new state sender has no state"))?;
        self.subdomains.push(SubdomainOrder::Before, Box::new(domain));
        Ok(handle)
    }

    /// Adds a receiver for `T`, sharing `state` when given, and returns the
    /// handle updates are written into.
    pub fn add_state_receiver<T>(&mut self, state: Option<StateHandle<T>>) -> Result<StateHandle<T>>
    where
        T: StatePayload + Default + Send + 'static,
    {
        let config = self.receiver_config.clone();
        self.add_state_receiver_with(config, state)
    }

    pub fn add_state_receiver_with<T>(
        &mut self,
        config: DistributionConfig,
        state: Option<StateHandle<T>>,
    ) -> Result<StateHandle<T>>
    where
        T: StatePayload + Default + Send + 'static,
    {
        self.lifecycle.ensure_uninitialized()?;
        let mut domain = match &self.transport {
            Some(transport) => StateReceiveDomain::<T>::with_transport(transport.clone()),
            None => StateReceiveDomain::<T>::new(),
        };
        domain.configure_with(config)?;
        if let Some(state) = state {
            domain.set_state_pointer(state);
        }
        let handle = domain
            .state()
            .ok_or_else(|| StateSyncError::msg("new state receiver has no state"))?;
        self.subdomains.push(SubdomainOrder::Before, Box::new(domain));
        Ok(handle)
    }

    /// Registered channels.
    pub fn len(&self) -> usize {
        self.subdomains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subdomains.is_empty()
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.subdomains.names()
    }
}

impl Default for StateDistributionDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain for StateDistributionDomain {
    fn name(&self) -> &str {
        NAME
    }

    fn initialize(&mut self, _parent: Option<&DomainContext>) -> Result<()> {
        self.lifecycle.ensure_uninitialized()?;
        let context = self.lifecycle.context();
        let started = self
            .subdomains
            .initialize(true, &context)
            .and_then(|()| self.subdomains.initialize(false, &context));
        if let Err(err) = started {
            tracing::warn!(error = %err, "channel failed to start, releasing the others");
            self.subdomains.rollback(&context);
            return Err(err);
        }
        self.lifecycle.mark_initialized();
        Ok(())
    }

    fn tick(&mut self) -> Result<()> {
        self.lifecycle.ensure_initialized()?;
        self.subdomains.tick(true)?;
        self.subdomains.tick(false)
    }

    fn cleanup(&mut self, _parent: Option<&DomainContext>) -> Result<()> {
        if !self.lifecycle.begin_cleanup()? {
            return Ok(());
        }
        let context = self.lifecycle.context();
        let before = self.subdomains.cleanup(true, &context);
        let after = self.subdomains.cleanup(false, &context);
        before.and(after)
    }

    fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn rollback(&mut self, _parent: Option<&DomainContext>) {
        if self.lifecycle.reset() {
            let context = self.lifecycle.context();
            self.subdomains.rollback(&context);
        }
    }
}
