//! Synchronous domain lifecycle shared by every distribution component.
//!
//! A domain is initialized once, ticked any number of times from a single
//! thread, and cleaned up once. Domains nest: each owns a [`Subdomains`]
//! registry whose children run either before or after the owner's own logic.

use std::fmt;

use crate::{Result, StateSyncError};

/// Identity of the domain a child is being initialized or cleaned up under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainContext {
    pub name: String,
}

impl DomainContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Lifecycle contract driven by the owning application's tick loop.
pub trait Domain: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self, parent: Option<&DomainContext>) -> Result<()>;

    fn tick(&mut self) -> Result<()>;

    fn cleanup(&mut self, parent: Option<&DomainContext>) -> Result<()>;

    fn lifecycle_state(&self) -> LifecycleState;

    /// Undoes a successful `initialize` because the owner failed to finish its
    /// own. Implementations that can be initialized again release what they
    /// acquired and return to `Uninitialized`; the default falls back to
    /// `cleanup`.
    fn rollback(&mut self, parent: Option<&DomainContext>) {
        if let Err(err) = self.cleanup(parent) {
            tracing::warn!(domain = self.name(), error = %err, "rollback cleanup failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Initialized,
    CleanedUp,
}

/// Tracks the lifecycle of one domain and rejects out-of-order calls.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    domain: String,
    state: LifecycleState,
}

impl Lifecycle {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            state: LifecycleState::Uninitialized,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn context(&self) -> DomainContext {
        DomainContext::new(self.domain.clone())
    }

    /// Fails unless the domain has never been initialized.
    pub fn ensure_uninitialized(&self) -> Result<()> {
        self.expect(LifecycleState::Uninitialized)
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        self.expect(LifecycleState::Initialized)
    }

    /// Marks a successful initialization. Callers check
    /// [`Lifecycle::ensure_uninitialized`] first and only call this once every
    /// fallible step succeeded, so a failed initialize stays `Uninitialized`.
    pub fn mark_initialized(&mut self) {
        self.state = LifecycleState::Initialized;
    }

    /// Returns an initialized domain to `Uninitialized` after a rollback.
    /// Returns `false`, changing nothing, in any other state.
    pub fn reset(&mut self) -> bool {
        let initialized = self.state == LifecycleState::Initialized;
        if initialized {
            self.state = LifecycleState::Uninitialized;
        }
        initialized
    }

    /// Returns `Ok(false)` when the domain was already cleaned up, in which case
    /// the caller has nothing left to release.
    pub fn begin_cleanup(&mut self) -> Result<bool> {
        match self.state {
            LifecycleState::Initialized => {
                self.state = LifecycleState::CleanedUp;
                Ok(true)
            }
            LifecycleState::CleanedUp => Ok(false),
            LifecycleState::Uninitialized => Err(self.violation(LifecycleState::Initialized)),
        }
    }

    fn expect(&self, expected: LifecycleState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.violation(expected))
        }
    }

    fn violation(&self, expected: LifecycleState) -> StateSyncError {
        StateSyncError::Lifecycle {
            domain: self.domain.clone(),
            expected,
            actual: self.state,
        }
    }
}

/// Where a child runs relative to its owner's own tick logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdomainOrder {
    Before,
    After,
}

impl SubdomainOrder {
    fn matches(self, pre: bool) -> bool {
        matches!(
            (self, pre),
            (SubdomainOrder::Before, true) | (SubdomainOrder::After, false)
        )
    }
}

/// Ordered registry of child domains.
#[derive(Default)]
pub struct Subdomains {
    children: Vec<(SubdomainOrder, Box<dyn Domain>)>,
}

impl Subdomains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, order: SubdomainOrder, domain: Box<dyn Domain>) {
        self.children.push((order, domain));
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|(_, domain)| domain.name())
    }

    /// Initializes the children registered for the given side, in registration order.
    pub fn initialize(&mut self, pre: bool, parent: &DomainContext) -> Result<()> {
        for domain in self.side(pre) {
            domain.initialize(Some(parent))?;
        }
        Ok(())
    }

    /// Rolls back every initialized child, newest first. Used when the owner's
    /// initialize fails after some children already succeeded.
    pub fn rollback(&mut self, parent: &DomainContext) {
        for (_, domain) in self.children.iter_mut().rev() {
            if domain.lifecycle_state() == LifecycleState::Initialized {
                tracing::debug!(domain = domain.name(), "rolling back subdomain");
                domain.rollback(Some(parent));
            }
        }
    }

    pub fn tick(&mut self, pre: bool) -> Result<()> {
        for domain in self.side(pre) {
            domain.tick()?;
        }
        Ok(())
    }

    /// Cleans up every child on the given side. Failures do not stop the
    /// remaining children from releasing their resources; the first one is
    /// returned.
    pub fn cleanup(&mut self, pre: bool, parent: &DomainContext) -> Result<()> {
        let mut first_error = None;
        for domain in self.side(pre) {
            if let Err(err) = domain.cleanup(Some(parent)) {
                tracing::warn!(domain = domain.name(), error = %err, "subdomain cleanup failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn side(&mut self, pre: bool) -> impl Iterator<Item = &mut Box<dyn Domain>> {
        self.children
            .iter_mut()
            .filter(move |(order, _)| order.matches(pre))
            .map(|(_, domain)| domain)
    }
}

impl fmt::Debug for Subdomains {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    struct Recording {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        lifecycle: Lifecycle,
        fail_init: bool,
    }

    impl Recording {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                log: log.clone(),
                lifecycle: Lifecycle::new(name),
                fail_init: false,
            })
        }

        fn failing(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Box<Self> {
            let mut domain = Self::new(name, log);
            domain.fail_init = true;
            domain
        }

        fn record(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{what}:{}", self.name));
        }
    }

    impl Domain for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        fn initialize(&mut self, parent: Option<&DomainContext>) -> Result<()> {
            self.lifecycle.ensure_uninitialized()?;
            assert_eq!(parent.map(|p| p.name.as_str()), Some("root"));
            if self.fail_init {
                return Err(StateSyncError::msg("refused"));
            }
            self.record("init");
            self.lifecycle.mark_initialized();
            Ok(())
        }

        fn tick(&mut self) -> Result<()> {
            self.lifecycle.ensure_initialized()?;
            self.record("tick");
            Ok(())
        }

        fn cleanup(&mut self, _parent: Option<&DomainContext>) -> Result<()> {
            if self.lifecycle.begin_cleanup()? {
                self.record("cleanup");
            }
            Ok(())
        }

        fn lifecycle_state(&self) -> LifecycleState {
            self.lifecycle.state()
        }
    }

    #[test]
    fn runs_children_by_side_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = DomainContext::new("root");
        let mut children = Subdomains::new();
        children.push(SubdomainOrder::After, Recording::new("late", &log));
        children.push(SubdomainOrder::Before, Recording::new("a", &log));
        children.push(SubdomainOrder::Before, Recording::new("b", &log));

        children.initialize(true, &root).unwrap();
        children.initialize(false, &root).unwrap();
        children.tick(true).unwrap();
        children.tick(false).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["init:a", "init:b", "init:late", "tick:a", "tick:b", "tick:late"]
        );
    }

    #[test]
    fn rollback_releases_only_initialized_children() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let root = DomainContext::new("root");
        let mut children = Subdomains::new();
        children.push(SubdomainOrder::Before, Recording::new("a", &log));
        children.push(SubdomainOrder::Before, Recording::new("b", &log));
        children.push(SubdomainOrder::Before, Recording::failing("c", &log));
        children.push(SubdomainOrder::Before, Recording::new("d", &log));

        assert!(children.initialize(true, &root).is_err());
        children.rollback(&root);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["init:a", "init:b", "cleanup:b", "cleanup:a"]
        );
    }

    #[test]
    fn lifecycle_rejects_out_of_order_calls() {
        let mut lifecycle = Lifecycle::new("gauge");
        assert!(lifecycle.ensure_initialized().is_err());
        assert!(lifecycle.begin_cleanup().is_err());

        lifecycle.mark_initialized();
        assert!(lifecycle.ensure_uninitialized().is_err());
        assert!(lifecycle.reset());
        assert!(lifecycle.ensure_uninitialized().is_ok());
        assert!(!lifecycle.reset());

        lifecycle.mark_initialized();
        assert!(lifecycle.begin_cleanup().unwrap());
        assert!(!lifecycle.begin_cleanup().unwrap());

        let err = lifecycle.ensure_uninitialized().unwrap_err();
        assert!(matches!(
            err,
            StateSyncError::Lifecycle {
                actual: LifecycleState::CleanedUp,
                ..
            }
        ));
    }
}
