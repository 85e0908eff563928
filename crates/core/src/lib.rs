//! Core library for replicating simulation state between processes.
//!
//! A simulator owns a [`StateSendDomain`] that broadcasts a fixed-layout state
//! value every tick; one or more renderers own a [`StateReceiveDomain`] that
//! folds the newest valid update into their copy. Delivery is best-effort and
//! the latest update wins. [`StateDistributionDomain`] groups any number of
//! such channels under one initialize/tick/cleanup lifecycle.

pub mod codec;
pub mod config;
pub mod distribution;
pub mod domain;
pub mod error;
pub mod mailbox;
pub mod state;
pub mod timeline;
pub mod transport;

pub use codec::{DefaultState, PayloadReader, PayloadWriter, Pose, Quat, StatePayload, Vec3};
pub use config::{AppConfig, DistributionConfig, TransportKind};
pub use distribution::{ReceiveStats, StateDistributionDomain, StateReceiveDomain, StateSendDomain};
pub use domain::{Domain, DomainContext, LifecycleState, SubdomainOrder};
pub use error::{Result, StateSyncError};
pub use mailbox::{Delivery, Mailbox};
pub use state::{StateGuard, StateHandle};
pub use timeline::{PlaybackClock, TickClock};
pub use transport::{transport_for, Transport, STATE_TOPIC};
