//! Ports: traits at the seams to external systems.
//!
//! - BrokerStore: the durable job store (in-memory or Redis)
//! - MailDispatch: the mail-delivery collaborator called by handlers
//! - Clock / IdGenerator: time and identity, swappable in tests

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod mailer;

pub use self::broker::BrokerStore;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::mailer::{MailDispatch, MailError, MailMessage};
