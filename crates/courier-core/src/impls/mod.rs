pub mod mailer;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use mailer::{MemoryMailer, TracingMailer};
pub use memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis::RedisBroker;
