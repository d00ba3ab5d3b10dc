//! Job kinds shipped with the crate and their handlers.

pub mod notifications;

pub use self::notifications::{
    CancellationMail, CancellationMailHandler, Deliveryman, NewDelivery, NewDeliveryHandler,
    Recipient,
};

use std::sync::Arc;

use crate::app::registry::RegistryBuilder;
use crate::domain::QueueResult;
use crate::ports::MailDispatch;

/// Register every notification handler over `mailer`.
pub fn register_notifications(
    builder: RegistryBuilder,
    mailer: Arc<dyn MailDispatch>,
) -> QueueResult<RegistryBuilder> {
    builder
        .register::<NewDelivery, _>(NewDeliveryHandler::new(mailer.clone()))?
        .register::<CancellationMail, _>(CancellationMailHandler::new(mailer))
}
