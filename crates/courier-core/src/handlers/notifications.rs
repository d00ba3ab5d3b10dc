//! Delivery notifications: mail the deliveryman when an order is assigned
//! or cancelled.
//!
//! Payloads carry the entities as the request layer loaded them. Recipient
//! fields keep their stored (Portuguese) names on the wire.
//!
//! Redelivery can send the same mail twice. That is accepted: there is no
//! deduplication here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app::registry::{Handler, Job};
use crate::domain::QueueResult;
use crate::ports::{MailDispatch, MailMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deliveryman {
    pub name: String,
    pub email: String,
}

impl Deliveryman {
    /// `"Name <address>"`.
    pub fn mailbox(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

/// Only name and city reach a mail. The rest of the stored row (address,
/// ids, timestamps) rides along untyped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(rename = "nome")]
    pub name: String,

    #[serde(rename = "cidade")]
    pub city: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Recipient {
    pub fn new(name: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            city: city.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// A new order was assigned to `deliveryman`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDelivery {
    pub deliveryman: Deliveryman,
    pub recipient: Recipient,
    pub product: String,
}

impl Job for NewDelivery {
    const KIND: &'static str = "NewDelivery";
}

impl NewDelivery {
    pub const SUBJECT: &'static str = "Você tem uma nova encomenda!";
    pub const TEMPLATE: &'static str = "newDelivery";

    pub fn message(&self) -> MailMessage {
        MailMessage::new(self.deliveryman.mailbox(), Self::SUBJECT, Self::TEMPLATE)
            .with_context("deliverymanName", self.deliveryman.name.as_str())
            .with_context("recipientName", self.recipient.name.as_str())
            .with_context("city", self.recipient.city.as_str())
            .with_context("product", self.product.as_str())
    }

    /// Line stored in the deliveryman's notification log.
    pub fn notification_content(&self) -> String {
        format!(
            "Dear {}, you have a {} to delivery to {}",
            self.deliveryman.name, self.product, self.recipient.name
        )
    }
}

/// An order assigned to `deliveryman` was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationMail {
    pub deliveryman: Deliveryman,
    pub recipient: Recipient,
}

impl Job for CancellationMail {
    const KIND: &'static str = "CancellationMail";
}

impl CancellationMail {
    pub const SUBJECT: &'static str = "Encomenda cancelada";
    pub const TEMPLATE: &'static str = "cancellation";

    pub fn message(&self) -> MailMessage {
        MailMessage::new(self.deliveryman.mailbox(), Self::SUBJECT, Self::TEMPLATE)
            .with_context("deliverymanName", self.deliveryman.name.as_str())
            .with_context("recipientName", self.recipient.name.as_str())
            .with_context("city", self.recipient.city.as_str())
    }
}

pub struct NewDeliveryHandler {
    mailer: Arc<dyn MailDispatch>,
}

impl NewDeliveryHandler {
    pub fn new(mailer: Arc<dyn MailDispatch>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Handler<NewDelivery> for NewDeliveryHandler {
    async fn handle(&self, job: NewDelivery) -> QueueResult<()> {
        self.mailer.send(&job.message()).await?;
        Ok(())
    }
}

pub struct CancellationMailHandler {
    mailer: Arc<dyn MailDispatch>,
}

impl CancellationMailHandler {
    pub fn new(mailer: Arc<dyn MailDispatch>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Handler<CancellationMail> for CancellationMailHandler {
    async fn handle(&self, job: CancellationMail) -> QueueResult<()> {
        self.mailer.send(&job.message()).await?;
        Ok(())
    }
}
