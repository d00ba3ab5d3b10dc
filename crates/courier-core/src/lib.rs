//! courier-core
//!
//! Asynchronous job queue for delivery notifications: request handlers
//! enqueue typed jobs, a worker pool drains them with bounded concurrency,
//! retry with backoff and lease-based crash recovery. Delivery is
//! at-least-once; handlers must tolerate running twice.
//!
//! # Modules
//! - **domain**: ids, job kinds, job records and their status machine, retry decisions, errors
//! - **ports**: traits at the seams (BrokerStore, MailDispatch, Clock, IdGenerator)
//! - **impls**: in-memory and Redis brokers, mailers without SMTP
//! - **app**: handler registry, producer, worker pool, reaper
//! - **handlers**: the notification jobs (`NewDelivery`, `CancellationMail`)
//! - **config**: `QueueConfig`, env-driven
//! - **observability**: per-status counts

pub mod app;
pub mod config;
pub mod domain;
pub mod handlers;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{Handler, HandlerRegistry, Job, Producer, RegistryBuilder, WorkerPool, WorkerPoolHandle};
pub use config::QueueConfig;
pub use domain::{JobId, JobKind, JobRecord, JobStatus, QueueError, QueueResult};
pub use observability::QueueCounts;
