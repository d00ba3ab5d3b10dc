//! Handler registry: job kind -> handler.
//!
//! Handlers are written against a concrete payload type ([`Handler<J>`]) and
//! stored type-erased ([`DynHandler`]), so one map can hold every kind. The
//! registry is immutable once built and shared behind an `Arc`.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{JobKind, QueueError, QueueResult};

/// A payload type bound to its job kind.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct NewDelivery { /* ... */ }
///
/// impl Job for NewDelivery {
///     const KIND: &'static str = "NewDelivery";
/// }
/// ```
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn kind() -> JobKind {
        JobKind::new(Self::KIND)
    }
}

/// Executes one job of type `J`.
///
/// Any `Err` counts as a failed attempt. Handlers must tolerate being run
/// more than once for the same payload.
#[async_trait]
pub trait Handler<J: Job>: Send + Sync {
    async fn handle(&self, job: J) -> QueueResult<()>;
}

/// Object-safe handler over a raw JSON payload.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: &serde_json::Value) -> QueueResult<()>;
    fn kind(&self) -> &str;
}

/// Adapts a `Handler<J>` to [`DynHandler`] by decoding the payload first.
pub struct TypedHandler<J: Job, H: Handler<J>> {
    handler: H,
    _marker: PhantomData<fn() -> J>,
}

impl<J: Job, H: Handler<J>> TypedHandler<J, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<J: Job, H: Handler<J>> DynHandler for TypedHandler<J, H> {
    async fn handle_dyn(&self, payload: &serde_json::Value) -> QueueResult<()> {
        let job: J = J::deserialize(payload).map_err(|e| QueueError::InvalidPayload {
            kind: J::kind(),
            reason: e.to_string(),
        })?;
        self.handler.handle(job).await
    }

    fn kind(&self) -> &str {
        J::KIND
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: Job, H: Handler<J> + 'static>(&mut self, handler: H) -> QueueResult<()> {
        self.register_dyn(Arc::new(TypedHandler::<J, H>::new(handler)))
    }

    /// Register an already type-erased handler under its own `kind()`.
    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> QueueResult<()> {
        let kind = JobKind::new(handler.kind());
        if self.handlers.contains_key(&kind) {
            return Err(QueueError::DuplicateKind(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn resolve(&self, kind: &JobKind) -> QueueResult<Arc<dyn DynHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| QueueError::UnknownKind(kind.clone()))
    }

    pub fn contains(&self, kind: &JobKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builds a [`HandlerRegistry`] and checks it at startup.
///
/// `build()` fails when a kind listed in `expect_kinds` has no handler, so a
/// misconfigured process refuses to start instead of failing jobs later.
#[derive(Default)]
pub struct RegistryBuilder {
    registry: HandlerRegistry,
    expected: Option<Vec<String>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<J: Job, H: Handler<J> + 'static>(mut self, handler: H) -> QueueResult<Self> {
        self.registry.register::<J, H>(handler)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn build(self) -> QueueResult<Arc<HandlerRegistry>> {
        if let Some(expected) = &self.expected {
            let missing: Vec<String> = expected
                .iter()
                .filter(|k| !self.registry.contains(&JobKind::new(k.as_str())))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(QueueError::MissingKinds(missing));
            }
        }
        Ok(Arc::new(self.registry))
    }
}
