use super::{Faultable, StepFault};
use crate::consumers::ReceivedMessage;
use crate::transport::{BrokerChannel, MessageProperties, TransportError};
use std::collections::BTreeMap;
use std::sync::Arc;
use task_local_extensions::Extensions;

/// A message to publish once processing is over.
#[derive(Debug, Clone, Default)]
pub struct Letter {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Letter {
    /// A letter for the default exchange, routed straight to `queue`.
    pub fn new(queue: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: queue.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.headers.insert(name.into(), value.into());
        self
    }

    pub async fn send(&self, channel: &dyn BrokerChannel) -> Result<(), TransportError> {
        channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                &self.body,
                self.properties.clone(),
            )
            .await
    }
}

/// The per-message record carried through a consumer pipeline.
///
/// Steps stash whatever they computed in the type-keyed `data` bag and record how they fared,
/// so that later steps and the finalizer can act on it. Faultable steps record their failure on
/// the state: a faulted state skips the remaining steps and reaches the finalizer as is.
#[derive(Default)]
pub struct WorkState {
    received: Option<Arc<ReceivedMessage>>,
    data: Extensions,
    step_success: BTreeMap<String, bool>,
    send_data: Option<Letter>,
    fault: Option<StepFault>,
}

impl std::fmt::Debug for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkState")
            .field("received", &self.received)
            .field("step_success", &self.step_success)
            .field("send_data", &self.send_data)
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}

impl WorkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_received(received: Arc<ReceivedMessage>) -> Self {
        Self {
            received: Some(received),
            ..Self::default()
        }
    }

    pub fn received(&self) -> Option<&Arc<ReceivedMessage>> {
        self.received.as_ref()
    }

    /// Store an item, returning the previous item of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, item: T) -> Option<T> {
        self.data.insert(item)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.data.get::<T>()
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.data.get_mut::<T>()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.data.remove::<T>()
    }

    pub fn mark_step(&mut self, step: impl Into<String>, succeeded: bool) {
        self.step_success.insert(step.into(), succeeded);
    }

    /// How `step` fared, if it recorded it.
    pub fn step_succeeded(&self, step: &str) -> Option<bool> {
        self.step_success.get(step).copied()
    }

    pub fn all_steps_succeeded(&self) -> bool {
        self.step_success.values().all(|succeeded| *succeeded)
    }

    pub fn set_send_data(&mut self, letter: Letter) {
        self.send_data = Some(letter);
    }

    pub fn send_data(&self) -> Option<&Letter> {
        self.send_data.as_ref()
    }

    pub fn take_send_data(&mut self) -> Option<Letter> {
        self.send_data.take()
    }
}

impl Faultable for WorkState {
    fn set_fault(&mut self, fault: StepFault) {
        self.fault = Some(fault);
    }

    fn fault(&self) -> Option<&StepFault> {
        self.fault.as_ref()
    }
}

impl From<Arc<ReceivedMessage>> for WorkState {
    fn from(received: Arc<ReceivedMessage>) -> Self {
        Self::from_received(received)
    }
}
