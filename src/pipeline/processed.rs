use super::StepFault;
use crate::consumers::ReceivedMessage;
use std::sync::Arc;

/// An item handed to the pipeline finalizer: the output of the last step, or the fault that took
/// the item out of the pipeline.
///
/// A faulted item is still available through [`Processed::value`] when the failing step handed
/// it back and it already has the output type of the pipeline.
#[derive(Debug)]
pub struct Processed<T> {
    sequence: u64,
    outcome: Outcome<T>,
    received: Option<Arc<ReceivedMessage>>,
}

#[derive(Debug)]
enum Outcome<T> {
    Done(T),
    Faulted { fault: StepFault, item: Option<T> },
}

impl<T> Processed<T> {
    pub(crate) fn done(sequence: u64, value: T, received: Option<Arc<ReceivedMessage>>) -> Self {
        Self {
            sequence,
            outcome: Outcome::Done(value),
            received,
        }
    }

    pub(crate) fn faulted(
        sequence: u64,
        fault: StepFault,
        item: Option<T>,
        received: Option<Arc<ReceivedMessage>>,
    ) -> Self {
        Self {
            sequence,
            outcome: Outcome::Faulted { fault, item },
            received,
        }
    }

    /// Submission order of the item, starting from 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.outcome, Outcome::Faulted { .. })
    }

    pub fn fault(&self) -> Option<&StepFault> {
        match &self.outcome {
            Outcome::Done(_) => None,
            Outcome::Faulted { fault, .. } => Some(fault),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            Outcome::Done(value) => Some(value),
            Outcome::Faulted { item, .. } => item.as_ref(),
        }
    }

    pub fn value_mut(&mut self) -> Option<&mut T> {
        match &mut self.outcome {
            Outcome::Done(value) => Some(value),
            Outcome::Faulted { item, .. } => item.as_mut(),
        }
    }

    /// The message the item was submitted for, if any.
    pub fn received(&self) -> Option<&Arc<ReceivedMessage>> {
        self.received.as_ref()
    }

    /// The output of the last step, or the fault. A faulted item handed back by its step is
    /// dropped: use [`Processed::into_parts`] to keep it.
    pub fn into_result(self) -> Result<T, StepFault> {
        match self.outcome {
            Outcome::Done(value) => Ok(value),
            Outcome::Faulted { fault, .. } => Err(fault),
        }
    }

    pub fn into_parts(self) -> (Option<T>, Option<StepFault>) {
        match self.outcome {
            Outcome::Done(value) => (Some(value), None),
            Outcome::Faulted { fault, item } => (item, Some(fault)),
        }
    }

    /// Settle the originating message: acknowledge it if every step succeeded, reject it without
    /// requeueing otherwise.
    ///
    /// Returns `false` if there is no message to settle or the broker refused the settlement.
    pub async fn settle(&self) -> bool {
        let Some(received) = &self.received else {
            return false;
        };
        match self.fault() {
            None => received.ack().await,
            Some(fault) => {
                tracing::warn!(
                    delivery_tag = received.delivery_tag(),
                    error = %fault,
                    "Rejecting a message that failed processing"
                );
                received.reject(false).await
            }
        }
    }
}
