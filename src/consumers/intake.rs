use super::{ConsumerError, QueueFullBehavior, ReceivedMessage};
use crate::sync::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Why a delivery could not be written to the intake queue.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum WriteError {
    #[error("the intake queue is full")]
    Full,
    #[error("the intake queue is closed")]
    Closed,
    #[error("the write was cancelled")]
    Cancelled,
}

/// The bounded buffer between a consumer's delivery callback and its readers.
///
/// `pending` counts the items admitted (or being admitted) and not read yet: once the writer
/// side is closed, the queue is drained when it drops to zero.
pub(crate) struct IntakeQueue {
    writer: Mutex<Option<mpsc::Sender<Arc<ReceivedMessage>>>>,
    reader: tokio::sync::Mutex<mpsc::Receiver<Arc<ReceivedMessage>>>,
    pending: watch::Sender<usize>,
    abandoned: AtomicBool,
    behavior: QueueFullBehavior,
}

impl IntakeQueue {
    pub(crate) fn new(capacity: usize, behavior: QueueFullBehavior) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (pending, _) = watch::channel(0);
        Self {
            writer: Mutex::new(Some(sender)),
            reader: tokio::sync::Mutex::new(receiver),
            pending,
            abandoned: AtomicBool::new(false),
            behavior,
        }
    }

    /// A queue that is closed already.
    pub(crate) fn closed() -> Self {
        let queue = Self::new(1, QueueFullBehavior::default());
        queue.close_writer();
        queue
    }

    /// Number of items admitted and not read yet.
    pub(crate) fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub(crate) async fn write(
        &self,
        message: Arc<ReceivedMessage>,
        cancel: &CancellationToken,
    ) -> Result<(), WriteError> {
        let sender = lock(&self.writer).clone().ok_or(WriteError::Closed)?;
        self.pending.send_modify(|n| *n += 1);
        let outcome = match self.behavior {
            QueueFullBehavior::Wait => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(WriteError::Cancelled),
                permit = sender.reserve() => permit
                    .map(|permit| permit.send(message))
                    .map_err(|_| WriteError::Closed),
            },
            QueueFullBehavior::DropWrite => sender.try_send(message).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WriteError::Full,
                mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
            }),
        };
        if outcome.is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
        outcome
    }

    /// Read the next item, waiting for one if the queue is empty.
    ///
    /// Fails with [`ConsumerError::QueueClosed`] once the writer side is closed and every item
    /// has been read.
    pub(crate) async fn read(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ReceivedMessage>, ConsumerError> {
        let mut reader = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConsumerError::Cancelled),
            reader = self.reader.lock() => reader,
        };
        if self.abandoned.load(Ordering::SeqCst) {
            return Err(ConsumerError::QueueClosed);
        }
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConsumerError::Cancelled),
            message = reader.recv() => message.ok_or(ConsumerError::QueueClosed)?,
        };
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
        Ok(message)
    }

    /// Read whatever is immediately available, without waiting.
    pub(crate) fn try_read_all(&self) -> Vec<Arc<ReceivedMessage>> {
        let Ok(mut reader) = self.reader.try_lock() else {
            return Vec::new();
        };
        if self.abandoned.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let mut messages = Vec::new();
        while let Ok(message) = reader.try_recv() {
            messages.push(message);
        }
        self.pending
            .send_modify(|n| *n = n.saturating_sub(messages.len()));
        messages
    }

    /// Stop accepting new items. Items already admitted can still be read.
    pub(crate) fn close_writer(&self) {
        lock(&self.writer).take();
    }

    /// Wait for readers to consume every admitted item.
    pub(crate) async fn drained(&self) {
        let mut pending = self.pending.subscribe();
        // The sender lives as long as `self`: this cannot fail.
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    /// Throw away every buffered item and fail subsequent reads.
    ///
    /// Returns the number of items thrown away.
    pub(crate) async fn abandon(&self) -> usize {
        self.abandoned.store(true, Ordering::SeqCst);
        let mut reader = self.reader.lock().await;
        reader.close();
        let mut discarded = 0;
        while let Ok(message) = reader.try_recv() {
            drop(message);
            discarded += 1;
        }
        self.pending.send_replace(0);
        discarded
    }
}
