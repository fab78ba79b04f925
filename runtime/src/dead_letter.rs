//! Dead letter queue for outbound messages the publisher gave up on.
//!
//! The publisher re-appends a failed message to the tail of its queue. When a
//! server sets `publish_max_attempts`, a message that keeps failing is parked
//! here instead, so it no longer competes with healthy traffic. Parked messages
//! can be inspected and handed back to the publisher with
//! [`ConnectionManager::requeue_dead_letters`](crate::manager::ConnectionManager::requeue_dead_letters).

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Default capacity of a [`DeadLetterQueue`].
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;

/// Dead letter queue entry
///
/// A message that failed to publish, with metadata about the failure.
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    /// The message that could not be published
    pub payload: T,

    /// Number of publish attempts made
    pub attempts: u32,

    /// The error message from the last failure
    pub error_message: String,

    /// When the message was parked
    pub dead_lettered_at: DateTime<Utc>,
}

/// Bounded FIFO of [`DeadLetter`] entries.
///
/// When full, the oldest entry is dropped. Clones share the same storage.
///
/// # Example
///
/// ```
/// use courier_runtime::dead_letter::DeadLetterQueue;
///
/// let dlq = DeadLetterQueue::new(2);
/// dlq.push("a", "timeout".to_string(), 50);
/// dlq.push("b", "timeout".to_string(), 50);
/// dlq.push("c", "timeout".to_string(), 50);
///
/// let parked: Vec<_> = dlq.drain().into_iter().map(|d| d.payload).collect();
/// assert_eq!(parked, vec!["b", "c"]);
/// ```
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    max_size: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create a new dead letter queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Park a message.
    ///
    /// If the queue is full, the oldest entry is dropped.
    pub fn push(&self, payload: T, error_message: String, attempts: u32) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if self.max_size == 0 {
            tracing::warn!("Dead letter queue has no capacity, dropping message");
            return;
        }

        if queue.len() >= self.max_size {
            queue.pop_front();
            tracing::warn!(
                max_size = self.max_size,
                "Dead letter queue at capacity, dropping oldest entry"
            );
        }

        queue.push_back(DeadLetter {
            payload,
            attempts,
            error_message,
            dead_lettered_at: Utc::now(),
        });

        tracing::warn!(
            attempts,
            queue_size = queue.len(),
            "Message added to dead letter queue"
        );
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        tracing::info!(count = entries.len(), "Drained dead letter queue");
        entries
    }

    /// Copy of every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter<T>>
    where
        T: Clone,
    {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Peek at the oldest entry without removing it
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter<T>>
    where
        T: Clone,
    {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Get the maximum queue size
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_DEAD_LETTER_CAPACITY)
    }
}
