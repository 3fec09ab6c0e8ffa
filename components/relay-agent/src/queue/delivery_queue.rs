//! Delivery Queue
//!
//! Holds decoded events the controller could not hand to the transport yet,
//! in arrival order. Events leave the queue from the head only, so whatever
//! order they were enqueued in is the order they reach the collector.
//!
//! The queue is unbounded unless a capacity is configured. A bounded queue
//! applies its overflow policy on `enqueue`:
//! - `drop_oldest`: evict the head to make room, always accept the new event.
//! - `drop_newest`: keep the queue as is and refuse the new event.
//!
//! Either way the retained events keep their relative order.

// Local crates
use crate::{
    decoder::models::Event,
    helpers::load_config::{OverflowPolicy, QueueConfig},
};

// External crates
use std::collections::VecDeque;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Anything the queue can drain into.
///
/// `offer` either takes ownership of the event or hands it back when the sink
/// is saturated, in which case draining stops and the event returns to the
/// head of the queue.
pub trait EventSink {
    /// Try to accept an event without waiting.
    fn offer(&mut self, event: Event) -> Result<(), Event>;
}

impl EventSink for mpsc::Sender<Event> {
    fn offer(&mut self, event: Event) -> Result<(), Event> {
        self.try_send(event).map_err(|e| match e {
            TrySendError::Full(event) | TrySendError::Closed(event) => event,
        })
    }
}

impl EventSink for Vec<Event> {
    fn offer(&mut self, event: Event) -> Result<(), Event> {
        self.push(event);
        Ok(())
    }
}

/// Outcome of an [`DeliveryQueue::enqueue`] on a full bounded queue.
#[derive(Debug, PartialEq)]
pub enum Overflow {
    /// The event was queued without evicting anything.
    None,
    /// The event was queued and this older event was evicted.
    DroppedOldest(Event),
    /// The queue was full, this (new) event was not queued.
    DroppedNewest(Event),
}

/// FIFO of events awaiting transmission.
#[derive(Debug)]
pub struct DeliveryQueue {
    queue: VecDeque<Event>,
    capacity: Option<usize>,
    overflow_policy: OverflowPolicy,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl DeliveryQueue {
    /// Queue with no upper bound.
    pub fn unbounded() -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: None,
            overflow_policy: OverflowPolicy::default(),
        }
    }

    /// Build a queue from the `[queue]` configuration section.
    pub fn new(config: &QueueConfig) -> Self {
        match config.capacity {
            Some(capacity) => {
                tracing::debug!(
                    queue_capacity = capacity,
                    overflow_policy = ?config.overflow_policy,
                    "Creating bounded delivery queue"
                );
                Self {
                    queue: VecDeque::with_capacity(capacity.min(4096)),
                    capacity: Some(capacity),
                    overflow_policy: config.overflow_policy,
                }
            }
            None => {
                tracing::debug!("Creating unbounded delivery queue");
                Self::unbounded()
            }
        }
    }

    /// Append an event to the tail, applying the overflow policy when bounded.
    pub fn enqueue(&mut self, event: Event) -> Overflow {
        let Some(capacity) = self.capacity else {
            self.queue.push_back(event);
            return Overflow::None;
        };

        if self.queue.len() < capacity {
            self.queue.push_back(event);
            return Overflow::None;
        }

        match self.overflow_policy {
            OverflowPolicy::DropOldest => match self.queue.pop_front() {
                Some(evicted) => {
                    self.queue.push_back(event);
                    Overflow::DroppedOldest(evicted)
                }
                // zero capacity: nothing to evict, nothing can be kept
                None => Overflow::DroppedNewest(event),
            },
            OverflowPolicy::DropNewest => Overflow::DroppedNewest(event),
        }
    }

    /// Re-insert events at the head, ahead of everything already queued.
    ///
    /// `events` must be in their original order; they are restored in that
    /// same order. Used when the transport hands back events it accepted but
    /// never wrote. Capacity is not enforced here: these events are older
    /// than anything queued and were already admitted once.
    pub fn push_front_all(&mut self, events: Vec<Event>) {
        for event in events.into_iter().rev() {
            self.queue.push_front(event);
        }
    }

    /// Remove events from the head and forward them to `sink`, in order.
    ///
    /// Stops when the queue is empty or the sink refuses an event; a refused
    /// event is put back at the head. Returns how many events were forwarded.
    pub fn drain_into<S: EventSink + ?Sized>(&mut self, sink: &mut S) -> usize {
        let mut forwarded = 0;
        while let Some(event) = self.queue.pop_front() {
            match sink.offer(event) {
                Ok(()) => forwarded += 1,
                Err(refused) => {
                    self.queue.push_front(refused);
                    break;
                }
            }
        }
        forwarded
    }

    /// Drop everything queued, returning how many events were discarded.
    pub fn clear(&mut self) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
