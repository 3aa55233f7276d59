//! In-process message broker with peek-lock delivery.
//!
//! A received message is locked to its [`Delivery`] until the holder settles it
//! with `complete`, `abandon` or `dead_letter`. An unsettled delivery that is
//! dropped counts as abandoned. Abandoned messages go back to the head of the
//! queue until their delivery count reaches the broker's limit, after which
//! they move to the queue's dead-letter list.
//!
//! `send` copies the active span of the caller's context into the message
//! headers, and `receive` restores it on the other side.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tradetrace_core::error::{Result, TradeTraceError};
use tradetrace_core::{Context, time};
use uuid::Uuid;

use crate::propagation::{self, MessageExtractor, MessageInjector};

pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Dead letters kept per queue; the oldest are evicted beyond this.
pub const DEAD_LETTER_CAPACITY: usize = 1024;

const MAX_DELIVERY_REASON: &str = "MaxDeliveryCountExceeded";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub message_id: String,
    pub body: Vec<u8>,
    /// Application properties set by the sender.
    pub properties: BTreeMap<String, String>,
    /// Transport headers; carries `traceparent` and `tracestate`.
    pub headers: BTreeMap<String, String>,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub reason: String,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    in_flight: usize,
    dead: VecDeque<DeadLetter>,
    notify: Arc<Notify>,
}

struct Shared {
    max_delivery_count: u32,
    dead_letter_capacity: usize,
    queues: Mutex<HashMap<String, QueueState>>,
}

#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("max_delivery_count", &self.shared.max_delivery_count)
            .finish_non_exhaustive()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELIVERY_COUNT)
    }
}

impl Broker {
    pub fn new(max_delivery_count: u32) -> Self {
        Self::with_dead_letter_capacity(max_delivery_count, DEAD_LETTER_CAPACITY)
    }

    pub fn with_dead_letter_capacity(max_delivery_count: u32, dead_letter_capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_delivery_count: max_delivery_count.max(1),
                dead_letter_capacity: dead_letter_capacity.max(1),
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn max_delivery_count(&self) -> u32 {
        self.shared.max_delivery_count
    }

    fn queues(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>> {
        self.shared
            .queues
            .lock()
            .map_err(|_| TradeTraceError::Broker("broker mutex poisoned".to_string()))
    }

    /// Enqueues `body` on `queue` and returns the new message id. The active
    /// span of `cx` travels with the message.
    pub fn send(
        &self,
        cx: &Context,
        queue: &str,
        body: Vec<u8>,
        properties: BTreeMap<String, String>,
    ) -> Result<String> {
        if queue.trim().is_empty() {
            return Err(TradeTraceError::InvalidArgument(
                "queue name must not be empty".to_string(),
            ));
        }

        let mut headers = BTreeMap::new();
        propagation::inject(cx, &mut MessageInjector(&mut headers));

        let envelope = Envelope {
            message_id: Uuid::new_v4().to_string(),
            body,
            properties,
            headers,
            enqueued_at: time::now(),
            delivery_count: 0,
        };
        let message_id = envelope.message_id.clone();

        let mut queues = self.queues()?;
        let state = queues.entry(queue.to_string()).or_default();
        state.ready.push_back(envelope);
        state.notify.notify_one();
        drop(queues);

        tracing::debug!(queue, message_id = %message_id, "message enqueued");
        Ok(message_id)
    }

    pub fn receiver(&self, queue: impl Into<String>) -> Receiver {
        Receiver {
            broker: self.clone(),
            queue: queue.into(),
        }
    }

    /// Messages waiting to be received.
    pub fn depth(&self, queue: &str) -> usize {
        self.queues()
            .ok()
            .and_then(|q| q.get(queue).map(|s| s.ready.len()))
            .unwrap_or(0)
    }

    /// Messages received but not yet settled.
    pub fn in_flight(&self, queue: &str) -> usize {
        self.queues()
            .ok()
            .and_then(|q| q.get(queue).map(|s| s.in_flight))
            .unwrap_or(0)
    }

    /// Dead letters of `queue`, oldest first.
    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        self.queues()
            .ok()
            .and_then(|q| q.get(queue).map(|s| s.dead.iter().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn dead_letter_count(&self, queue: &str) -> usize {
        self.queues()
            .ok()
            .and_then(|q| q.get(queue).map(|s| s.dead.len()))
            .unwrap_or(0)
    }

    /// Removes and returns the dead letters of `queue`, oldest first.
    pub fn drain_dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        let Ok(mut queues) = self.queues() else {
            return Vec::new();
        };
        match queues.get_mut(queue) {
            Some(state) => state.dead.drain(..).collect(),
            None => Vec::new(),
        }
    }

    fn try_take(&self, queue: &str) -> Result<(Option<Envelope>, Arc<Notify>)> {
        let mut queues = self.queues()?;
        let state = queues.entry(queue.to_string()).or_default();
        let notify = state.notify.clone();
        let Some(mut envelope) = state.ready.pop_front() else {
            return Ok((None, notify));
        };
        envelope.delivery_count += 1;
        state.in_flight += 1;
        Ok((Some(envelope), notify))
    }

    fn settle(&self, queue: &str, envelope: Envelope, settlement: Settlement) {
        let Ok(mut queues) = self.queues() else {
            tracing::error!(
                queue,
                message_id = %envelope.message_id,
                "broker unavailable; settlement lost"
            );
            return;
        };
        let state = queues.entry(queue.to_string()).or_default();
        state.in_flight = state.in_flight.saturating_sub(1);

        match settlement {
            Settlement::Complete => {
                tracing::debug!(queue, message_id = %envelope.message_id, "message completed");
            }
            Settlement::Abandon if envelope.delivery_count >= self.shared.max_delivery_count => {
                tracing::warn!(
                    queue,
                    message_id = %envelope.message_id,
                    delivery_count = envelope.delivery_count,
                    "delivery limit reached; moving message to dead-letter"
                );
                self.bury(
                    queue,
                    state,
                    DeadLetter {
                        envelope,
                        reason: MAX_DELIVERY_REASON.to_string(),
                    },
                );
            }
            Settlement::Abandon => {
                tracing::debug!(
                    queue,
                    message_id = %envelope.message_id,
                    delivery_count = envelope.delivery_count,
                    "message abandoned; redelivering"
                );
                state.ready.push_front(envelope);
                state.notify.notify_one();
            }
            Settlement::DeadLetter(reason) => {
                tracing::warn!(
                    queue,
                    message_id = %envelope.message_id,
                    reason = %reason,
                    "message dead-lettered"
                );
                self.bury(queue, state, DeadLetter { envelope, reason });
            }
        }
    }

    fn bury(&self, queue: &str, state: &mut QueueState, letter: DeadLetter) {
        if state.dead.len() >= self.shared.dead_letter_capacity {
            if let Some(evicted) = state.dead.pop_front() {
                tracing::warn!(
                    queue,
                    message_id = %evicted.envelope.message_id,
                    "dead-letter list full; dropping oldest entry"
                );
            }
        }
        state.dead.push_back(letter);
    }
}

enum Settlement {
    Complete,
    Abandon,
    DeadLetter(String),
}

/// Pulls messages from one queue.
#[derive(Clone, Debug)]
pub struct Receiver {
    broker: Broker,
    queue: String,
}

impl Receiver {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Waits for the next message. Cancel-safe: a message is only taken in the
    /// poll that returns it.
    pub async fn receive(&self) -> Result<Delivery> {
        loop {
            let (envelope, notify) = self.broker.try_take(&self.queue)?;
            if let Some(envelope) = envelope {
                let context = propagation::extract(&MessageExtractor(&envelope.headers));
                return Ok(Delivery {
                    envelope,
                    settled: false,
                    context,
                    broker: self.broker.clone(),
                    queue: self.queue.clone(),
                });
            }
            notify.notified().await;
        }
    }
}

/// A locked message. Settle it exactly once; dropping it abandons it.
pub struct Delivery {
    envelope: Envelope,
    settled: bool,
    context: Context,
    broker: Broker,
    queue: String,
}

impl Delivery {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn message_id(&self) -> &str {
        &self.envelope().message_id
    }

    pub fn body(&self) -> &[u8] {
        &self.envelope().body
    }

    /// 1 on first delivery.
    pub fn delivery_count(&self) -> u32 {
        self.envelope().delivery_count
    }

    /// Context restored from the message headers; empty when the sender had no
    /// active span or the headers were malformed.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn complete(mut self) {
        self.settle(Settlement::Complete);
    }

    pub fn abandon(mut self) {
        self.settle(Settlement::Abandon);
    }

    pub fn dead_letter(mut self, reason: impl Into<String>) {
        self.settle(Settlement::DeadLetter(reason.into()));
    }

    fn settle(&mut self, settlement: Settlement) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }
        let envelope = std::mem::take(&mut self.envelope);
        self.broker.settle(&self.queue, envelope, settlement);
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.settle(Settlement::Abandon);
    }
}
