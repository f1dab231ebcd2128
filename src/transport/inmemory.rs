use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    envelope::Frame,
    transport::{Broker, Delivery, Receiver, Sender, TransportError},
};

/// In-memory broker for testing or local pipelines.
///
/// Messages live in a shared queue with queue-broker semantics: receivers get
/// one message at a time, unacknowledged messages are tracked per receiver,
/// a requeued message goes back to the head of the queue, and anything a
/// receiver still holds when it closes becomes available again.
///
/// It is useful for:
/// - Unit and integration testing, including fault injection
/// - Simulating redelivery without a real broker
/// - Debugging message flows
///
/// Cloning the broker shares the queue.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    destination: String,
    max_deliveries: Option<u32>,
    state: Mutex<QueueState>,
    notify: Notify,
    next_tag: AtomicU64,
    next_receiver: AtomicU64,
    open_receivers: AtomicUsize,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, (u64, Stored)>,
    dead_letters: Vec<Vec<u8>>,
    sent: Vec<Frame>,
    send_attempts: usize,
    acked: usize,
    failing_sends: usize,
    refuse_connections: bool,
}

#[derive(Clone)]
struct Stored {
    body: Vec<u8>,
    deliveries: u32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InMemoryBroker {
    /// Create an empty broker for `destination`.
    pub fn new(destination: impl Into<String>) -> Self {
        Self::build(destination.into(), None)
    }

    /// Create a broker that dead-letters a message once it has been handed
    /// out `max_deliveries` times and is rejected again, like a managed bus.
    pub fn with_max_deliveries(destination: impl Into<String>, max_deliveries: u32) -> Self {
        Self::build(destination.into(), Some(max_deliveries.max(1)))
    }

    fn build(destination: String, max_deliveries: Option<u32>) -> Self {
        Self {
            shared: Arc::new(Shared {
                destination,
                max_deliveries,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                next_tag: AtomicU64::new(1),
                next_receiver: AtomicU64::new(1),
                open_receivers: AtomicUsize::new(0),
            }),
        }
    }

    /// Put a raw body on the queue, bypassing any sender.
    pub fn inject(&self, body: impl Into<Vec<u8>>) {
        self.shared.lock().ready.push_back(Stored {
            body: body.into(),
            deliveries: 0,
        });
        self.shared.notify.notify_one();
    }

    /// Make the next `count` sends fail with a transient connection error.
    pub fn fail_next_sends(&self, count: usize) {
        self.shared.lock().failing_sends = count;
    }

    /// Refuse (or accept again) new senders and receivers.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.lock().refuse_connections = refuse;
    }

    /// Frames accepted by the broker, in send order.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.shared.lock().sent.clone()
    }

    /// Every send call, failed ones included.
    pub fn send_attempts(&self) -> usize {
        self.shared.lock().send_attempts
    }

    /// Messages waiting to be received.
    pub fn pending(&self) -> usize {
        self.shared.lock().ready.len()
    }

    /// Messages handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    pub fn acked(&self) -> usize {
        self.shared.lock().acked
    }

    /// Bodies of messages that were discarded or exceeded the delivery limit.
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.shared.lock().dead_letters.clone()
    }

    /// Receivers opened and not yet closed or dropped.
    pub fn open_receivers(&self) -> usize {
        self.shared.open_receivers.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    type Sender = InMemorySender;
    type Receiver = InMemoryReceiver;

    fn destination(&self) -> &str {
        &self.shared.destination
    }

    async fn open_sender(&self) -> Result<Self::Sender, TransportError> {
        if self.shared.lock().refuse_connections {
            return Err(TransportError::connection("in-memory broker refused connection"));
        }
        Ok(InMemorySender {
            shared: Arc::clone(&self.shared),
        })
    }

    async fn open_receiver(&self) -> Result<Self::Receiver, TransportError> {
        if self.shared.lock().refuse_connections {
            return Err(TransportError::connection("in-memory broker refused connection"));
        }
        self.shared.open_receivers.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryReceiver {
            id: self.shared.next_receiver.fetch_add(1, Ordering::SeqCst),
            shared: Arc::clone(&self.shared),
            closed: false,
        })
    }
}

/// Sending half of an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemorySender {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl Sender for InMemorySender {
    /// "Send" a frame by appending it to the in-memory queue.
    #[tracing::instrument(skip_all, fields(message_id = %frame.id()))]
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        {
            let mut state = self.shared.lock();
            state.send_attempts += 1;
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(TransportError::connection("injected send failure"));
            }
            state.ready.push_back(Stored {
                body: frame.body().to_vec(),
                deliveries: 0,
            });
            state.sent.push(frame);
        }
        self.shared.notify.notify_one();
        tracing::debug!("Frame queued in memory");
        Ok(())
    }
}

/// Delivery tag of a message handed out by an [`InMemoryReceiver`].
#[derive(Debug)]
pub struct InMemoryHandle {
    tag: u64,
}

/// Receiving half of an [`InMemoryBroker`].
pub struct InMemoryReceiver {
    id: u64,
    shared: Arc<Shared>,
    closed: bool,
}

impl InMemoryReceiver {
    fn take_unacked(&self, tag: u64) -> Result<Stored, TransportError> {
        let mut state = self.shared.lock();
        match state.unacked.get(&tag) {
            Some((owner, _)) if *owner == self.id => {}
            _ => {
                return Err(TransportError::settlement(format!(
                    "unknown delivery tag {tag}"
                )));
            }
        }
        state
            .unacked
            .remove(&tag)
            .map(|(_, stored)| stored)
            .ok_or_else(|| TransportError::settlement(format!("unknown delivery tag {tag}")))
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.open_receivers.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.shared.lock();
        let mut held: Vec<(u64, Stored)> = state
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == self.id)
            .map(|(tag, (_, stored))| (*tag, stored.clone()))
            .collect();
        held.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (tag, stored) in held {
            state.unacked.remove(&tag);
            state.ready.push_front(stored);
        }
        drop(state);
        self.shared.notify.notify_one();
    }
}

#[async_trait::async_trait]
impl Receiver for InMemoryReceiver {
    type Handle = InMemoryHandle;

    async fn receive(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery<Self::Handle>>, TransportError> {
        if self.closed {
            return Err(TransportError::connection("receiver is closed"));
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            {
                let mut state = self.shared.lock();
                if let Some(mut stored) = state.ready.pop_front() {
                    stored.deliveries += 1;
                    let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);
                    let delivery =
                        Delivery::new(stored.body.clone(), InMemoryHandle { tag }, stored.deliveries);
                    state.unacked.insert(tag, (self.id, stored));
                    return Ok(Some(delivery));
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = self.shared.notify.notified() => {}
            }
        }
    }

    async fn ack(&mut self, handle: Self::Handle) -> Result<(), TransportError> {
        self.take_unacked(handle.tag)?;
        self.shared.lock().acked += 1;
        Ok(())
    }

    async fn nack(&mut self, handle: Self::Handle, requeue: bool) -> Result<(), TransportError> {
        let stored = self.take_unacked(handle.tag)?;
        let exhausted = self
            .shared
            .max_deliveries
            .is_some_and(|max| stored.deliveries >= max);

        let mut state = self.shared.lock();
        if requeue && !exhausted {
            state.ready.push_front(stored);
            drop(state);
            self.shared.notify.notify_one();
        } else {
            state.dead_letters.push(stored.body);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryReceiver {
    fn drop(&mut self) {
        self.release();
    }
}
