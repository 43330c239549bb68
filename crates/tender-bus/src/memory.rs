//! In-process broker.
//!
//! Queues live in memory and are shared by every channel opened from the
//! same [`MemoryBroker`]. Unacknowledged deliveries go back to the head of
//! their queue, flagged as redelivered, when their channel closes. Test hooks
//! can fail connects and publishes, or sever every open channel at once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;

use tender_core::{Error, Result};

use crate::broker::{
    Acker, BrokerChannel, BrokerConnector, Delivery, DeliveryStream, OutgoingMessage,
};

#[derive(Debug, Clone)]
struct Stored {
    payload: Vec<u8>,
    headers: Vec<(String, String)>,
    redelivered: bool,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Stored>,
    /// tag -> (channel id, message)
    unacked: HashMap<u64, (u64, Stored)>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    next_tag: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    next_channel: AtomicU64,
    failing_connects: AtomicU32,
    failing_publishes: AtomicU32,
    connects: AtomicU64,
}

/// A published message as seen by test code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMessage {
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl MemoryMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Shared in-memory broker. Cloning yields another handle to the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes fail and close the publishing channel.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Close every open channel, as if the broker connection dropped.
    pub fn sever_connections(&self) {
        let ids: Vec<u64> = self.lock().channels.keys().copied().collect();
        for id in ids {
            self.close_channel(id);
        }
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Append a raw payload to `queue`, declaring it if needed.
    pub fn inject(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Stored {
                payload: payload.into(),
                headers: Vec::new(),
                redelivered: false,
            });
        self.inner.notify.notify_waiters();
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Remove and return every ready message in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<MemoryMessage> {
        let mut state = self.lock();
        let Some(q) = state.queues.get_mut(queue) else {
            return Vec::new();
        };
        q.ready
            .drain(..)
            .map(|m| MemoryMessage {
                payload: m.payload,
                headers: m.headers,
            })
            .collect()
    }

    fn close_channel(&self, channel_id: u64) {
        let mut state = self.lock();
        if let Some(flag) = state.channels.remove(&channel_id) {
            flag.store(false, Ordering::SeqCst);
        }
        for queue in state.queues.values_mut() {
            let tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            let mut returned: Vec<(u64, Stored)> = tags
                .into_iter()
                .filter_map(|tag| queue.unacked.remove(&tag).map(|(_, m)| (tag, m)))
                .collect();
            returned.sort_by_key(|(tag, _)| *tag);
            for (_, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    fn take_next(&self, queue: &str, channel_id: u64, open: &Arc<AtomicBool>) -> Option<Delivery> {
        let mut state = self.lock();
        state.next_tag += 1;
        let tag = state.next_tag;
        let q = state.queues.get_mut(queue)?;
        let message = q.ready.pop_front()?;
        let delivery = Delivery::new(
            message.payload.clone(),
            message.redelivered,
            Box::new(MemoryAcker {
                broker: self.clone(),
                queue: queue.to_string(),
                tag,
                open: open.clone(),
            }),
        );
        q.unacked.insert(tag, (channel_id, message));
        Some(delivery)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        if take_one(&self.inner.failing_connects) {
            return Err(Error::Broker("connection refused".to_string()));
        }
        let id = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));
        self.lock().channels.insert(id, open.clone());
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            broker: self.clone(),
            id,
            open,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Broker("channel closed".to_string()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: &OutgoingMessage) -> Result<()> {
        self.ensure_open()?;
        if take_one(&self.broker.inner.failing_publishes) {
            self.broker.close_channel(self.id);
            return Err(Error::Broker("channel reset during publish".to_string()));
        }
        {
            let mut state = self.broker.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| Error::Broker(format!("queue '{}' not declared", queue)))?;
            q.ready.push_back(Stored {
                payload: message.payload.clone(),
                headers: message.headers.clone(),
                redelivered: false,
            });
        }
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        Ok(self.broker.take_next(queue, self.id, &self.open))
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let subscription = Subscription {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            channel_id: self.id,
            open: self.open.clone(),
            done: false,
        };
        let stream = futures::stream::unfold(subscription, |mut sub| async move {
            if sub.done {
                return None;
            }
            let inner = sub.broker.inner.clone();
            loop {
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !sub.open.load(Ordering::SeqCst) {
                    sub.done = true;
                    return Some((Err(Error::Broker("channel closed".to_string())), sub));
                }
                if let Some(delivery) = sub.broker.take_next(&sub.queue, sub.channel_id, &sub.open)
                {
                    return Some((Ok(delivery), sub));
                }
                notified.await;
            }
        });
        Ok(stream.boxed())
    }

    async fn purge(&self, queue: &str) -> Result<u64> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        Ok(state.queues.get_mut(queue).map_or(0, |q| {
            let purged = q.ready.len() as u64;
            q.ready.clear();
            purged
        }))
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}

struct Subscription {
    broker: MemoryBroker,
    queue: String,
    channel_id: u64,
    open: Arc<AtomicBool>,
    done: bool,
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Broker("ack on closed channel".to_string()));
        }
        let mut state = self.broker.lock();
        let removed = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag));
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::Broker(format!("unknown delivery tag {}", self.tag))),
        }
    }
}
