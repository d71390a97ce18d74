//! In-process broker
//!
//! `MemoryBroker` implements both `Connector` and `BrokerChannel` without a
//! network. It keeps enough of RabbitMQ's behavior for the client to be
//! exercised end to end:
//! - exchanges with direct, fanout and topic (`*` / `#`) routing, plus the
//!   default exchange that routes by queue name
//! - durable queues whose arguments must match on re-declaration
//! - per-message and per-queue TTL, manual ack / nack / requeue
//! - unacknowledged deliveries return to their queue, flagged redelivered,
//!   when the consuming channel closes
//! - publisher confirms numbered per channel from 1
//!
//! Faults can be injected through the `MemoryBroker` handle: refused
//! connections, failed sends, nacks, withheld confirmations, a closed
//! confirmation stream, broken channels and stalled sends.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as feed;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{Acker, BrokerChannel, Confirmation, Connector, Delivery, DeliveryStream, QueueArgs};
use crate::config::{ExchangeKind, MqOptions, Topic};
use crate::utils::error::{MqError, Result};

/// A message accepted by the broker, in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub expiration: Duration,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    stall: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelState>,
    next_channel: u64,
    connects: usize,
    published: Vec<Published>,
    held: Vec<(mpsc::Sender<Confirmation>, Confirmation)>,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    refuse_connections: bool,
    fail_sends: usize,
    nack_publishes: usize,
    fail_queue_declares: usize,
    hold_confirms: bool,
}

struct Binding {
    queue: String,
    exchange: String,
    key: String,
}

struct QueueState {
    args: QueueArgs,
    messages: VecDeque<Stored>,
    feeds: Vec<Feed>,
    next_feed: usize,
    feed_seq: u64,
    /// Delivered but not yet settled, keyed by `(feed id, delivery tag)`.
    unacked: HashMap<(u64, u64), Unacked>,
    acked: usize,
    nacked: usize,
}

struct Feed {
    id: u64,
    channel: u64,
    tx: feed::UnboundedSender<Result<Delivery>>,
    next_tag: u64,
}

struct Unacked {
    channel: u64,
    message: Stored,
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
    expires_at: Option<Instant>,
}

struct ChannelState {
    open: bool,
    confirms: Option<mpsc::Sender<Confirmation>>,
    next_tag: u64,
    close_listeners: Vec<oneshot::Sender<MqError>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (stall, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            stall: Arc::new(stall),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of successful `connect` calls so far.
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn open_channels(&self) -> usize {
        self.state().channels.values().filter(|c| c.open).count()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state().exchanges.get(name).cloned()
    }

    pub fn queue_args(&self, name: &str) -> Option<QueueArgs> {
        self.state().queues.get(name).map(|q| q.args.clone())
    }

    /// `(exchange, binding key)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.key.clone()))
            .collect()
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    pub fn acked(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.acked)
    }

    pub fn nacked(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.nacked)
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    /// Create `queue` up front, as if another client had declared it.
    pub fn seed_queue(&self, queue: &str, args: QueueArgs) {
        self.state()
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(args));
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().faults.refuse_connections = refuse;
    }

    /// The next `count` publishes fail before reaching any exchange.
    pub fn fail_next_sends(&self, count: usize) {
        self.state().faults.fail_sends = count;
    }

    /// The next `count` accepted publishes are confirmed with a nack.
    pub fn nack_next(&self, count: usize) {
        self.state().faults.nack_publishes = count;
    }

    /// The next `count` queue declarations fail as conflicting.
    pub fn fail_next_queue_declares(&self, count: usize) {
        self.state().faults.fail_queue_declares = count;
    }

    /// Withhold confirmations until [`release_confirms`](Self::release_confirms).
    pub fn hold_confirms(&self, hold: bool) {
        self.state().faults.hold_confirms = hold;
    }

    pub async fn release_confirms(&self) {
        let held = std::mem::take(&mut self.state().held);
        for (tx, confirmation) in held {
            let _ = tx.send(confirmation).await;
        }
    }

    /// Release withheld confirmations newest first, turning the tags listed
    /// in `nack` into nacks.
    pub async fn release_confirms_reversed(&self, nack: &[u64]) {
        let held = std::mem::take(&mut self.state().held);
        for (tx, mut confirmation) in held.into_iter().rev() {
            if nack.contains(&confirmation.delivery_tag) {
                confirmation.ack = false;
            }
            let _ = tx.send(confirmation).await;
        }
    }

    /// Deliveries of `queue` handed to a consumer and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// End the confirmation stream of every channel, dropping withheld ones.
    pub fn close_confirms(&self) {
        let mut state = self.state();
        state.held.clear();
        for channel in state.channels.values_mut() {
            channel.confirms = None;
        }
    }

    /// Break every open channel as the broker would on a channel exception.
    pub fn close_channels(&self, reason: &str) {
        let mut state = self.state();
        let ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.shut_channel(
                &mut state,
                id,
                Some(MqError::ChannelClosed(reason.to_string())),
            );
        }
    }

    /// While stalled, `publish` blocks before touching any exchange.
    pub fn stall_sends(&self, stall: bool) {
        self.stall.send_replace(stall);
    }

    async fn wait_unstalled(&self) {
        let mut rx = self.stall.subscribe();
        let _ = rx.wait_for(|stalled| !*stalled).await;
    }

    fn deliver(&self, state: &mut State, queue: &str, stored: Stored) {
        if stored.expires_at.is_some_and(|at| at <= Instant::now()) {
            return;
        }
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        while !q.feeds.is_empty() {
            let idx = q.next_feed % q.feeds.len();
            let feed = &mut q.feeds[idx];
            let tag = feed.next_tag;
            let delivery = Delivery::new(
                tag,
                stored.exchange.clone(),
                stored.routing_key.clone(),
                stored.redelivered,
                stored.body.clone(),
                Box::new(MemoryAcker {
                    broker: self.clone(),
                    queue: queue.to_string(),
                    feed: feed.id,
                    tag,
                }),
            );
            if feed.tx.unbounded_send(Ok(delivery)).is_ok() {
                feed.next_tag += 1;
                let key = (feed.id, tag);
                let channel = feed.channel;
                q.unacked.insert(
                    key,
                    Unacked {
                        channel,
                        message: stored,
                    },
                );
                q.next_feed = idx + 1;
                return;
            }
            let gone = q.feeds.remove(idx);
            for message in q.reclaim(|feed, _| feed == gone.id).into_iter().rev() {
                q.messages.push_front(message);
            }
        }

        q.messages.push_back(stored);
    }

    /// Close channel `id`. `reason` is `None` for a client-initiated close.
    ///
    /// Deliveries the channel left unsettled go back to their queue, ahead of
    /// anything still waiting there.
    fn shut_channel(&self, state: &mut State, id: u64, reason: Option<MqError>) {
        if let Some(channel) = state.channels.get_mut(&id) {
            channel.open = false;
            channel.confirms = None;
            for tx in channel.close_listeners.drain(..) {
                if let Some(reason) = &reason {
                    let _ = tx.send(reason.clone());
                }
            }
        }

        let names: Vec<String> = state.queues.keys().cloned().collect();
        for name in names {
            let Some(q) = state.queues.get_mut(&name) else {
                continue;
            };
            q.feeds.retain(|f| f.channel != id);
            let returned = q.reclaim(|_, channel| channel == id);
            if returned.is_empty() {
                continue;
            }
            let waiting: Vec<Stored> = q.messages.drain(..).collect();
            for message in returned.into_iter().chain(waiting) {
                self.deliver(state, &name, message);
            }
        }
    }

    fn route(
        &self,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        expiration: Duration,
    ) {
        let targets: Vec<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let Some(kind) = state.exchanges.get(exchange) else {
                return;
            };
            let mut seen = HashSet::new();
            state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && binding_matches(kind, &b.key, routing_key))
                .filter(|b| seen.insert(b.queue.clone()))
                .map(|b| b.queue.clone())
                .collect()
        };

        let now = Instant::now();
        for queue in targets {
            let ttl = state
                .queues
                .get(&queue)
                .and_then(|q| q.args.message_ttl)
                .map_or(expiration, |ttl| ttl.min(expiration));
            let stored = Stored {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                redelivered: false,
                expires_at: Some(now + ttl),
            };
            self.deliver(state, &queue, stored);
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn channel(&mut self, id: u64) -> Result<&mut ChannelState> {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(MqError::ChannelClosed("channel is not open".to_string())),
        }
    }
}

impl QueueState {
    fn new(args: QueueArgs) -> Self {
        Self {
            args,
            messages: VecDeque::new(),
            feeds: Vec::new(),
            next_feed: 0,
            feed_seq: 0,
            unacked: HashMap::new(),
            acked: 0,
            nacked: 0,
        }
    }

    /// Remove the unsettled deliveries matching `(feed id, channel)` and
    /// return their messages in delivery order, flagged redelivered.
    fn reclaim(&mut self, matches: impl Fn(u64, u64) -> bool) -> Vec<Stored> {
        let mut keys: Vec<(u64, u64)> = self
            .unacked
            .iter()
            .filter(|(key, entry)| matches(key.0, entry.channel))
            .map(|(key, _)| *key)
            .collect();
        keys.sort_unstable();
        keys.into_iter()
            .filter_map(|key| self.unacked.remove(&key))
            .map(|entry| Stored {
                redelivered: true,
                ..entry.message
            })
            .collect()
    }
}

fn binding_matches(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
        ExchangeKind::Direct | ExchangeKind::Headers | ExchangeKind::Custom(_) => {
            binding_key == routing_key
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, _options: &MqOptions) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.state();
        if state.faults.refuse_connections {
            return Err(MqError::Connect("connection refused".to_string()));
        }
        state.connects += 1;
        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(
            id,
            ChannelState {
                open: true,
                confirms: None,
                next_tag: 1,
                close_listeners: Vec::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, topic: &Topic) -> Result<()> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        match state.exchanges.get(&topic.exchange_name) {
            Some(kind) if *kind != topic.exchange_kind => Err(MqError::Declare {
                what: "exchange",
                name: topic.exchange_name.clone(),
                reason: format!("inequivalent type: existing `{kind}`"),
            }),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(topic.exchange_name.clone(), topic.exchange_kind.clone());
                Ok(())
            }
        }
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        state.bindings.retain(|b| b.queue != queue);
        let purged = state
            .queues
            .remove(queue)
            .map_or(0, |q| q.messages.len());
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn declare_queue(&self, queue: &str, args: &QueueArgs) -> Result<()> {
        let mut state = self.broker.state();
        state.channel(self.id)?;

        let conflict = if state.faults.fail_queue_declares > 0 {
            state.faults.fail_queue_declares -= 1;
            Some("injected declaration failure".to_string())
        } else {
            match state.queues.get(queue) {
                Some(existing) if existing.args != *args => {
                    Some("inequivalent arguments for existing queue".to_string())
                }
                _ => None,
            }
        };

        if let Some(reason) = conflict {
            // RabbitMQ answers PRECONDITION_FAILED by closing the channel.
            self.broker
                .shut_channel(&mut state, self.id, Some(MqError::ChannelClosed(reason.clone())));
            return Err(MqError::QueueConflict {
                queue: queue.to_string(),
                reason,
            });
        }

        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(args.clone()));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        let missing = if !state.queues.contains_key(queue) {
            Some(format!("no queue `{queue}`"))
        } else if !state.exchanges.contains_key(exchange) {
            Some(format!("no exchange `{exchange}`"))
        } else {
            None
        };
        if let Some(reason) = missing {
            return Err(MqError::Declare {
                what: "queue binding",
                name: format!("{queue} <- {exchange} ({binding_key})"),
                reason,
            });
        }

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.key == binding_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                key: binding_key.to_string(),
            });
        }
        Ok(())
    }

    async fn enable_confirms(&self, buffer: usize) -> Result<mpsc::Receiver<Confirmation>> {
        let mut state = self.broker.state();
        let channel = state.channel(self.id)?;
        let (tx, rx) = mpsc::channel(buffer);
        channel.confirms = Some(tx);
        Ok(rx)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        expiration: Duration,
    ) -> Result<()> {
        self.broker.wait_unstalled().await;

        let confirmation = {
            let mut state = self.broker.state();
            state.channel(self.id)?;
            if state.faults.fail_sends > 0 {
                state.faults.fail_sends -= 1;
                return Err(MqError::Send("injected send failure".to_string()));
            }
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(MqError::Send(format!("no exchange `{exchange}`")));
            }

            state.published.push(Published {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: payload.to_vec(),
                expiration,
            });
            self.broker
                .route(&mut state, exchange, routing_key, payload, expiration);

            let ack = if state.faults.nack_publishes > 0 {
                state.faults.nack_publishes -= 1;
                false
            } else {
                true
            };
            let hold = state.faults.hold_confirms;
            let channel = state.channel(self.id)?;
            let pending = channel.confirms.clone().map(|tx| {
                let confirmation = Confirmation {
                    delivery_tag: channel.next_tag,
                    ack,
                };
                channel.next_tag += 1;
                (tx, confirmation)
            });
            match pending {
                Some(pending) if hold => {
                    state.held.push(pending);
                    None
                }
                other => other,
            }
        };

        // The confirmation reader may be the task calling us; never block on it.
        if let Some((tx, confirmation)) = confirmation {
            tokio::spawn(async move {
                let _ = tx.send(confirmation).await;
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.broker.state();
        state.channel(self.id)?;
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(MqError::Consume(format!("no queue `{queue}`")));
        };

        let (tx, rx) = feed::unbounded();
        q.feed_seq += 1;
        q.feeds.push(Feed {
            id: q.feed_seq,
            channel: self.id,
            tx,
            next_tag: 1,
        });
        let backlog: Vec<Stored> = q.messages.drain(..).collect();
        for stored in backlog {
            self.broker.deliver(&mut state, queue, stored);
        }

        Ok(rx.boxed())
    }

    fn notify_close(&self) -> oneshot::Receiver<MqError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.broker.state();
        match state.channel(self.id) {
            Ok(channel) => channel.close_listeners.push(tx),
            Err(err) => {
                let _ = tx.send(err);
            }
        }
        rx
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state();
        self.broker.shut_channel(&mut state, self.id, None);
        Ok(())
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    feed: u64,
    tag: u64,
}

impl MemoryAcker {
    /// Take this delivery out of the unsettled set. Fails once the delivery
    /// was settled or returned to the queue by a channel close.
    fn settle(&self, state: &mut State) -> Result<Stored> {
        state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&(self.feed, self.tag)))
            .map(|entry| entry.message)
            .ok_or_else(|| {
                MqError::ChannelClosed(format!("unknown delivery tag {}", self.tag))
            })
    }

    fn settle_negative(&self, requeue: bool) -> Result<()> {
        let mut state = self.broker.state();
        let message = self.settle(&mut state)?;
        if let Some(q) = state.queues.get_mut(&self.queue) {
            q.nacked += 1;
        }
        if requeue {
            let message = Stored {
                redelivered: true,
                ..message
            };
            self.broker.deliver(&mut state, &self.queue, message);
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.broker.state();
        self.settle(&mut state)?;
        if let Some(q) = state.queues.get_mut(&self.queue) {
            q.acked += 1;
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle_negative(requeue)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle_negative(requeue)
    }
}
