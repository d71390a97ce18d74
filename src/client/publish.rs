//! Publish confirmation engine.
//!
//! Callers hand a [`PendingPublish`] to a bounded request queue and wait on
//! its completion slot. A single worker task owns the broker channel for
//! sends, the confirmation receiver and the [`DeliveryTagMap`]; nothing else
//! touches the map. The worker is started lazily by whichever caller flips
//! the `active` flag from 0 to 1.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at, sleep, timeout};

use crate::config::Tuning;
use crate::transport::{BrokerChannel, Confirmation};
use crate::utils::error::{MqError, Result};
use crate::utils::logging::{Field, LogContext, LogSink};
use crate::utils::shutdown::Shutdown;

/// One caller's publish, owned by the engine until resolved.
pub(crate) struct PendingPublish {
    pub ctx: LogContext,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub expiration: Duration,
    done: oneshot::Sender<Result<()>>,
}

impl PendingPublish {
    fn resolve(self, result: Result<()>) {
        // The caller may already have given up waiting.
        let _ = self.done.send(result);
    }

    fn fields(&self) -> Vec<Field> {
        vec![
            Field::new("exchange", &self.exchange),
            Field::new("routing_key", &self.routing_key),
        ]
    }
}

/// Where the worker learns the broker's verdict.
pub(crate) enum Confirms {
    Stream(mpsc::Receiver<Confirmation>),
    /// Confirm mode is off: a successful send is the final answer.
    Unconfirmed,
}

impl Confirms {
    async fn next(&mut self) -> Option<Confirmation> {
        match self {
            Confirms::Stream(rx) => rx.recv().await,
            Confirms::Unconfirmed => std::future::pending().await,
        }
    }
}

/// The channel plus confirmation source a worker runs against.
pub(crate) struct Link {
    pub channel: Arc<dyn BrokerChannel>,
    pub confirms: Confirms,
}

#[derive(Debug)]
pub(crate) struct InFlight<T> {
    pub sent_at: Instant,
    pub item: T,
}

/// Sent-but-unconfirmed publishes keyed by delivery tag.
///
/// Tags start at 1 and are handed out in insertion order, one per
/// successful send. Insertion times are non-decreasing in tag order.
#[derive(Debug)]
pub(crate) struct DeliveryTagMap<T> {
    entries: BTreeMap<u64, InFlight<T>>,
    next_tag: u64,
}

impl<T> DeliveryTagMap<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_tag: 1,
        }
    }

    /// Record `item` as sent at `sent_at`; returns its tag.
    pub fn insert(&mut self, sent_at: Instant, item: T) -> u64 {
        let tag = self.next_tag;
        self.entries.insert(tag, InFlight { sent_at, item });
        self.next_tag += 1;
        tag
    }

    pub fn take(&mut self, tag: u64) -> Option<InFlight<T>> {
        self.entries.remove(&tag)
    }

    /// Remove entries older than `timeout` at `now`, lowest tag first,
    /// stopping at the first entry still within its window.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(u64, InFlight<T>)> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if now.saturating_duration_since(entry.get().sent_at) <= timeout {
                break;
            }
            expired.push(entry.remove_entry());
        }
        expired
    }

    pub fn drain(&mut self) -> Vec<(u64, InFlight<T>)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn next_tag(&self) -> u64 {
        self.next_tag
    }
}

pub(crate) struct PublishEngine {
    requests: mpsc::Sender<PendingPublish>,
    queue: tokio::sync::Mutex<mpsc::Receiver<PendingPublish>>,
    active: AtomicU32,
    link: Mutex<Option<Link>>,
    publish_timeout: Duration,
    sweep_interval: Duration,
    log: Arc<dyn LogSink>,
}

enum Exit {
    Shutdown,
    ConfirmsClosed,
}

impl PublishEngine {
    pub fn new(tuning: &Tuning, log: Arc<dyn LogSink>) -> Self {
        let (requests, queue) = mpsc::channel(tuning.request_buffer);
        Self {
            requests,
            queue: tokio::sync::Mutex::new(queue),
            active: AtomicU32::new(0),
            link: Mutex::new(None),
            publish_timeout: tuning.publish_timeout,
            sweep_interval: tuning.sweep_interval,
            log,
        }
    }

    /// Hand a fresh channel to the next worker that starts.
    pub fn attach(&self, link: Link) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    pub fn detach(&self) {
        self.link.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn take_link(&self) -> Option<Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// A worker is running, or one could start with a valid channel.
    fn is_live(&self) -> bool {
        self.active.load(Ordering::Acquire) == 1
            || self
                .link
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    pub fn worker_active(&self) -> bool {
        self.active.load(Ordering::Acquire) == 1
    }

    fn ensure_worker(self: &Arc<Self>, shutdown: &Shutdown, ctx: &LogContext) {
        if self
            .active
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.log.debug(ctx, "publish worker started", &[]);
            tokio::spawn(Arc::clone(self).run(shutdown.clone(), ctx.clone()));
        }
    }

    /// Queue one publish and wait for its outcome.
    pub async fn submit(
        self: &Arc<Self>,
        shutdown: &Shutdown,
        ctx: &LogContext,
        exchange: &str,
        routing_key: &str,
        expiration: Duration,
        payload: Vec<u8>,
    ) -> Result<()> {
        if shutdown.is_triggered() || !self.is_live() {
            return Err(MqError::Cancelled);
        }
        self.ensure_worker(shutdown, ctx);

        let (done, outcome) = oneshot::channel();
        let request = PendingPublish {
            ctx: ctx.clone(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            expiration,
            done,
        };
        let fields = request.fields();

        tokio::select! {
            biased;
            _ = shutdown.wait() => return Err(MqError::Cancelled),
            sent = timeout(self.publish_timeout, self.requests.send(request)) => match sent {
                // A worker may have retired after the liveness check.
                Ok(Ok(())) => self.ensure_worker(shutdown, ctx),
                Ok(Err(_)) => return Err(MqError::Cancelled),
                Err(_) => {
                    self.log.warn(ctx, "publish queue full", &fields);
                    return Err(MqError::QueueFull);
                }
            },
        }

        tokio::select! {
            biased;
            result = outcome => result.unwrap_or(Err(MqError::Cancelled)),
            _ = shutdown.wait() => Err(MqError::Cancelled),
            _ = sleep(self.publish_timeout) => {
                self.log.warn(ctx, "publish timed out waiting for confirmation", &fields);
                Err(MqError::TimedOut)
            }
        }
    }

    async fn run(self: Arc<Self>, shutdown: Shutdown, ctx: LogContext) {
        let mut queue = self.queue.lock().await;

        if let Some(Link {
            channel,
            mut confirms,
        }) = self.take_link()
        {
            let unconfirmed = matches!(confirms, Confirms::Unconfirmed);
            let mut in_flight = DeliveryTagMap::new();
            let start = Instant::now() + self.sweep_interval;
            let mut sweep = interval_at(start, self.sweep_interval);

            let exit = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break Exit::Shutdown,
                    confirmation = confirms.next() => match confirmation {
                        Some(confirmation) => self.confirm(&ctx, &mut in_flight, confirmation),
                        None => break Exit::ConfirmsClosed,
                    },
                    Some(request) = queue.recv() => {
                        self.send(channel.as_ref(), unconfirmed, &mut in_flight, request).await;
                    }
                    _ = sweep.tick() => self.sweep(&mut in_flight),
                }
            };

            if let Exit::ConfirmsClosed = exit {
                self.log.error(
                    &ctx,
                    "confirmation stream closed",
                    &[Field::new("in_flight", in_flight.len())],
                );
            }
            for (_, entry) in in_flight.drain() {
                entry.item.resolve(Err(MqError::Cancelled));
            }
        }

        self.retire(&mut queue);
        drop(queue);
        self.log.debug(&ctx, "publish worker stopped", &[]);
    }

    /// Release the worker flag, then cancel everything still queued.
    ///
    /// Runs under the queue lock. A request enqueued after the drain finds
    /// the flag released and starts a new worker, which drains it in turn.
    fn retire(&self, queue: &mut mpsc::Receiver<PendingPublish>) {
        self.active.store(0, Ordering::Release);
        while let Ok(request) = queue.try_recv() {
            request.resolve(Err(MqError::Cancelled));
        }
    }

    async fn send(
        &self,
        channel: &dyn BrokerChannel,
        unconfirmed: bool,
        in_flight: &mut DeliveryTagMap<PendingPublish>,
        request: PendingPublish,
    ) {
        let sent_at = Instant::now();
        let sent = channel
            .publish(
                &request.exchange,
                &request.routing_key,
                &request.payload,
                request.expiration,
            )
            .await;

        match sent {
            Err(err) => {
                let mut fields = request.fields();
                fields.push(Field::new("error", &err));
                self.log.error(&request.ctx, "publish send failed", &fields);
                request.resolve(Err(err));
            }
            Ok(()) if unconfirmed => {
                self.log.debug(&request.ctx, "publish sent", &request.fields());
                request.resolve(Ok(()));
            }
            Ok(()) => {
                in_flight.insert(sent_at, request);
            }
        }
    }

    fn confirm(
        &self,
        ctx: &LogContext,
        in_flight: &mut DeliveryTagMap<PendingPublish>,
        confirmation: Confirmation,
    ) {
        let Some(entry) = in_flight.take(confirmation.delivery_tag) else {
            self.log.warn(
                ctx,
                "confirmation for unknown delivery tag",
                &[Field::new("delivery_tag", confirmation.delivery_tag)],
            );
            return;
        };

        let request = entry.item;
        let mut fields = request.fields();
        fields.push(Field::new("delivery_tag", confirmation.delivery_tag));
        if confirmation.ack {
            self.log.debug(&request.ctx, "publish acked", &fields);
            request.resolve(Ok(()));
        } else {
            self.log.warn(&request.ctx, "publish nacked", &fields);
            request.resolve(Err(MqError::Nacked));
        }
    }

    fn sweep(&self, in_flight: &mut DeliveryTagMap<PendingPublish>) {
        for (tag, entry) in in_flight.expire(Instant::now(), self.publish_timeout) {
            let request = entry.item;
            let mut fields = request.fields();
            fields.push(Field::new("delivery_tag", tag));
            self.log.warn(&request.ctx, "publish expired unconfirmed", &fields);
            request.resolve(Err(MqError::TimedOut));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::logging::RecordingSink;

    const TIMEOUT: Duration = Duration::from_secs(16);

    #[test]
    fn tags_start_at_one_and_never_repeat() {
        let now = Instant::now();
        let mut map = DeliveryTagMap::new();
        assert_eq!(map.next_tag(), 1);
        assert_eq!(map.insert(now, "a"), 1);
        assert_eq!(map.insert(now, "b"), 2);
        assert_eq!(map.take(1).map(|e| e.item), Some("a"));
        assert_eq!(map.insert(now, "c"), 3);
        assert!(map.take(1).is_none());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn expire_stops_at_first_fresh_entry() {
        let start = Instant::now();
        let mut map = DeliveryTagMap::new();
        map.insert(start, "old");
        map.insert(start + Duration::from_secs(1), "older-ish");
        map.insert(start + Duration::from_secs(10), "fresh");

        let now = start + TIMEOUT + Duration::from_secs(2);
        let expired: Vec<_> = map
            .expire(now, TIMEOUT)
            .into_iter()
            .map(|(tag, e)| (tag, e.item))
            .collect();
        assert_eq!(expired, vec![(1, "old"), (2, "older-ish")]);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn expire_skips_over_already_confirmed_tags() {
        let start = Instant::now();
        let mut map = DeliveryTagMap::new();
        map.insert(start, 1);
        map.insert(start, 2);
        map.insert(start, 3);
        map.take(2);

        let expired = map.expire(start + TIMEOUT * 2, TIMEOUT);
        let tags: Vec<u64> = expired.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(tags, vec![1, 3]);
    }

    #[test]
    fn entry_exactly_at_the_window_is_kept() {
        let start = Instant::now();
        let mut map = DeliveryTagMap::new();
        map.insert(start, ());

        assert!(map.expire(start + TIMEOUT, TIMEOUT).is_empty());
        assert_eq!(map.expire(start + TIMEOUT + Duration::from_millis(1), TIMEOUT).len(), 1);
    }

    #[test]
    fn sweep_bounds_hold_for_every_tick_phase() {
        let sweep = Duration::from_secs(8);
        let start = Instant::now();
        // An entry sent at any offset within a tick period is gone by
        // timeout + sweep and never before timeout.
        for offset_ms in [0u64, 1, 3_999, 7_999] {
            let mut map = DeliveryTagMap::new();
            let sent_at = start + Duration::from_millis(offset_ms);
            map.insert(sent_at, ());

            let mut tick = start + sweep;
            let mut expired_at = None;
            while expired_at.is_none() {
                if !map.expire(tick, TIMEOUT).is_empty() {
                    expired_at = Some(tick);
                }
                tick += sweep;
            }
            let age = expired_at.map(|at| at - sent_at).unwrap_or_default();
            assert!(age > TIMEOUT, "expired too early at age {age:?}");
            assert!(age <= TIMEOUT + sweep, "expired too late at age {age:?}");
        }
    }

    #[test]
    fn drain_empties_the_map() {
        let now = Instant::now();
        let mut map = DeliveryTagMap::new();
        map.insert(now, "a");
        map.insert(now, "b");
        assert_eq!(map.drain().len(), 2);
        assert_eq!(map.len(), 0);
        assert_eq!(map.next_tag(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn request_queued_behind_a_retiring_worker_is_cancelled() {
        let tuning = Tuning {
            request_buffer: 1,
            ..Tuning::default()
        };
        let engine = Arc::new(PublishEngine::new(&tuning, Arc::new(RecordingSink::new())));
        let shutdown = Shutdown::new();

        // A worker on its way out: flag still set, queue lock held, queue full.
        engine.active.store(1, Ordering::Release);
        let mut queue = engine.queue.lock().await;
        let (done, earlier) = oneshot::channel();
        let filler = PendingPublish {
            ctx: LogContext::new(),
            exchange: "ex".to_string(),
            routing_key: "key".to_string(),
            payload: b"earlier".to_vec(),
            expiration: Duration::from_secs(60),
            done,
        };
        assert!(engine.requests.try_send(filler).is_ok());

        let started = Instant::now();
        let late = {
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                engine
                    .submit(
                        &shutdown,
                        &LogContext::new(),
                        "ex",
                        "key",
                        Duration::from_secs(60),
                        b"late".to_vec(),
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;

        // The drain frees the slot the late request is blocked on.
        engine.retire(&mut queue);
        drop(queue);

        assert_eq!(earlier.await, Ok(Err(MqError::Cancelled)));
        assert_eq!(late.await.unwrap(), Err(MqError::Cancelled));
        assert!(started.elapsed() < tuning.publish_timeout);
        assert!(!engine.worker_active());
    }
}
