//! Recurring notification scheduling.
//!
//! One dispatcher task owns a priority queue keyed by fire time and a
//! command channel. Fires are spawned off the dispatcher so a slow
//! resolution never delays other subscriptions. Cancellation is lazy: the
//! registry entry is removed and the queued timer entry, stamped with a
//! stale generation, is discarded when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::core::notify::format_conversion;
use crate::core::resolve::QueryResolver;
use crate::store::{CallbackRegistry, JobStore, PersistedJobRecord, StoreError};

/// Callback name under which the conversion notifier is registered.
pub const CONVERSION_CALLBACK: &str = "conversion";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionPlan {
    pub key: &'static str,
    pub interval_seconds: u64,
}

/// The recognized plans. Fixed catalog, not runtime-extensible.
pub const SUBSCRIPTION_PLANS: [SubscriptionPlan; 3] = [
    SubscriptionPlan {
        key: "daily",
        interval_seconds: 86_400,
    },
    SubscriptionPlan {
        key: "weekly",
        interval_seconds: 604_800,
    },
    SubscriptionPlan {
        key: "monthly",
        interval_seconds: 2_592_000,
    },
];

fn plan_interval(key: &str) -> Option<u64> {
    SUBSCRIPTION_PLANS
        .iter()
        .find(|plan| plan.key == key)
        .map(|plan| plan.interval_seconds)
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("unknown subscription plan: '{0}'")]
    UnknownPlan(String),
    #[error("subscriber identity is required")]
    MissingSubscriber,
    #[error("no subscription found for subscriber '{0}'")]
    SubscriptionNotFound(String),
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscriber_id: String,
    pub chat_address: String,
    pub query: String,
    pub interval_seconds: u64,
    pub next_fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

struct ActiveEntry {
    generation: u64,
    callback_name: String,
    subscription: Subscription,
}

/// Queue entry. Ordered by fire time first so the derived lexicographic
/// order makes the wrapped `Reverse` heap a min-heap on deadlines.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    fire_at: DateTime<Utc>,
    subscriber_id: String,
    generation: u64,
}

enum TimerCommand {
    Arm(TimerEntry),
    Shutdown,
}

pub struct NotificationScheduler {
    resolver: Arc<QueryResolver>,
    store: Arc<dyn JobStore>,
    callbacks: Arc<CallbackRegistry>,
    registry: Mutex<HashMap<String, ActiveEntry>>,
    generations: AtomicU64,
    timer_tx: mpsc::UnboundedSender<TimerCommand>,
    timer_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TimerCommand>>>,
}

impl NotificationScheduler {
    pub fn new(
        resolver: Arc<QueryResolver>,
        store: Arc<dyn JobStore>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            resolver,
            store,
            callbacks,
            registry: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            timer_tx,
            timer_rx: std::sync::Mutex::new(Some(timer_rx)),
        }
    }

    /// Creates or replaces the subscription for a subscriber. The durable
    /// record is written before the subscription becomes active; a store
    /// failure surfaces and leaves no trace in memory.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        chat_address: &str,
        query: &str,
        plan_key: &str,
    ) -> Result<(), ScheduleError> {
        if subscriber_id.trim().is_empty() {
            return Err(ScheduleError::MissingSubscriber);
        }
        let interval_seconds = plan_interval(plan_key)
            .ok_or_else(|| ScheduleError::UnknownPlan(plan_key.to_string()))?;

        let now = Utc::now();
        let subscription = Subscription {
            subscriber_id: subscriber_id.to_string(),
            chat_address: chat_address.to_string(),
            query: query.to_string(),
            interval_seconds,
            next_fire_at: now + Duration::seconds(interval_seconds as i64),
            created_at: now,
        };
        self.activate(subscription, CONVERSION_CALLBACK.to_string())
            .await?;
        info!("Subscribed '{subscriber_id}' to '{query}' ({plan_key})");
        Ok(())
    }

    async fn activate(
        &self,
        subscription: Subscription,
        callback_name: String,
    ) -> Result<(), ScheduleError> {
        let record = record_of(&subscription, &callback_name);
        let mut registry = self.registry.lock().await;
        self.store.persist(&record).await?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let entry = TimerEntry {
            fire_at: subscription.next_fire_at,
            subscriber_id: subscription.subscriber_id.clone(),
            generation,
        };
        // Replaces any previous entry; its queued timers go stale with the
        // old generation and are discarded when they surface.
        registry.insert(
            subscription.subscriber_id.clone(),
            ActiveEntry {
                generation,
                callback_name,
                subscription,
            },
        );
        let _ = self.timer_tx.send(TimerCommand::Arm(entry));
        Ok(())
    }

    /// Cancels a subscriber's subscription. An in-flight fire completes;
    /// nothing fires afterwards.
    pub async fn unsubscribe(&self, subscriber_id: &str) -> Result<(), ScheduleError> {
        let mut registry = self.registry.lock().await;
        if !registry.contains_key(subscriber_id) {
            return Err(ScheduleError::SubscriptionNotFound(
                subscriber_id.to_string(),
            ));
        }
        // Durable state first: a failed delete surfaces and leaves the
        // subscription intact on both sides.
        self.store.delete(subscriber_id).await?;
        registry.remove(subscriber_id);
        info!("Unsubscribed '{subscriber_id}'");
        Ok(())
    }

    /// Rebuilds scheduler state from the durable store. Called once at
    /// startup, before any new subscription is accepted. A record whose
    /// fire time already passed fires once immediately, never once per
    /// missed interval.
    pub async fn rehydrate(&self) -> Result<usize, ScheduleError> {
        let records = self.store.load_all().await?;
        let now = Utc::now();
        let mut restored = 0;
        for record in records {
            if self.callbacks.get(&record.callback_name).is_none() {
                warn!(
                    "No callback '{}' registered for subscriber '{}'; leaving record in place",
                    record.callback_name, record.subscriber_id
                );
                continue;
            }
            let subscription = Subscription {
                subscriber_id: record.subscriber_id.clone(),
                chat_address: record.chat_address,
                query: record.query,
                interval_seconds: record.interval_seconds,
                next_fire_at: record.next_fire_at.max(now),
                created_at: now,
            };
            let mut registry = self.registry.lock().await;
            let generation = self.generations.fetch_add(1, Ordering::Relaxed);
            let entry = TimerEntry {
                fire_at: subscription.next_fire_at,
                subscriber_id: subscription.subscriber_id.clone(),
                generation,
            };
            registry.insert(
                subscription.subscriber_id.clone(),
                ActiveEntry {
                    generation,
                    callback_name: record.callback_name,
                    subscription,
                },
            );
            let _ = self.timer_tx.send(TimerCommand::Arm(entry));
            restored += 1;
        }
        info!("Rehydrated {restored} subscriptions");
        Ok(restored)
    }

    /// Stops the dispatcher loop. Spawned fires already in flight run to
    /// completion.
    pub fn shutdown(&self) {
        let _ = self.timer_tx.send(TimerCommand::Shutdown);
    }

    /// The dispatcher loop. Owns the timer queue; runs until `shutdown`.
    pub async fn run(self: Arc<Self>) {
        let Some(mut timer_rx) = self.timer_rx.lock().unwrap().take() else {
            warn!("Scheduler dispatcher already running");
            return;
        };

        let mut queue: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
        loop {
            let now = Utc::now();
            while queue
                .peek()
                .is_some_and(|Reverse(entry)| entry.fire_at <= now)
            {
                let Reverse(entry) = queue.pop().unwrap();
                if let Some(next) = self.dispatch(entry).await {
                    queue.push(Reverse(next));
                }
            }

            let sleep_for = queue
                .peek()
                .map(|Reverse(entry)| {
                    (entry.fire_at - Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO)
                })
                .unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                command = timer_rx.recv() => match command {
                    Some(TimerCommand::Arm(entry)) => queue.push(Reverse(entry)),
                    Some(TimerCommand::Shutdown) | None => break,
                },
                _ = tokio::time::sleep(sleep_for), if !queue.is_empty() => {}
            }
        }
        debug!("Scheduler dispatcher stopped");
    }

    /// Handles one due entry: discards it if stale, otherwise re-arms the
    /// next tick, persists the bookkeeping and spawns the fire.
    async fn dispatch(&self, entry: TimerEntry) -> Option<TimerEntry> {
        let mut registry = self.registry.lock().await;
        let active = match registry.get_mut(&entry.subscriber_id) {
            Some(active) if active.generation == entry.generation => active,
            _ => {
                debug!("Discarding stale timer for '{}'", entry.subscriber_id);
                return None;
            }
        };

        let interval = Duration::seconds(active.subscription.interval_seconds as i64);
        let next_fire_at = entry.fire_at + interval;
        active.subscription.next_fire_at = next_fire_at;
        let record = record_of(&active.subscription, &active.callback_name);
        let subscription = active.subscription.clone();
        let callback_name = active.callback_name.clone();

        // Tick bookkeeping, under the registry lock so a concurrent
        // unsubscribe cannot interleave its delete with this upsert. A
        // persistence hiccup here must not kill the subscription, unlike
        // failures in subscribe/unsubscribe.
        if let Err(e) = self.store.persist(&record).await {
            warn!(
                "Failed to persist tick for '{}': {e}",
                subscription.subscriber_id
            );
        }
        drop(registry);

        let resolver = Arc::clone(&self.resolver);
        let callbacks = Arc::clone(&self.callbacks);
        tokio::spawn(async move {
            fire(resolver, callbacks, subscription, callback_name).await;
        });

        Some(TimerEntry {
            fire_at: next_fire_at,
            subscriber_id: entry.subscriber_id,
            generation: entry.generation,
        })
    }
}

/// One scheduled re-evaluation-and-notify. Resolution failures are logged
/// and the tick skipped; the subscription stays alive.
async fn fire(
    resolver: Arc<QueryResolver>,
    callbacks: Arc<CallbackRegistry>,
    subscription: Subscription,
    callback_name: String,
) {
    debug!(
        "Firing subscription of '{}' for '{}'",
        subscription.subscriber_id, subscription.query
    );
    let conversions = match resolver.resolve(&subscription.query).await {
        Ok(conversions) => conversions,
        Err(e) => {
            warn!(
                "Skipping fire for '{}': resolution failed: {e}",
                subscription.subscriber_id
            );
            return;
        }
    };
    let Some(first) = conversions.first() else {
        warn!(
            "Skipping fire for '{}': no conversions resolved",
            subscription.subscriber_id
        );
        return;
    };
    let Some(notifier) = callbacks.get(&callback_name) else {
        warn!("Callback '{callback_name}' is not registered");
        return;
    };
    let message = format_conversion(first);
    if let Err(e) = notifier
        .send(&subscription.chat_address, &message, None)
        .await
    {
        warn!("Delivery to '{}' failed: {e}", subscription.chat_address);
    }
}

fn record_of(subscription: &Subscription, callback_name: &str) -> PersistedJobRecord {
    PersistedJobRecord {
        subscriber_id: subscription.subscriber_id.clone(),
        chat_address: subscription.chat_address.clone(),
        query: subscription.query.clone(),
        callback_name: callback_name.to_string(),
        interval_seconds: subscription.interval_seconds,
        next_fire_at: subscription.next_fire_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::currency::{Currency, CurrencyRate, RateError, RateSource};
    use crate::core::notify::{Notifier, NotifyError};
    use crate::core::rates::RateCache;
    use crate::store::memory::MemoryJobStore;
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use tokio::time::timeout;

    struct StaticSource;

    #[async_trait]
    impl RateSource for StaticSource {
        async fn fetch_rates(&self) -> Result<Vec<CurrencyRate>, RateError> {
            Ok(vec![CurrencyRate {
                currency: Currency {
                    name: "US Dollar".to_string(),
                    symbol: "USD".to_string(),
                    code: Some(840),
                },
                rate_to_rub: 90.0,
                as_of: Utc::now(),
            }])
        }
    }

    struct RecordingNotifier {
        deliveries: UnboundedSender<(String, String)>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            chat_address: &str,
            message: &str,
            _markup: Option<&str>,
        ) -> Result<(), NotifyError> {
            let _ = self
                .deliveries
                .send((chat_address.to_string(), message.to_string()));
            Ok(())
        }
    }

    struct Harness {
        scheduler: Arc<NotificationScheduler>,
        store: Arc<MemoryJobStore>,
        deliveries: UnboundedReceiver<(String, String)>,
    }

    fn harness() -> Harness {
        let rates = Arc::new(RateCache::new(
            Arc::new(StaticSource),
            Duration::hours(24),
        ));
        let resolver = Arc::new(QueryResolver::new(rates));
        let store = Arc::new(MemoryJobStore::new());
        let callbacks = Arc::new(CallbackRegistry::new());
        let (tx, deliveries) = unbounded_channel();
        callbacks.register(CONVERSION_CALLBACK, Arc::new(RecordingNotifier { deliveries: tx }));
        let scheduler = Arc::new(NotificationScheduler::new(
            resolver,
            store.clone() as Arc<dyn JobStore>,
            callbacks,
        ));
        Harness {
            scheduler,
            store,
            deliveries,
        }
    }

    /// Registers a subscription with an arbitrary interval, bypassing the
    /// plan catalog so tests can use sub-second fire times.
    async fn subscribe_in(
        scheduler: &NotificationScheduler,
        subscriber: &str,
        query: &str,
        fire_in_ms: i64,
        interval_seconds: u64,
    ) {
        let now = Utc::now();
        let subscription = Subscription {
            subscriber_id: subscriber.to_string(),
            chat_address: format!("chat:{subscriber}"),
            query: query.to_string(),
            interval_seconds,
            next_fire_at: now + Duration::milliseconds(fire_in_ms),
            created_at: now,
        };
        scheduler
            .activate(subscription, CONVERSION_CALLBACK.to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_plan_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.scheduler.subscribe("alice", "chat:1", "1 usd", "hourly").await,
            Err(ScheduleError::UnknownPlan(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_subscriber_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.scheduler.subscribe("  ", "chat:1", "1 usd", "daily").await,
            Err(ScheduleError::MissingSubscriber)
        ));
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_not_duplicates() {
        let h = harness();
        h.scheduler
            .subscribe("alice", "chat:1", "1 usd", "daily")
            .await
            .unwrap();
        h.scheduler
            .subscribe("alice", "chat:1", "2 usd", "weekly")
            .await
            .unwrap();

        let records = h.store.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].query, "2 usd");
        assert_eq!(records[0].interval_seconds, 604_800);

        h.scheduler.unsubscribe("alice").await.unwrap();
        assert!(h.store.load_all().await.unwrap().is_empty());
        assert!(matches!(
            h.scheduler.unsubscribe("alice").await,
            Err(ScheduleError::SubscriptionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces_and_registers_nothing() {
        let h = harness();
        h.store.fail_writes(true);
        assert!(matches!(
            h.scheduler.subscribe("alice", "chat:1", "1 usd", "daily").await,
            Err(ScheduleError::Persistence(_))
        ));
        h.store.fail_writes(false);
        // Nothing to unsubscribe: the failed subscribe left no trace.
        assert!(matches!(
            h.scheduler.unsubscribe("alice").await,
            Err(ScheduleError::SubscriptionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fire_resolves_and_notifies() {
        let mut h = harness();
        let runner = tokio::spawn(h.scheduler.clone().run());

        subscribe_in(&h.scheduler, "alice", "10*2 usd", 20, 3_600).await;

        let (chat, message) = timeout(StdDuration::from_secs(5), h.deliveries.recv())
            .await
            .expect("fire should deliver within the timeout")
            .unwrap();
        assert_eq!(chat, "chat:alice");
        assert_eq!(message, "20 USD = 1800.00 RUB (rate 90.0000)");

        h.scheduler.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_future_fires() {
        let mut h = harness();
        let runner = tokio::spawn(h.scheduler.clone().run());

        subscribe_in(&h.scheduler, "alice", "1 usd", 20, 1).await;

        timeout(StdDuration::from_secs(5), h.deliveries.recv())
            .await
            .expect("first fire should happen")
            .unwrap();

        h.scheduler.unsubscribe("alice").await.unwrap();
        // Drain anything already in flight, then expect silence.
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        while h.deliveries.try_recv().is_ok() {}
        tokio::time::sleep(StdDuration::from_millis(2_200)).await;
        assert!(h.deliveries.try_recv().is_err());

        h.scheduler.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_resolution_skips_tick_but_keeps_subscription() {
        let mut h = harness();
        let runner = tokio::spawn(h.scheduler.clone().run());

        // The query never resolves; the subscription must survive anyway.
        subscribe_in(&h.scheduler, "alice", "1 nonexistent", 20, 1).await;

        tokio::time::sleep(StdDuration::from_millis(500)).await;
        assert!(h.deliveries.try_recv().is_err());
        assert!(h.scheduler.unsubscribe("alice").await.is_ok());

        h.scheduler.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_rehydrated_past_due_job_fires_once_not_per_missed_interval() {
        let mut h = harness();

        // Three missed daily intervals behind.
        let record = PersistedJobRecord {
            subscriber_id: "alice".to_string(),
            chat_address: "chat:alice".to_string(),
            query: "1 usd".to_string(),
            callback_name: CONVERSION_CALLBACK.to_string(),
            interval_seconds: 86_400,
            next_fire_at: Utc::now() - Duration::days(3),
        };
        h.store.persist(&record).await.unwrap();

        assert_eq!(h.scheduler.rehydrate().await.unwrap(), 1);
        let runner = tokio::spawn(h.scheduler.clone().run());

        timeout(StdDuration::from_secs(5), h.deliveries.recv())
            .await
            .expect("catch-up fire should happen once")
            .unwrap();
        tokio::time::sleep(StdDuration::from_millis(500)).await;
        assert!(h.deliveries.try_recv().is_err(), "no burst catch-up fires");

        // The advanced fire time was persisted into the future.
        let records = h.store.load_all().await.unwrap();
        assert!(records[0].next_fire_at > Utc::now());

        h.scheduler.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_rehydrate_skips_unknown_callback_but_keeps_record() {
        let h = harness();
        let record = PersistedJobRecord {
            subscriber_id: "bob".to_string(),
            chat_address: "chat:bob".to_string(),
            query: "1 usd".to_string(),
            callback_name: "missing-callback".to_string(),
            interval_seconds: 86_400,
            next_fire_at: Utc::now(),
        };
        h.store.persist(&record).await.unwrap();

        assert_eq!(h.scheduler.rehydrate().await.unwrap(), 0);
        assert_eq!(h.store.load_all().await.unwrap().len(), 1);
    }
}
