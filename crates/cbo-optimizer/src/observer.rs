//! Synchronous publish/subscribe for optimization lifecycle events.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use cbo_types::{CboError, CboResult, Event};

use crate::optimizer::OptimizerState;
use crate::target_space::TargetSpace;

/// Read-only view of the optimizer handed to subscribers.
///
/// Subscribers can inspect every tag's history but never mutate it.
pub trait OptimizerView {
    /// Tags in construction order; the first one drives the search.
    fn tags(&self) -> &[String];

    fn space(&self, tag: &str) -> CboResult<&TargetSpace>;

    fn state(&self) -> OptimizerState;

    /// Model-based iterations completed in the current `maximize` run.
    fn iterations(&self) -> usize;

    /// Points still waiting in the probe queue.
    fn pending(&self) -> usize;

    fn primary_space(&self) -> CboResult<&TargetSpace> {
        let tag = self
            .tags()
            .first()
            .ok_or_else(|| CboError::Internal("optimizer has no tags".to_string()))?;
        self.space(tag)
    }
}

/// Receiver of lifecycle events.
pub trait Observer {
    /// Called synchronously for every event this observer is subscribed to.
    /// An error aborts the dispatch and propagates to the operation that
    /// triggered it.
    fn notify(&mut self, event: Event, optimizer: &dyn OptimizerView) -> CboResult<()>;
}

impl<F> Observer for F
where
    F: FnMut(Event, &dyn OptimizerView) -> CboResult<()>,
{
    fn notify(&mut self, event: Event, optimizer: &dyn OptimizerView) -> CboResult<()> {
        self(event, optimizer)
    }
}

/// Shared handle to an observer; one handle may be subscribed to several
/// events.
pub type SharedObserver = Arc<Mutex<dyn Observer + Send>>;

/// Wrap an observer so it can be subscribed and still inspected by the
/// caller.
pub fn shared<O: Observer + Send + 'static>(observer: O) -> Arc<Mutex<O>> {
    Arc::new(Mutex::new(observer))
}

/// Identity of a subscriber within one event's subscriber list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubscriberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Event bus keyed by `(event, subscriber id)`.
///
/// Subscribers are notified in subscription order. Re-subscribing an id
/// replaces its observer in place, keeping its original position.
pub struct EventBus {
    subscribers: BTreeMap<Event, Vec<(SubscriberId, SharedObserver)>>,
}

impl EventBus {
    /// Bus accepting exactly the given events.
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        Self {
            subscribers: events.into_iter().map(|e| (e, Vec::new())).collect(),
        }
    }

    /// Events this bus was configured with.
    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.subscribers.keys().copied()
    }

    pub fn subscribe(
        &mut self,
        event: Event,
        id: impl Into<SubscriberId>,
        observer: SharedObserver,
    ) -> CboResult<()> {
        let id = id.into();
        let list = self.subscribers_mut(event)?;
        match list.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = observer,
            None => list.push((id, observer)),
        }
        Ok(())
    }

    /// Remove a subscriber, returning its observer.
    pub fn unsubscribe(&mut self, event: Event, id: &SubscriberId) -> CboResult<SharedObserver> {
        let list = self.subscribers_mut(event)?;
        let position = list
            .iter()
            .position(|(existing, _)| existing == id)
            .ok_or_else(|| CboError::NotSubscribed {
                event: event.to_string(),
                subscriber: id.to_string(),
            })?;
        Ok(list.remove(position).1)
    }

    /// Subscriber ids for `event`, in notification order.
    pub fn subscribers(&self, event: Event) -> CboResult<Vec<&SubscriberId>> {
        self.subscribers
            .get(&event)
            .map(|list| list.iter().map(|(id, _)| id).collect())
            .ok_or_else(|| CboError::UnknownEvent {
                event: event.to_string(),
            })
    }

    pub fn is_subscribed(&self, event: Event, id: &SubscriberId) -> bool {
        self.subscribers
            .get(&event)
            .is_some_and(|list| list.iter().any(|(existing, _)| existing == id))
    }

    /// Notify every subscriber of `event`. The first failure is returned
    /// immediately and later subscribers are not called.
    ///
    /// Dispatching an event the bus was not configured with is a no-op.
    pub fn dispatch(&self, event: Event, source: &dyn OptimizerView) -> CboResult<()> {
        let Some(list) = self.subscribers.get(&event) else {
            trace!("event {} not configured, skipping dispatch", event);
            return Ok(());
        };
        for (id, observer) in list {
            trace!("dispatching {} to {}", event, id);
            observer.lock().notify(event, source)?;
        }
        Ok(())
    }

    fn subscribers_mut(
        &mut self,
        event: Event,
    ) -> CboResult<&mut Vec<(SubscriberId, SharedObserver)>> {
        self.subscribers
            .get_mut(&event)
            .ok_or_else(|| CboError::UnknownEvent {
                event: event.to_string(),
            })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Event::ALL)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (event, list) in &self.subscribers {
            let ids: Vec<&str> = list.iter().map(|(id, _)| id.as_str()).collect();
            map.entry(event, &ids);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullView {
        tags: Vec<String>,
    }

    impl OptimizerView for NullView {
        fn tags(&self) -> &[String] {
            &self.tags
        }

        fn space(&self, tag: &str) -> CboResult<&TargetSpace> {
            Err(CboError::UnknownTag { tag: tag.to_string() })
        }

        fn state(&self) -> OptimizerState {
            OptimizerState::Idle
        }

        fn iterations(&self) -> usize {
            0
        }

        fn pending(&self) -> usize {
            0
        }
    }

    fn view() -> NullView {
        NullView {
            tags: vec!["objective".to_string()],
        }
    }

    /// Appends its label to a shared log on every notification.
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Observer for Recorder {
        fn notify(&mut self, event: Event, _optimizer: &dyn OptimizerView) -> CboResult<()> {
            self.log.lock().push(format!("{}:{}", self.label, event));
            Ok(())
        }
    }

    fn recorder(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> SharedObserver {
        shared(Recorder {
            label,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn dispatch_follows_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::default();
        bus.subscribe(Event::OptimizationStep, "b", recorder("b", &log)).unwrap();
        bus.subscribe(Event::OptimizationStep, "a", recorder("a", &log)).unwrap();

        bus.dispatch(Event::OptimizationStep, &view()).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["b:optimization:step", "a:optimization:step"]
        );
    }

    #[test]
    fn resubscribe_replaces_callback_in_place() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::default();
        bus.subscribe(Event::OptimizationEnd, "first", recorder("old", &log)).unwrap();
        bus.subscribe(Event::OptimizationEnd, "second", recorder("second", &log)).unwrap();
        bus.subscribe(Event::OptimizationEnd, "first", recorder("new", &log)).unwrap();

        assert_eq!(bus.subscribers(Event::OptimizationEnd).unwrap().len(), 2);
        bus.dispatch(Event::OptimizationEnd, &view()).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["new:optimization:end", "second:optimization:end"]
        );
    }

    #[test]
    fn unsubscribe_unknown_subscriber_fails() {
        let mut bus = EventBus::default();
        let err = bus
            .unsubscribe(Event::OptimizationStart, &SubscriberId::new("ghost"))
            .err()
            .unwrap();
        assert!(matches!(err, CboError::NotSubscribed { .. }));
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::default();
        bus.subscribe(Event::OptimizationStart, "r", recorder("r", &log)).unwrap();
        bus.unsubscribe(Event::OptimizationStart, &"r".into()).unwrap();
        bus.dispatch(Event::OptimizationStart, &view()).unwrap();
        assert!(log.lock().is_empty());
        assert!(!bus.is_subscribed(Event::OptimizationStart, &"r".into()));
    }

    #[test]
    fn subscriber_failure_propagates_and_halts_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::default();
        let failing: SharedObserver = shared(|_event: Event, _view: &dyn OptimizerView| {
            Err(CboError::Subscriber {
                subscriber: "failing".to_string(),
                message: "disk full".to_string(),
            })
        });
        bus.subscribe(Event::OptimizationStep, "failing", failing).unwrap();
        bus.subscribe(Event::OptimizationStep, "after", recorder("after", &log)).unwrap();

        let err = bus.dispatch(Event::OptimizationStep, &view()).unwrap_err();
        assert!(matches!(err, CboError::Subscriber { .. }));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn restricted_event_set_rejects_other_subscriptions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new([Event::OptimizationStep]);
        let err = bus
            .subscribe(Event::OptimizationStart, "r", recorder("r", &log))
            .unwrap_err();
        assert!(matches!(err, CboError::UnknownEvent { .. }));

        // Unconfigured events dispatch to nobody.
        bus.dispatch(Event::OptimizationStart, &view()).unwrap();
        assert_eq!(bus.events().collect::<Vec<_>>(), vec![Event::OptimizationStep]);
    }

    #[test]
    fn one_observer_can_follow_several_events() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::default();
        let shared_recorder = recorder("r", &log);
        for event in Event::ALL {
            bus.subscribe(event, "r", Arc::clone(&shared_recorder)).unwrap();
        }
        for event in Event::ALL {
            bus.dispatch(event, &view()).unwrap();
        }
        assert_eq!(log.lock().len(), 3);
    }
}
