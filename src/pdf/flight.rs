//! Single-flight slot map shared by the document, page and image layers
//!
//! Each key is either absent, pending (one in-flight load owns a completion
//! cell that late callers attach to) or ready. All transitions happen under
//! one mutex, so "decide to load" and "mark pending" are a single step.
//!
//! A pending flight is executed by whichever thread claims it first: the
//! queued job that was enqueued for it, or a caller that needs the value
//! right now. Waiting therefore only ever happens on a flight some thread
//! is actively running.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use super::request::RenderFault;

pub type FlightResult<V> = Result<Arc<V>, RenderFault>;

/// Completion cell for one in-flight load
struct Flight<V: ?Sized> {
    /// Eviction epoch the load was started in
    epoch: u64,
    claimed: AtomicBool,
    result: Mutex<Option<FlightResult<V>>>,
    cv: Condvar,
}

impl<V: ?Sized> Flight<V> {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            claimed: AtomicBool::new(false),
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn settle(&self, result: FlightResult<V>) {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(result);
        }
        self.cv.notify_all();
    }
}

/// Handle onto an in-flight load
///
/// Cloning is cheap; every clone observes the same outcome.
pub struct Ticket<V: ?Sized>(Arc<Flight<V>>);

impl<V: ?Sized> Clone for Ticket<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V: ?Sized> std::fmt::Debug for Ticket<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("epoch", &self.0.epoch)
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<V: ?Sized> Ticket<V> {
    fn start(epoch: u64) -> Self {
        Self(Arc::new(Flight::new(epoch)))
    }

    /// Block until the load completes
    pub fn wait(&self) -> FlightResult<V> {
        let guard = self.0.result.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = self
            .0
            .cv
            .wait_while(guard, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .clone()
            .unwrap_or_else(|| Err(RenderFault::generic("flight woke without a result")))
    }

    /// Block up to `timeout`; `None` if the load is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FlightResult<V>> {
        let guard = self.0.result.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .0
            .cv
            .wait_timeout_while(guard, timeout, |slot| slot.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    /// Outcome if already settled, without blocking
    #[must_use]
    pub fn try_result(&self) -> Option<FlightResult<V>> {
        self.0
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.0
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Take the right to execute this flight; true for exactly one caller
    pub fn claim(&self) -> bool {
        !self.0.claimed.swap(true, Ordering::AcqRel)
    }

    fn same_flight(&self, flight: &Arc<Flight<V>>) -> bool {
        Arc::ptr_eq(&self.0, flight)
    }
}

/// Observable state of a key
pub enum SlotState<V: ?Sized> {
    Ready(Arc<V>),
    Pending(Ticket<V>),
    Absent,
}

impl<V: ?Sized> SlotState<V> {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Outcome of [`FlightMap::begin`]
pub enum Begin<V: ?Sized> {
    /// Value was cached
    Ready(Arc<V>),
    /// Another caller owns the load; attach to its ticket
    Joined(Ticket<V>),
    /// This caller owns the load and must complete it
    Started(Ticket<V>),
}

enum Slot<V: ?Sized> {
    Pending(Arc<Flight<V>>),
    Ready(Arc<V>),
}

enum Placement<V: ?Sized> {
    AlreadyReady(Arc<V>),
    Adopt,
    Stale,
}

struct Slots<K, V: ?Sized> {
    map: HashMap<K, Slot<V>>,
    epoch: u64,
}

/// Tri-state map with at most one in-flight load per key
pub struct FlightMap<K, V: ?Sized> {
    slots: Mutex<Slots<K, V>>,
}

impl<K, V> Default for FlightMap<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    V: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FlightMap<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    V: ?Sized,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                epoch: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<K, V>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached value, if ready
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        match self.lock().map.get(key) {
            Some(Slot::Ready(value)) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    #[must_use]
    pub fn state(&self, key: &K) -> SlotState<V> {
        match self.lock().map.get(key) {
            Some(Slot::Ready(value)) => SlotState::Ready(Arc::clone(value)),
            Some(Slot::Pending(flight)) => SlotState::Pending(Ticket(Arc::clone(flight))),
            None => SlotState::Absent,
        }
    }

    /// Look up `key`, marking it pending if absent
    pub fn begin(&self, key: &K) -> Begin<V> {
        let mut slots = self.lock();
        match slots.map.get(key) {
            Some(Slot::Ready(value)) => Begin::Ready(Arc::clone(value)),
            Some(Slot::Pending(flight)) => {
                debug!("Joining in-flight load for {key}");
                Begin::Joined(Ticket(Arc::clone(flight)))
            }
            None => {
                let ticket = Ticket::start(slots.epoch);
                slots
                    .map
                    .insert(key.clone(), Slot::Pending(Arc::clone(&ticket.0)));
                Begin::Started(ticket)
            }
        }
    }

    /// Start a load without consulting or touching the slot.
    ///
    /// Only for exercising completion ordering when single-flight is
    /// bypassed.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn begin_detached(&self) -> Ticket<V> {
        Ticket::start(self.lock().epoch)
    }

    /// Record the outcome of a load started with [`begin`](Self::begin).
    ///
    /// The first completion for a key wins; a later value for an already
    /// ready key is discarded and its waiters receive the cached value.
    /// Values from loads that straddled an eviction are handed to their
    /// waiters but never cached.
    pub fn complete(&self, key: &K, ticket: &Ticket<V>, outcome: FlightResult<V>) -> FlightResult<V> {
        let settled = {
            let mut slots = self.lock();
            let current_epoch = slots.epoch;
            match outcome {
                Ok(value) => {
                    let placement = match slots.map.get(key) {
                        Some(Slot::Ready(existing)) => Placement::AlreadyReady(Arc::clone(existing)),
                        Some(Slot::Pending(flight))
                            if ticket.same_flight(flight) || ticket.0.epoch == current_epoch =>
                        {
                            Placement::Adopt
                        }
                        _ => Placement::Stale,
                    };
                    match placement {
                        Placement::AlreadyReady(existing) => {
                            warn!("Discarding late completion for {key}");
                            Ok(existing)
                        }
                        Placement::Adopt => {
                            slots.map.insert(key.clone(), Slot::Ready(Arc::clone(&value)));
                            Ok(value)
                        }
                        Placement::Stale => {
                            debug!("Not caching {key}: evicted while loading");
                            Ok(value)
                        }
                    }
                }
                Err(fault) => {
                    let owns_slot = matches!(
                        slots.map.get(key),
                        Some(Slot::Pending(flight)) if ticket.same_flight(flight)
                    );
                    if owns_slot {
                        slots.map.remove(key);
                    }
                    Err(fault)
                }
            }
        };

        ticket.0.settle(settled.clone());
        settled
    }

    /// Return the cached value, or run `load` inline when this caller can
    /// claim the key's flight, otherwise wait for whoever runs it
    pub fn resolve<F>(&self, key: &K, load: F) -> FlightResult<V>
    where
        F: FnOnce() -> FlightResult<V>,
    {
        match self.begin(key) {
            Begin::Ready(value) => Ok(value),
            Begin::Joined(ticket) | Begin::Started(ticket) => {
                if ticket.claim() {
                    self.run(key, &ticket, load)
                } else {
                    ticket.wait()
                }
            }
        }
    }

    /// Run a queued flight if nobody has claimed it yet; `None` when
    /// another thread got there first
    ///
    /// A flight whose slot was evicted while it sat in the queue is not run:
    /// its waiters get a `Generic` fault instead, so a stale job cannot
    /// reload what the eviction just dropped.
    pub fn execute<F>(&self, key: &K, ticket: &Ticket<V>, load: F) -> Option<FlightResult<V>>
    where
        F: FnOnce() -> FlightResult<V>,
    {
        if !ticket.claim() {
            return None;
        }
        if !self.holds(key, ticket) {
            debug!("Dropping queued load for {key}: evicted before it ran");
            let evicted = Err(RenderFault::generic(format!("{key} was evicted before loading")));
            ticket.0.settle(evicted.clone());
            return Some(evicted);
        }
        Some(self.run(key, ticket, load))
    }

    /// Whether `key` is still pending on this ticket's flight
    fn holds(&self, key: &K, ticket: &Ticket<V>) -> bool {
        matches!(
            self.lock().map.get(key),
            Some(Slot::Pending(flight)) if ticket.same_flight(flight)
        )
    }

    fn run<F>(&self, key: &K, ticket: &Ticket<V>, load: F) -> FlightResult<V>
    where
        F: FnOnce() -> FlightResult<V>,
    {
        let outcome = catch_unwind(AssertUnwindSafe(load))
            .unwrap_or_else(|_| Err(RenderFault::generic(format!("loader for {key} panicked"))));
        self.complete(key, ticket, outcome)
    }

    /// Remove every slot whose key matches; pending loads keep running but
    /// their results will not be cached
    pub fn evict_where<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&K) -> bool,
    {
        let mut slots = self.lock();
        let before = slots.map.len();
        slots.map.retain(|key, _| !predicate(key));
        slots.epoch += 1;
        before - slots.map.len()
    }

    pub fn clear(&self) {
        let mut slots = self.lock();
        slots.map.clear();
        slots.epoch += 1;
    }

    /// Number of ready entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock()
            .map
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock()
            .map
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::super::request::FaultKind;
    use super::*;

    fn map() -> FlightMap<String, String> {
        FlightMap::new()
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    fn value(s: &str) -> FlightResult<String> {
        Ok(Arc::new(s.to_string()))
    }

    #[test]
    fn begin_marks_pending_then_joins() {
        let slots = map();
        let Begin::Started(owner) = slots.begin(&key("a")) else {
            panic!("first begin should start");
        };
        assert!(slots.state(&key("a")).is_pending());

        let Begin::Joined(joined) = slots.begin(&key("a")) else {
            panic!("second begin should join");
        };

        slots.complete(&key("a"), &owner, value("A")).unwrap();
        assert_eq!(*joined.wait().unwrap(), "A");
        assert!(matches!(slots.begin(&key("a")), Begin::Ready(_)));
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn failure_reverts_to_absent_and_reaches_waiters() {
        let slots = map();
        let Begin::Started(owner) = slots.begin(&key("a")) else {
            panic!("expected start");
        };
        let Begin::Joined(joined) = slots.begin(&key("a")) else {
            panic!("expected join");
        };

        let err = slots
            .complete(&key("a"), &owner, Err(RenderFault::decode("broken")))
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::Decode);
        assert!(joined.wait().is_err());
        assert!(slots.state(&key("a")).is_absent());
        assert!(matches!(slots.begin(&key("a")), Begin::Started(_)));
    }

    #[test]
    fn first_completion_wins_over_later_finisher() {
        let slots = map();
        let Begin::Started(first_started) = slots.begin(&key("a")) else {
            panic!("expected start");
        };
        let bypass = slots.begin_detached();

        // The bypassing load finishes first and is adopted.
        let adopted = slots.complete(&key("a"), &bypass, value("fast")).unwrap();
        assert_eq!(*adopted, "fast");

        // The earlier-started load finishes later and is discarded.
        let late = slots
            .complete(&key("a"), &first_started, value("slow"))
            .unwrap();
        assert_eq!(*late, "fast");
        assert_eq!(*slots.get(&key("a")).unwrap(), "fast");
        assert_eq!(*first_started.wait().unwrap(), "fast");
    }

    #[test]
    fn completion_after_eviction_is_not_cached() {
        let slots = map();
        let Begin::Started(stale) = slots.begin(&key("a")) else {
            panic!("expected start");
        };
        assert_eq!(slots.evict_where(|k| k == "a"), 1);

        let Begin::Started(fresh) = slots.begin(&key("a")) else {
            panic!("evicted key should start again");
        };

        assert_eq!(*slots.complete(&key("a"), &stale, value("old")).unwrap(), "old");
        assert!(slots.state(&key("a")).is_pending());

        slots.complete(&key("a"), &fresh, value("new")).unwrap();
        assert_eq!(*slots.get(&key("a")).unwrap(), "new");
    }

    #[test]
    fn resolve_runs_one_load_for_concurrent_callers() {
        let slots = Arc::new(map());
        let loads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slots = Arc::clone(&slots);
                let loads = Arc::clone(&loads);
                thread::spawn(move || {
                    slots.resolve(&key("a"), || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(30));
                        value("A")
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(*handle.join().unwrap().unwrap(), "A");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_loader_releases_waiters() {
        let slots = map();
        let result = slots.resolve(&key("a"), || panic!("boom"));
        assert!(result.is_err());
        assert!(slots.state(&key("a")).is_absent());
    }

    #[test]
    fn queued_flight_is_executed_once() {
        let slots = map();
        let Begin::Started(queued) = slots.begin(&key("a")) else {
            panic!("expected start");
        };

        // A caller needing the value claims the queued flight and runs it.
        assert_eq!(*slots.resolve(&key("a"), || value("inline")).unwrap(), "inline");

        // The job for it finds the flight already claimed.
        assert!(slots.execute(&key("a"), &queued, || value("job")).is_none());
        assert_eq!(*queued.wait().unwrap(), "inline");
    }

    #[test]
    fn queued_flight_evicted_before_running_is_dropped() {
        let slots = map();
        let Begin::Started(queued) = slots.begin(&key("a")) else {
            panic!("expected start");
        };
        slots.evict_where(|k| k == "a");

        let ran = AtomicUsize::new(0);
        let outcome = slots
            .execute(&key("a"), &queued, || {
                ran.fetch_add(1, Ordering::SeqCst);
                value("reloaded")
            })
            .unwrap();

        assert_eq!(outcome.unwrap_err().kind(), FaultKind::Generic);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(queued.wait().is_err());
        assert!(slots.state(&key("a")).is_absent());
    }

    #[test]
    fn queued_flight_survives_eviction_of_other_keys() {
        let slots = map();
        let Begin::Started(queued) = slots.begin(&key("a")) else {
            panic!("expected start");
        };
        slots.evict_where(|k| k == "b");

        let outcome = slots.execute(&key("a"), &queued, || value("A")).unwrap();
        assert_eq!(*outcome.unwrap(), "A");
        assert_eq!(*slots.get(&key("a")).unwrap(), "A");
    }

    #[test]
    fn wait_timeout_reports_still_running() {
        let slots = map();
        let Begin::Started(ticket) = slots.begin(&key("a")) else {
            panic!("expected start");
        };
        assert!(ticket.wait_timeout(Duration::from_millis(5)).is_none());
        slots.complete(&key("a"), &ticket, value("A")).unwrap();
        assert!(ticket.wait_timeout(Duration::from_millis(5)).is_some());
    }
}
