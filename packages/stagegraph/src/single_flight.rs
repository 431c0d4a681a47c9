//! Keyed at-most-once execution
//!
//! The first caller for a key runs the work; every other caller for that key,
//! concurrent or later, waits for and receives a clone of the same outcome.
//!
//! State per key lives in one table guarded by a short-held mutex. The lock is
//! never held across an `.await`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use thiserror::Error;
use tokio::sync::watch;

/// The task running the work for a key was dropped before publishing an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("in-flight work was abandoned")]
pub struct Abandoned;

enum Slot<V> {
    Running(watch::Receiver<Option<V>>),
    Done(V),
}

/// Observable state of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlightStatus<V> {
    Vacant,
    Running,
    Done(V),
}

pub struct SingleFlight<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
}

enum Claim<V> {
    Leader(watch::Sender<Option<V>>),
    Wait(watch::Receiver<Option<V>>),
    Ready(V),
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key` unless it has been claimed already
    ///
    /// `work` is only invoked by the claiming caller.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<V, Abandoned>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        match self.claim(&key) {
            Claim::Ready(v) => Ok(v),
            Claim::Wait(mut rx) => {
                let outcome = rx.wait_for(Option::is_some).await.map_err(|_| Abandoned)?;
                outcome.as_ref().cloned().ok_or(Abandoned)
            }
            Claim::Leader(tx) => {
                let value = work().await;
                self.slots.lock().insert(key, Slot::Done(value.clone()));
                tx.send_replace(Some(value.clone()));
                Ok(value)
            }
        }
    }

    fn claim(&self, key: &K) -> Claim<V> {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Done(v)) => Claim::Ready(v.clone()),
            Some(Slot::Running(rx)) => Claim::Wait(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(None);
                slots.insert(key.clone(), Slot::Running(rx));
                Claim::Leader(tx)
            }
        }
    }

    pub fn status(&self, key: &K) -> FlightStatus<V> {
        match self.slots.lock().get(key) {
            None => FlightStatus::Vacant,
            Some(Slot::Running(_)) => FlightStatus::Running,
            Some(Slot::Done(v)) => FlightStatus::Done(v.clone()),
        }
    }

    /// Keys that have been claimed so far
    pub fn keys(&self) -> Vec<K> {
        self.slots.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_run_once() {
        let flights = Arc::new(SingleFlight::<u32, String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flights = flights.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                flights
                    .run(7, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        "image-7".to_string()
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), Ok("image-7".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(flights.status(&7), FlightStatus::Done("image-7".to_string()));
    }

    #[test]
    fn test_later_caller_gets_cached_value() {
        let flights = SingleFlight::<&str, u64>::new();

        let first = tokio_test::block_on(flights.run("a", || async { 1 }));
        let second = tokio_test::block_on(flights.run("a", || async { 2 }));

        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(1));
        assert_eq!(flights.len(), 1);
    }

    #[test]
    fn test_distinct_keys_are_independent() {
        let flights = SingleFlight::<u8, u8>::new();
        assert_eq!(flights.status(&1), FlightStatus::Vacant);

        tokio_test::block_on(async {
            assert_eq!(flights.run(1, || async { 10 }).await, Ok(10));
            assert_eq!(flights.run(2, || async { 20 }).await, Ok(20));
        });

        let mut keys = flights.keys();
        keys.sort();
        assert_eq!(keys, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_abandoned_leader_releases_waiters() {
        let flights = Arc::new(SingleFlight::<u8, u8>::new());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let leader = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run(1, || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<u8>().await
                    })
                    .await
            })
        };
        started_rx.await.unwrap();
        assert_eq!(flights.status(&1), FlightStatus::Running);

        let waiter = {
            let flights = flights.clone();
            tokio::spawn(async move { flights.run(1, || async { 99 }).await })
        };
        tokio::task::yield_now().await;
        leader.abort();

        assert_eq!(waiter.await.unwrap(), Err(Abandoned));
        // Callers arriving afterwards see the same outcome
        assert_eq!(flights.run(1, || async { 5 }).await, Err(Abandoned));
    }
}
