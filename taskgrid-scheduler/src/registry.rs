//! Known workers and the pool of idle ones.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;

use rand::seq::SliceRandom;
use rand::Rng;
use taskgrid_messages::Address;
use taskgrid_messages::Datum;
use tokio::sync::Semaphore;

/// Workers that have registered, with their announced metadata.
///
/// Workers are never removed; death handling is deliberately absent.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<Address, Datum>,
}

impl WorkerRegistry {
    pub fn add(
        &mut self,
        address: Address,
        metadata: Datum,
    ) {
        self.workers.insert(address, metadata);
    }

    pub fn contains(
        &self,
        address: &str,
    ) -> bool {
        self.workers.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Addresses of all known workers, in stable (sorted) order.
    pub fn snapshot(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.workers.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn choose<R: Rng>(
        &self,
        rng: &mut R,
    ) -> Option<Address> {
        self.snapshot().choose(rng).cloned()
    }
}

struct IdleQueue {
    queue: VecDeque<Address>,
    members: HashSet<Address>,
}

/// Strictly FIFO pool of idle workers.
///
/// A worker is in the pool at most once. `take` suspends until a worker is
/// available; the longest-idle worker is handed out first.
pub struct IdlePool {
    inner: Mutex<IdleQueue>,
    ready: Semaphore,
}

impl Default for IdlePool {
    fn default() -> Self {
        Self {
            inner: Mutex::new(IdleQueue {
                queue: VecDeque::new(),
                members: HashSet::new(),
            }),
            ready: Semaphore::new(0),
        }
    }
}

impl IdlePool {
    pub fn put(
        &self,
        worker: Address,
    ) {
        let mut inner = self.inner.lock().expect("idle pool poisoned");
        if inner.members.insert(worker.clone()) {
            inner.queue.push_back(worker);
            self.ready.add_permits(1);
        }
    }

    pub async fn take(&self) -> Address {
        let permit = self
            .ready
            .acquire()
            .await
            .expect("idle pool semaphore closed");
        permit.forget();
        let mut inner = self.inner.lock().expect("idle pool poisoned");
        let worker = inner
            .queue
            .pop_front()
            .expect("a permit implies a queued worker");
        inner.members.remove(&worker);
        worker
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock().expect("idle pool poisoned").queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_is_fifo() {
        let pool = IdlePool::default();
        pool.put("tcp://a:1".to_string());
        pool.put("tcp://b:2".to_string());
        pool.put("tcp://c:3".to_string());
        assert_eq!(pool.take().await, "tcp://a:1");
        assert_eq!(pool.take().await, "tcp://b:2");
        assert_eq!(pool.take().await, "tcp://c:3");
    }

    #[tokio::test]
    async fn duplicate_put_is_ignored() {
        let pool = IdlePool::default();
        pool.put("tcp://a:1".to_string());
        pool.put("tcp://a:1".to_string());
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.take().await, "tcp://a:1");
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn take_waits_for_a_put() {
        let pool = std::sync::Arc::new(IdlePool::default());
        let taker = {
            let pool = std::sync::Arc::clone(&pool);
            tokio::spawn(async move { pool.take().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!taker.is_finished());
        pool.put("tcp://a:1".to_string());
        assert_eq!(taker.await.unwrap(), "tcp://a:1");
    }

    #[test]
    fn registry_random_choice_is_among_members() {
        let mut registry = WorkerRegistry::default();
        assert!(registry.choose(&mut rand::thread_rng()).is_none());
        registry.add("tcp://a:1".to_string(), Datum::Null);
        registry.add("tcp://b:2".to_string(), Datum::Null);
        let choice = registry.choose(&mut rand::thread_rng()).unwrap();
        assert!(registry.contains(&choice));
    }
}
