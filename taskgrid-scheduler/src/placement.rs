//! Where the data lives: key↔worker placement index.

use std::collections::HashMap;
use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use taskgrid_messages::Address;
use taskgrid_messages::Key;

/// Bidirectional index of which worker holds which key.
///
/// Both directions are mutated together, always under the coordinator's state
/// lock, so `w ∈ holders[k] ⇔ k ∈ held[w]` at every observation point.
#[derive(Default)]
pub struct PlacementIndex {
    holders: HashMap<Key, HashSet<Address>>,
    held: HashMap<Address, HashSet<Key>>,
}

impl PlacementIndex {
    pub fn record(
        &mut self,
        key: &str,
        worker: &str,
    ) {
        self.holders
            .entry(key.to_string())
            .or_default()
            .insert(worker.to_string());
        self.held
            .entry(worker.to_string())
            .or_default()
            .insert(key.to_string());
    }

    pub fn forget(
        &mut self,
        key: &str,
        worker: &str,
    ) {
        if let Some(workers) = self.holders.get_mut(key) {
            workers.remove(worker);
            if workers.is_empty() {
                self.holders.remove(key);
            }
        }
        if let Some(keys) = self.held.get_mut(worker) {
            keys.remove(key);
            if keys.is_empty() {
                self.held.remove(worker);
            }
        }
    }

    /// Snapshot of the workers holding `key`, in stable (sorted) order.
    pub fn holders_of(
        &self,
        key: &str,
    ) -> Vec<Address> {
        let mut workers: Vec<Address> = self
            .holders
            .get(key)
            .map(|workers| workers.iter().cloned().collect())
            .unwrap_or_default();
        workers.sort();
        workers
    }

    pub fn pick_holder<R: Rng>(
        &self,
        key: &str,
        rng: &mut R,
    ) -> Option<Address> {
        self.holders_of(key).choose(rng).cloned()
    }

    pub fn keys_held_by(
        &self,
        worker: &str,
    ) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .held
            .get(worker)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward = self.holders.iter().all(|(key, workers)| {
            workers
                .iter()
                .all(|worker| self.held.get(worker).is_some_and(|keys| keys.contains(key)))
        });
        let backward = self.held.iter().all(|(worker, keys)| {
            keys.iter().all(|key| {
                self.holders
                    .get(key)
                    .is_some_and(|workers| workers.contains(worker))
            })
        });
        forward && backward
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_forget_keep_both_directions() {
        let mut index = PlacementIndex::default();
        index.record("x", "tcp://a:1");
        index.record("x", "tcp://b:2");
        index.record("y", "tcp://a:1");
        assert!(index.is_consistent());
        assert_eq!(index.holders_of("x"), vec!["tcp://a:1", "tcp://b:2"]);
        assert_eq!(index.keys_held_by("tcp://a:1"), vec!["x", "y"]);

        index.forget("x", "tcp://a:1");
        assert!(index.is_consistent());
        assert_eq!(index.holders_of("x"), vec!["tcp://b:2"]);
        assert_eq!(index.keys_held_by("tcp://a:1"), vec!["y"]);
    }

    #[test]
    fn forget_is_idempotent() {
        let mut index = PlacementIndex::default();
        index.record("x", "tcp://a:1");
        index.forget("x", "tcp://a:1");
        index.forget("x", "tcp://a:1");
        assert!(index.is_consistent());
        assert!(index.holders_of("x").is_empty());
        assert!(index.pick_holder("x", &mut rand::thread_rng()).is_none());
    }

    #[test]
    fn pick_holder_returns_a_real_holder() {
        let mut index = PlacementIndex::default();
        index.record("x", "tcp://a:1");
        index.record("x", "tcp://b:2");
        let holder = index.pick_holder("x", &mut rand::thread_rng()).unwrap();
        assert!(index.holders_of("x").contains(&holder));
    }
}
