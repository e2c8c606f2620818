//! Mutable scheduling state for one task graph.
//!
//! The coordinator owns the sockets and the data plane; this crate owns the
//! bookkeeping of which keys are waiting, ready, running, or retired, and of
//! when an intermediate value stops being needed. It is pure data
//! manipulation, mutated only under the coordinator's lock discipline.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use taskgrid_messages::Datum;
use taskgrid_messages::Graph;
use taskgrid_messages::KeySpec;
use taskgrid_messages::Term;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    /// A term references a key the graph does not define.
    #[error("key {key} references undefined key {dependency}")]
    UnknownKey { key: String, dependency: String },

    /// A requested key is absent from the gathered values.
    #[error("no value for requested key {key}")]
    MissingValue { key: String },
}

/// Scheduling state of one run.
///
/// Every key of the graph is in exactly one of `waiting` / `ready` /
/// `running` / retired, where retired is `finished ∪ released`. Literal keys
/// start out finished: their values exist as soon as the cache is scattered.
#[derive(Debug, Default)]
pub struct State {
    /// Static: key → keys its term reads.
    pub dependencies: BTreeMap<String, BTreeSet<String>>,

    /// Static: key → keys whose terms read it.
    pub dependents: BTreeMap<String, BTreeSet<String>>,

    /// Key → its not-yet-finished dependencies. Emptied entries move the key
    /// to `ready`.
    pub waiting: BTreeMap<String, BTreeSet<String>>,

    /// Key → dependents that still need its value. When an entry empties and
    /// the key is not requested, the value can be released.
    pub waiting_data: BTreeMap<String, BTreeSet<String>>,

    ready: VecDeque<String>,
    ready_set: BTreeSet<String>,

    pub running: BTreeSet<String>,
    pub finished: BTreeSet<String>,
    pub released: BTreeSet<String>,
}

impl State {
    /// Pops the next ready key, in deterministic (sorted-insertion) order.
    pub fn pop_ready(&mut self) -> Option<String> {
        let key = self.ready.pop_front()?;
        self.ready_set.remove(&key);
        Some(key)
    }

    pub fn push_ready(
        &mut self,
        key: String,
    ) {
        if self.ready_set.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn is_ready(
        &self,
        key: &str,
    ) -> bool {
        self.ready_set.contains(key)
    }

    /// True while any key still has to run or finish.
    pub fn has_pending(&self) -> bool {
        !self.waiting.is_empty() || !self.ready.is_empty() || !self.running.is_empty()
    }

    /// Retires a key whose value is no longer needed on the workers.
    pub fn release(
        &mut self,
        key: &str,
    ) {
        self.waiting_data.remove(key);
        self.finished.remove(key);
        self.released.insert(key.to_string());
    }
}

/// Partitions a graph into initial scheduling state and the literal cache.
///
/// Literal terms land in the returned cache (to be scattered to workers) and
/// start out finished. Task keys with all-literal dependencies are
/// immediately ready; the rest wait.
pub fn initial_state(graph: &Graph) -> Result<(State, BTreeMap<String, Datum>), GraphError> {
    let mut cache = BTreeMap::new();
    let mut state = State::default();

    for (key, term) in graph {
        if let Term::Literal(value) = term {
            cache.insert(key.clone(), value.clone());
        }
        state.dependents.entry(key.clone()).or_default();
    }

    for (key, term) in graph {
        let deps = term.dependencies();
        for dep in &deps {
            if !graph.contains_key(dep) {
                return Err(GraphError::UnknownKey {
                    key: key.clone(),
                    dependency: dep.clone(),
                });
            }
            state
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(key.clone());
        }
        state.dependencies.insert(key.clone(), deps);
    }

    for key in graph.keys() {
        state
            .waiting_data
            .insert(key.clone(), state.dependents[key].clone());
    }

    for (key, term) in graph {
        if matches!(term, Term::Literal(_)) {
            state.finished.insert(key.clone());
            continue;
        }
        let unmet: BTreeSet<String> = state.dependencies[key]
            .iter()
            .filter(|dep| !cache.contains_key(*dep))
            .cloned()
            .collect();
        if unmet.is_empty() {
            state.push_ready(key.clone());
        } else {
            state.waiting.insert(key.clone(), unmet);
        }
    }

    Ok((state, cache))
}

/// Applies one completion: moves `key` out of `running`, promotes dependents
/// whose last unmet dependency this was, and invokes `release_data` for every
/// input key that no longer has pending dependents and is not requested.
pub fn finish_task(
    state: &mut State,
    key: &str,
    requested: &BTreeSet<String>,
    mut release_data: impl FnMut(&str, &mut State),
) {
    let dependents = state.dependents.get(key).cloned().unwrap_or_default();
    for dependent in dependents {
        if let Some(unmet) = state.waiting.get_mut(&dependent) {
            unmet.remove(key);
            if unmet.is_empty() {
                state.waiting.remove(&dependent);
                state.push_ready(dependent);
            }
        }
    }

    let mut releasable = Vec::new();
    let dependencies = state.dependencies.get(key).cloned().unwrap_or_default();
    for dep in dependencies {
        if let Some(waiters) = state.waiting_data.get_mut(&dep) {
            waiters.remove(key);
            if waiters.is_empty() && !requested.contains(&dep) {
                releasable.push(dep);
            }
        }
    }
    for dep in releasable {
        release_data(&dep, state);
    }

    state.running.remove(key);
    state.finished.insert(key.to_string());
}

/// Rebuilds the caller's nested request shape from gathered values.
pub fn reshape(
    spec: &KeySpec,
    values: &BTreeMap<String, Datum>,
) -> Result<Datum, GraphError> {
    match spec {
        KeySpec::One(key) => {
            values
                .get(key)
                .cloned()
                .ok_or_else(|| GraphError::MissingValue { key: key.clone() })
        },
        KeySpec::Many(specs) => {
            let shaped = specs
                .iter()
                .map(|spec| reshape(spec, values))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Datum::List(shaped))
        },
    }
}
