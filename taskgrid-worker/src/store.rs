//! Local key→value storage, shared between the serving loops.

use std::collections::HashMap;
use std::sync::Mutex;

use taskgrid_messages::Datum;
use taskgrid_messages::Key;

#[derive(Default)]
pub struct Store {
    data: Mutex<HashMap<Key, Datum>>,
}

impl Store {
    pub fn put(
        &self,
        key: Key,
        value: Datum,
    ) {
        self.data.lock().expect("store poisoned").insert(key, value);
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Option<Datum> {
        self.data.lock().expect("store poisoned").get(key).cloned()
    }

    pub fn remove(
        &self,
        key: &str,
    ) -> Option<Datum> {
        self.data.lock().expect("store poisoned").remove(key)
    }

    pub fn contains(
        &self,
        key: &str,
    ) -> bool {
        self.data.lock().expect("store poisoned").contains_key(key)
    }

    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .data
            .lock()
            .expect("store poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
