// src/timer.rs - Single logical timer queue
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Priority queue of `(deadline, token)` pairs.
///
/// One queue replaces per-timeout timer objects: the owner (dispatcher or
/// scheduler loop) asks for the next deadline, sleeps until then and pops
/// the due tokens. Each token is scheduled at most once; scheduling it again
/// moves its deadline.
#[derive(Debug, Clone)]
pub struct TimerQueue<T> {
    entries: BTreeMap<(DateTime<Utc>, u64), T>,
    index: HashMap<T, (DateTime<Utc>, u64)>,
    counter: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            counter: 0,
        }
    }
}

impl<T: Clone + Eq + Hash> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: DateTime<Utc>, token: T) {
        self.cancel(&token);
        self.counter += 1;
        let key = (deadline, self.counter);
        self.entries.insert(key, token.clone());
        self.index.insert(token, key);
    }

    /// Returns true if the token was pending
    pub fn cancel(&mut self, token: &T) -> bool {
        match self.index.remove(token) {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, token: &T) -> bool {
        self.index.contains_key(token)
    }

    pub fn deadline_of(&self, token: &T) -> Option<DateTime<Utc>> {
        self.index.get(token).map(|(deadline, _)| *deadline)
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every token whose deadline is at or before `now`,
    /// earliest first
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let token = entry.remove();
            self.index.remove(&token);
            due.push(token);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
