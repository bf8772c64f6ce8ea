// crates/store/src/memory.rs
//! In-process `StateStore` backed by a mutex-guarded map.
//!
//! Expiry is lazy: an expired key is dropped the next time it is touched.
//! Deadlines use `tokio::time::Instant`, so tests can pause and advance time.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use globset::Glob;
use tokio::time::Instant;

use crate::{resolve_range, StateStore, StoreError, StoreResult};

enum Value {
    Str(String),
    List(Vec<String>),
    SortedSet(HashMap<String, f64>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `StateStore` that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drop `key` if it has expired, then return the live entry.
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType { key: key.to_string() }
}

/// Sorted-set members ordered by ascending score, ties broken by member.
fn sorted_members(set: &HashMap<String, f64>) -> Vec<(&String, f64)> {
    let mut members: Vec<(&String, f64)> = set.iter().map(|(m, s)| (m, *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    members
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut map = self.lock();
        match live(&mut map, key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let mut map = self.lock();
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = map.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut map = self.lock();
        if live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::List(Vec::new()),
                    expires_at: None,
                },
            );
        }
        match map.get_mut(key) {
            Some(Entry { value: Value::List(items), .. }) => {
                items.push(value.to_string());
                Ok(items.len() as u64)
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut map = self.lock();
        match live(&mut map, key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::List(items), .. }) => Ok(resolve_range(items.len(), start, stop)
                .map(|(from, to)| items[from..=to].to_vec())
                .unwrap_or_default()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut map = self.lock();
        match live(&mut map, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut map = self.lock();
        if live(&mut map, key).is_none() {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::SortedSet(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match map.get_mut(key) {
            Some(Entry { value: Value::SortedSet(set), .. }) => {
                set.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut map = self.lock();
        match live(&mut map, key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::SortedSet(set), .. }) => {
                let mut members = sorted_members(set);
                members.reverse();
                Ok(resolve_range(members.len(), start, stop)
                    .map(|(from, to)| members[from..=to].iter().map(|(m, _)| (*m).clone()).collect())
                    .unwrap_or_default())
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>> {
        let mut map = self.lock();
        match live(&mut map, key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::SortedSet(set), .. }) => Ok(sorted_members(set)
                .into_iter()
                .filter(|(_, score)| *score >= min && *score <= max)
                .map(|(m, _)| m.clone())
                .collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut map = self.lock();
        match live(&mut map, key) {
            None => Ok(0),
            Some(Entry { value: Value::SortedSet(set), .. }) => {
                let before = set.len();
                set.retain(|_, score| *score < min || *score > max);
                Ok((before - set.len()) as u64)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn delete_matching(&self, pattern: &str) -> StoreResult<u64> {
        let matcher = Glob::new(pattern)?.compile_matcher();
        let mut map = self.lock();
        let now = Instant::now();
        let before = map.len();
        let mut expired = 0;
        map.retain(|key, entry| {
            let matches = matcher.is_match(key);
            if matches && entry.is_expired(now) {
                expired += 1;
            }
            !matches
        });
        Ok((before - map.len() - expired) as u64)
    }
}
