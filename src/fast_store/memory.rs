use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::FastStore;
use crate::clock::Clock;
use crate::error::{Result, ZartanError};

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(HashMap<String, String>),
    SortedSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

/// In-process `FastStore` with Redis semantics; expirations follow the given clock.
pub struct MemoryFastStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryFastStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn wrong_type(key: &str) -> ZartanError {
        ZartanError::Internal(format!(
            "WRONGTYPE operation against key {} holding the wrong kind of value",
            key
        ))
    }

    /// Run `f` against the live entries after purging anything expired
    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        f(&mut entries)
    }
}

fn hash_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>> {
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Hash(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Hash(h) => Ok(h),
        _ => Err(MemoryFastStore::wrong_type(key)),
    }
}

fn zset_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, f64>> {
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::SortedSet(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::SortedSet(z) => Ok(z),
        _ => Err(MemoryFastStore::wrong_type(key)),
    }
}

fn zset<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Result<Option<&'a HashMap<String, f64>>> {
    match entries.get(key).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::SortedSet(z)) => Ok(Some(z)),
        Some(_) => Err(MemoryFastStore::wrong_type(key)),
    }
}

fn sorted(z: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = z.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

/// Redis deletes collections once they become empty
fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
    let empty = match entries.get(key).map(|e| &e.value) {
        Some(Value::Hash(h)) => h.is_empty(),
        Some(Value::SortedSet(z)) => z.is_empty(),
        Some(Value::List(l)) => l.is_empty(),
        _ => false,
    };
    if empty {
        entries.remove(key);
    }
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.with_entries(|entries| {
            zset_mut(entries, key)?.insert(member.to_string(), score);
            Ok(())
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.with_entries(|entries| {
            if zset(entries, key)?.is_none() {
                return Ok(false);
            }
            let removed = zset_mut(entries, key)?.remove(member).is_some();
            drop_if_empty(entries, key);
            Ok(removed)
        })
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.with_entries(|entries| Ok(zset(entries, key)?.and_then(|z| z.get(member).copied())))
    }

    async fn zfirst(&self, key: &str) -> Result<Option<(String, f64)>> {
        self.with_entries(|entries| {
            Ok(zset(entries, key)?.and_then(|z| sorted(z).into_iter().next()))
        })
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.with_entries(|entries| Ok(zset(entries, key)?.map_or(0, |z| z.len() as u64)))
    }

    async fn zmembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_entries(|entries| {
            Ok(zset(entries, key)?
                .map(|z| sorted(z).into_iter().map(|(m, _)| m).collect())
                .unwrap_or_default())
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_entries(|entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(_) => Err(Self::wrong_type(key)),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            hash_mut(entries, key)?.insert(field.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.with_entries(|entries| {
            if !entries.contains_key(key) {
                return Ok(());
            }
            hash_mut(entries, key)?.remove(field);
            drop_if_empty(entries, key);
            Ok(())
        })
    }

    async fn hincr(&self, key: &str, field: &str, by: i64) -> Result<i64> {
        self.with_entries(|entries| {
            let hash = hash_mut(entries, key)?;
            let current = match hash.get(field) {
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    ZartanError::Internal(format!("hash value at {}.{} is not an integer", key, field))
                })?,
                None => 0,
            };
            let next = current + by;
            hash.insert(field.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let at = self.clock.now_millis() + ttl.as_millis() as i64;
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(at);
            }
            Ok(())
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.with_entries(|entries| Ok(entries.contains_key(key)))
    }

    async fn lpush_capped(&self, key: &str, value: &str, max_len: usize) -> Result<()> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(list) => {
                    list.push_front(value.to_string());
                    list.truncate(max_len.max(1));
                    Ok(())
                }
                _ => Err(Self::wrong_type(key)),
            }
        })
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        self.with_entries(|entries| match entries.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(Self::wrong_type(key)),
        })
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let at = self.clock.now_millis() + ttl.as_millis() as i64;
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::String(value.to_string()),
                    expires_at: Some(at),
                },
            );
            Ok(true)
        })
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        self.with_entries(|entries| {
            let matches = matches!(
                entries.get(key).map(|e| &e.value),
                Some(Value::String(current)) if current == value
            );
            if matches {
                entries.remove(key);
            }
            Ok(matches)
        })
    }
}
