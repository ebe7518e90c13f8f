use {
    crate::{
        error::Error,
        store::{Action, ChangeEvent, Precondition, VersionedStore, VersionedValue},
        Version,
    },
    std::{
        collections::{BTreeMap, VecDeque},
        sync::{Arc, Weak},
        time::Duration,
    },
    tokio::sync::{broadcast, broadcast::error::RecvError, Mutex},
    tracing::trace,
};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: Vec<u8>,
    version: Version,
}

struct State {
    ///
    /// Store-wide counter, bumped on every mutation of any key.
    ///
    index: Version,
    entries: BTreeMap<String, Entry>,
    history: VecDeque<ChangeEvent>,
    history_capacity: usize,
    ///
    /// Version of the newest event dropped from `history`, watchers resuming before it must resync.
    ///
    evicted_through: Version,
}

impl State {
    fn current(&self, key: &str) -> Option<VersionedValue> {
        self.entries.get(key).map(|entry| VersionedValue {
            key: key.to_string(),
            value: entry.value.clone(),
            version: entry.version,
        })
    }

    fn record(&mut self, key: &str, action: Action, value: Option<Vec<u8>>) -> ChangeEvent {
        self.index += 1;
        let version = self.index;
        let kv = match value {
            Some(value) => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.clone(),
                        version,
                    },
                );
                Some(VersionedValue {
                    key: key.to_string(),
                    value,
                    version,
                })
            }
            None => {
                self.entries.remove(key);
                None
            }
        };
        let event = ChangeEvent {
            action,
            key: key.to_string(),
            value: kv,
            version,
        };
        if self.history.len() >= self.history_capacity {
            if let Some(evicted) = self.history.pop_front() {
                self.evicted_through = evicted.version;
            }
        }
        self.history.push_back(event.clone());
        event
    }
}

struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Shared {
    fn publish(&self, event: ChangeEvent) {
        trace!(
            "{:?} {} at version {}",
            event.action,
            event.key,
            event.version
        );
        // No receiver simply means nobody is watching.
        let _ = self.events.send(event);
    }
}

///
/// In-process linearizable store with the same contract as a remote one: a global version counter,
/// conditional writes and deletes, TTL expiry and long-poll watches backed by a bounded event history.
///
/// Cloning is cheap and every clone shares the same data.
///
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = State {
            index: 0,
            entries: BTreeMap::new(),
            history: VecDeque::with_capacity(history_capacity),
            history_capacity: history_capacity.max(1),
            evicted_through: 0,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                events,
            }),
        }
    }

    fn schedule_expiry(&self, key: String, version: Version, ttl: Duration) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut state = shared.state.lock().await;
            // A later write owns the key now, with its own TTL or none.
            if state.entries.get(&key).map(|entry| entry.version) != Some(version) {
                return;
            }
            let event = state.record(&key, Action::Expired, None);
            shared.publish(event);
        });
    }

    ///
    /// First change strictly after `after` on a key accepted by `matches`, replayed from the
    /// retained history or waited for on the event fan-out.
    ///
    async fn watch_matching<F>(
        &self,
        after: Option<Version>,
        matches: F,
    ) -> Result<ChangeEvent, Error>
    where
        F: Fn(&str) -> bool + Send + Sync,
    {
        let mut after = after;
        loop {
            let (after_version, mut rx) = {
                let state = self.shared.state.lock().await;
                let after_version = *after.get_or_insert(state.index);
                if after_version < state.evicted_through {
                    return Err(Error::ResyncRequired(state.index));
                }
                if let Some(event) = state
                    .history
                    .iter()
                    .find(|event| event.version > after_version && matches(&event.key))
                {
                    return Ok(event.clone());
                }
                // Subscribing under the state lock leaves no gap with the history scan above.
                (after_version, self.shared.events.subscribe())
            };
            loop {
                match rx.recv().await {
                    Ok(event) if event.version > after_version && matches(&event.key) => {
                        return Ok(event)
                    }
                    Ok(_) => continue,
                    // Fell behind the broadcast buffer, rescan the history.
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return Err(Error::WatchEnded),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl VersionedStore for MemoryStore {
    async fn read(&self, key: &str, _consistent: bool) -> Result<VersionedValue, Error> {
        self.shared
            .state
            .lock()
            .await
            .current(key)
            .ok_or(Error::NotFound)
    }

    async fn current_version(&self) -> Result<Version, Error> {
        Ok(self.shared.state.lock().await.index)
    }

    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        precondition: Option<&Precondition>,
        ttl: Option<Duration>,
    ) -> Result<VersionedValue, Error> {
        let mut state = self.shared.state.lock().await;
        let current = state.current(key);
        if let Some(precondition) = precondition {
            precondition.check(current.as_ref())?;
        }
        let action = if current.is_some() {
            Action::Updated
        } else {
            Action::Created
        };
        let event = state.record(key, action, Some(value.clone()));
        let kv = VersionedValue {
            key: key.to_string(),
            value,
            version: event.version,
        };
        if let Some(ttl) = ttl {
            self.schedule_expiry(key.to_string(), event.version, ttl);
        }
        self.shared.publish(event);
        Ok(kv)
    }

    async fn delete(&self, key: &str, precondition: Option<&Precondition>) -> Result<(), Error> {
        let mut state = self.shared.state.lock().await;
        let current = state.current(key);
        if let Some(precondition) = precondition {
            precondition.check(current.as_ref())?;
        }
        if current.is_none() {
            return Err(Error::NotFound);
        }
        let event = state.record(key, Action::Deleted, None);
        self.shared.publish(event);
        Ok(())
    }

    async fn watch(&self, key: &str, after: Option<Version>) -> Result<ChangeEvent, Error> {
        self.watch_matching(after, |event_key| event_key == key).await
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        after: Option<Version>,
    ) -> Result<ChangeEvent, Error> {
        self.watch_matching(after, |event_key| event_key.starts_with(prefix))
            .await
    }

    async fn list(&self, prefix: &str, _consistent: bool) -> Result<Vec<VersionedValue>, Error> {
        let state = self.shared.state.lock().await;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| VersionedValue {
                key: key.clone(),
                value: entry.value.clone(),
                version: entry.version,
            })
            .collect())
    }

    async fn delete_tree(&self, prefix: &str) -> Result<(), Error> {
        let mut state = self.shared.state.lock().await;
        let keys = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        if keys.is_empty() {
            return Err(Error::NotFound);
        }
        for key in keys {
            let event = state.record(&key, Action::Deleted, None);
            self.shared.publish(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn versions_should_be_store_wide() {
        let store = MemoryStore::new();
        let a = store.write("a", b"1".to_vec(), None, None).await.expect("write a");
        let b = store.write("b", b"1".to_vec(), None, None).await.expect("write b");
        store.delete("a", None).await.expect("delete a");
        assert_eq!(a.version, 1);
        assert_eq!(b.version, 2);
        assert_eq!(store.current_version().await.expect("version"), 3);
    }

    #[tokio::test]
    async fn watch_should_replay_retained_history_after_version() {
        let store = MemoryStore::new();
        let first = store.write("k", b"1".to_vec(), None, None).await.expect("write");
        store.write("k", b"2".to_vec(), None, None).await.expect("write");

        let event = store.watch("k", Some(first.version)).await.expect("watch");
        assert_eq!(event.action, Action::Updated);
        assert_eq!(event.value.map(|kv| kv.value), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn watch_should_require_resync_once_history_is_evicted() {
        let store = MemoryStore::with_history_capacity(2);
        for i in 0..5u8 {
            store.write("k", vec![i], None, None).await.expect("write");
        }
        let result = store.watch("k", Some(1)).await;
        assert!(matches!(result, Err(Error::ResyncRequired(5))));

        let event = store.watch("k", Some(4)).await.expect("watch");
        assert_eq!(event.version, 5);
    }

    #[tokio::test]
    async fn prefix_watch_should_skip_keys_outside_the_prefix() {
        let store = MemoryStore::new();
        let start = store.write("dirt", vec![], None, None).await.expect("write");
        store.write("dir/a", vec![], None, None).await.expect("write");

        let event = store
            .watch_prefix("dir/", Some(start.version - 1))
            .await
            .expect("watch");
        assert_eq!(event.key, "dir/a");
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_should_expire_key_unless_rewritten() {
        let store = MemoryStore::new();
        store
            .write("k", b"v".to_vec(), None, Some(Duration::from_secs(3)))
            .await
            .expect("write");
        tokio::time::sleep(Duration::from_secs(2)).await;
        // Rewriting without a TTL clears the pending expiry.
        let kv = store.write("k", b"w".to_vec(), None, None).await.expect("rewrite");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.read("k", true).await.expect("read"), kv);

        store
            .write("t", b"v".to_vec(), None, Some(Duration::from_secs(3)))
            .await
            .expect("write");
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(matches!(store.read("t", true).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn delete_tree_should_only_touch_the_prefix() {
        let store = MemoryStore::new();
        store.write("dir/a", vec![], None, None).await.expect("write");
        store.write("dir/b", vec![], None, None).await.expect("write");
        store.write("dirt", vec![], None, None).await.expect("write");

        store.delete_tree("dir/").await.expect("delete tree");
        assert!(store.list("dir/", true).await.expect("list").is_empty());
        assert!(store.read("dirt", true).await.is_ok());
        assert!(matches!(store.delete_tree("dir/").await, Err(Error::NotFound)));
    }
}
