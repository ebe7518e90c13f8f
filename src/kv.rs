use {
    crate::{
        backend::{EtcdStore, MemoryStore},
        cas,
        config::StoreConfig,
        error::Error,
        lock::{LockHandle, LockOptions},
        store::{is_mutex_key, normalize, Precondition, VersionedStore, VersionedValue},
        watcher::{watch_key, watch_key_until, watch_tree_until, KeyWatcher, TreeWatcher},
    },
    std::{future::Future, sync::Arc, time::Duration},
    tracing::info,
};

///
/// Entry point over a [`VersionedStore`]: plain key access, compare-and-swap, watches and locks.
///
/// Keys are normalized before reaching the backend, see [`crate::store::normalize`].
/// Cloning is cheap, every clone shares the same backend.
///
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn VersionedStore>,
}

impl Store {
    pub fn new<B: VersionedStore>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_backend(backend: Arc<dyn VersionedStore>) -> Self {
        Self { backend }
    }

    ///
    /// Builds the backend described by `config`.
    ///
    pub async fn connect(config: &StoreConfig) -> Result<Self, Error> {
        config.validate()?;
        let store = match config {
            StoreConfig::Etcd(etcd) => {
                info!("connecting to etcd at {:?}", etcd.endpoint_urls());
                Self::new(EtcdStore::connect(etcd).await?)
            }
            StoreConfig::Memory(memory) => {
                Self::new(MemoryStore::with_history_capacity(memory.history_capacity))
            }
        };
        Ok(store)
    }

    pub fn backend(&self) -> &Arc<dyn VersionedStore> {
        &self.backend
    }

    pub async fn get(&self, key: &str) -> Result<VersionedValue, Error> {
        self.get_with(key, true).await
    }

    ///
    /// Reads `key`, from any member when `consistent` is false.
    ///
    pub async fn get_with(&self, key: &str, consistent: bool) -> Result<VersionedValue, Error> {
        self.backend.read(&normalize(key), consistent).await
    }

    pub async fn put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<VersionedValue, Error> {
        self.backend
            .write(&normalize(key), value.into(), None, ttl)
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        self.backend.delete(&normalize(key), None).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, Error> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    ///
    /// Lists the keys under `directory`, leaving out lock side keys.
    ///
    /// Fails with [`Error::NotFound`] when nothing at all lives under `directory`.
    ///
    pub async fn list(&self, directory: &str) -> Result<Vec<VersionedValue>, Error> {
        let kvs = self
            .backend
            .list(&directory_prefix(directory), true)
            .await?;
        if kvs.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(kvs.into_iter().filter(|kv| !is_mutex_key(&kv.key)).collect())
    }

    pub async fn delete_tree(&self, directory: &str) -> Result<(), Error> {
        self.backend.delete_tree(&directory_prefix(directory)).await
    }

    ///
    /// Puts `value` at `key` if the key was not modified since `previous` was read,
    /// or, when `previous` is `None`, only if the key does not exist yet.
    ///
    pub async fn atomic_put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        previous: Option<&VersionedValue>,
        ttl: Option<Duration>,
    ) -> Result<VersionedValue, Error> {
        let precondition = match previous {
            Some(previous) => {
                Precondition::version(previous.version).with_value(previous.value.clone())
            }
            None => Precondition::MustNotExist,
        };
        cas::compare_and_swap(
            self.backend.as_ref(),
            &normalize(key),
            value,
            &precondition,
            ttl,
        )
        .await
    }

    ///
    /// Deletes `key` if it was not modified since `previous` was read.
    ///
    pub async fn atomic_delete(&self, key: &str, previous: &VersionedValue) -> Result<(), Error> {
        let precondition =
            Precondition::version(previous.version).with_value(previous.value.clone());
        cas::compare_and_delete(self.backend.as_ref(), &normalize(key), &precondition).await
    }

    ///
    /// Watches `key` for changes made after this call.
    ///
    pub async fn watch(&self, key: &str) -> Result<KeyWatcher, Error> {
        let now = self.backend.current_version().await?;
        Ok(watch_key(self.backend.clone(), normalize(key), Some(now)))
    }

    ///
    /// Same as [`Store::watch`], the sequence ends once `stop` completes.
    ///
    pub async fn watch_until<S>(&self, key: &str, stop: S) -> Result<KeyWatcher, Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let now = self.backend.current_version().await?;
        Ok(watch_key_until(
            self.backend.clone(),
            normalize(key),
            Some(now),
            stop,
        ))
    }

    ///
    /// Reads `key` and watches it for the changes that follow the returned value.
    ///
    pub async fn watch_with_current(
        &self,
        key: &str,
    ) -> Result<(VersionedValue, KeyWatcher), Error> {
        let key = normalize(key);
        let now = self.backend.current_version().await?;
        let current = self.backend.read(&key, true).await?;
        // A change landing between the two calls is already part of `current`.
        let after = now.max(current.version);
        Ok((current, watch_key(self.backend.clone(), key, Some(after))))
    }

    ///
    /// Watches `directory` recursively. The first listing is the current one, a new listing
    /// follows every change below `directory` until `stop` completes.
    ///
    /// Fails like [`Store::list`] when `directory` is empty. Once watching, an emptied
    /// directory is delivered as an empty listing.
    ///
    pub async fn watch_tree<S>(&self, directory: &str, stop: S) -> Result<TreeWatcher, Error>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let now = self.backend.current_version().await?;
        let initial = self.list(directory).await?;
        Ok(watch_tree_until(
            self.backend.clone(),
            directory_prefix(directory),
            now,
            initial,
            stop,
        ))
    }

    pub fn new_lock(&self, key: &str, options: LockOptions) -> LockHandle {
        LockHandle::new(self.backend.clone(), key, options)
    }
}

fn directory_prefix(directory: &str) -> String {
    let directory = normalize(directory);
    if directory.is_empty() {
        directory
    } else {
        format!("{directory}/")
    }
}
