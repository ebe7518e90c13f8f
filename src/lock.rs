use {
    crate::{
        cas::{self, CreateOutcome},
        error::Error,
        store::{self, Precondition, VersionedStore},
        sync::StopSignal,
        watcher::watch_key,
        Version,
    },
    std::{future::Future, pin::Pin, sync::Arc, time::Duration},
    tokio::{
        sync::{broadcast, broadcast::error::TryRecvError, oneshot, Mutex},
        task::JoinHandle,
        time::Instant,
    },
    tracing::{info, trace, warn},
};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(20);

// Jiffy is interval between system timer interrupts, typically 10ms for linux systems.
const AT_LEAST_10_JIFFIES: Duration = Duration::from_millis(100);

///
/// Options applied when creating a [`LockHandle`].
///
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    ttl: Option<Duration>,
    value: Vec<u8>,
    renew_stop: Option<StopSignal>,
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    ///
    /// Lease duration of the mutex key. Zero or unset means [`DEFAULT_LOCK_TTL`].
    ///
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    ///
    /// Payload written to the lock's key once the lock is held.
    ///
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    ///
    /// Signal that stops lease renewal without going through [`LockHandle::unlock`],
    /// used for orchestrated shutdown. The mutex key then expires on its own.
    ///
    pub fn with_renew_stop(mut self, renew_stop: StopSignal) -> Self {
        self.renew_stop = Some(renew_stop);
        self
    }
}

///
/// Notify when the lock is no longer held: released by [`LockHandle::unlock`], renewal stopped,
/// or a renewal failed and the lease is presumed lost.
///
pub struct LockLostNotify {
    inner: broadcast::Receiver<()>,
}

impl LockLostNotify {
    ///
    /// Wait until the lock is lost.
    ///
    pub async fn recv(mut self) {
        let _ = self.inner.recv().await;
    }

    pub fn is_lost(&mut self) -> bool {
        matches!(self.inner.try_recv(), Err(TryRecvError::Closed))
    }
}

impl Clone for LockLostNotify {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.resubscribe(),
        }
    }
}

struct Renewal {
    stop_tx: oneshot::Sender<()>,
    // Resolves to the last version the renewal task observed on the mutex key.
    handle: JoinHandle<Version>,
}

enum LockState {
    Idle,
    Held(Renewal),
}

///
/// Distributed mutual-exclusion lock on a key of a [`VersionedStore`].
///
/// Ownership is represented by a dedicated mutex key, `normalize(key) + "___lock"`, created with
/// a compare-and-swap and kept alive by a background task renewing it every `ttl / 3` under a
/// version precondition. While held, the configured value is written to the key itself so readers
/// can see who holds it.
///
/// Waiters are not queued: after a release every waiter races to create the mutex key again and
/// the first one wins. Under heavy contention a waiter can be starved indefinitely.
///
/// Dropping the handle stops renewal, the mutex key then expires within one TTL.
///
/// Examples
///
/// ```no_run
/// use kv_mutex::{backend::MemoryStore, lock::LockOptions, Store};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), kv_mutex::Error> {
/// let store = Store::new(MemoryStore::new());
/// let lock = store.new_lock(
///     "svc/leader",
///     LockOptions::new().with_ttl(Duration::from_secs(3)).with_value("A"),
/// );
///
/// let lost = lock.lock().await?;
/// // Critical section, `lost.recv()` resolves if the lease is lost.
/// lock.unlock().await?;
/// # drop(lost);
/// # Ok(())
/// # }
/// ```
///
pub struct LockHandle {
    store: Arc<dyn VersionedStore>,
    mutex_key: String,
    write_key: String,
    value: Vec<u8>,
    ttl: Duration,
    renew_stop: Option<StopSignal>,
    state: Mutex<LockState>,
}

impl LockHandle {
    pub fn new(store: Arc<dyn VersionedStore>, key: &str, options: LockOptions) -> Self {
        let LockOptions {
            ttl,
            value,
            renew_stop,
        } = options;
        Self {
            store,
            mutex_key: store::mutex_key(key),
            write_key: store::normalize(key),
            value,
            ttl: ttl
                .filter(|ttl| !ttl.is_zero())
                .unwrap_or(DEFAULT_LOCK_TTL),
            renew_stop,
            state: Mutex::new(LockState::Idle),
        }
    }

    pub fn key(&self) -> &str {
        &self.write_key
    }

    pub fn mutex_key(&self) -> &str {
        &self.mutex_key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    ///
    /// True while this handle holds the lock and its renewal is running.
    /// Waits for any acquisition in progress on this handle.
    ///
    pub async fn is_held(&self) -> bool {
        matches!(&*self.state.lock().await, LockState::Held(renewal) if !renewal.handle.is_finished())
    }

    ///
    /// Acquires the lock, waiting for as long as it takes.
    ///
    pub async fn lock(&self) -> Result<LockLostNotify, Error> {
        self.lock_with_stop(std::future::pending()).await
    }

    ///
    /// Acquires the lock, giving up with [`Error::AcquisitionAborted`] if `stop` completes while
    /// waiting for the current holder. A compare-and-swap in flight is always allowed to complete.
    ///
    /// Pass a `tokio::time::sleep` to bound the wait.
    ///
    /// If writing the lock value fails the lock is still held, the caller must [`LockHandle::unlock`] it.
    ///
    pub async fn lock_with_stop<S>(&self, stop: S) -> Result<LockLostNotify, Error>
    where
        S: Future<Output = ()>,
    {
        let mut state = self.state.lock().await;
        let lost_earlier = match &*state {
            LockState::Held(renewal) if !renewal.handle.is_finished() => {
                return Err(Error::InvalidState("lock is already held by this handle"));
            }
            LockState::Held(_) => true,
            LockState::Idle => false,
        };
        if lost_earlier {
            // Lease lost earlier, start over.
            *state = LockState::Idle;
        }

        tokio::pin!(stop);
        let version = loop {
            trace!("Trying to lock {}...", self.mutex_key);
            match self.race().await? {
                Some(version) => break version,
                None => self.wait_for_release(stop.as_mut()).await?,
            }
        };

        let (lost_tx, lost_rx) = broadcast::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(renew(
            self.store.clone(),
            self.mutex_key.clone(),
            self.ttl,
            version,
            stop_rx,
            self.renew_stop.clone(),
            lost_tx,
        ));
        *state = LockState::Held(Renewal { stop_tx, handle });
        info!("acquired lock {} at version {version}", self.mutex_key);

        self.store
            .write(&self.write_key, self.value.clone(), None, None)
            .await?;

        Ok(LockLostNotify { inner: lost_rx })
    }

    ///
    /// One create-then-claim round. Returns the claimed version, or `None` when someone else holds the key.
    ///
    async fn race(&self) -> Result<Option<Version>, Error> {
        let created = cas::create_if_absent(
            self.store.as_ref(),
            &self.mutex_key,
            Vec::new(),
            Some(self.ttl),
        )
        .await?;
        let claim = match created {
            CreateOutcome::Created(kv) => Precondition::version(kv.version),
            // Claiming an existing key needs a version we never observed, it can only conflict.
            CreateOutcome::Existed => return Ok(None),
        };
        match cas::compare_and_swap(
            self.store.as_ref(),
            &self.mutex_key,
            Vec::new(),
            &claim,
            Some(self.ttl),
        )
        .await
        {
            Ok(kv) => Ok(Some(kv.version)),
            Err(Error::VersionConflict) => Ok(None),
            Err(e) => Err(e),
        }
    }

    ///
    /// Blocks until the mutex key is deleted or expires.
    ///
    async fn wait_for_release<S>(&self, mut stop: Pin<&mut S>) -> Result<(), Error>
    where
        S: Future<Output = ()>,
    {
        loop {
            // Watch from before the read, a release landing right after it is still seen.
            let now = self.store.current_version().await?;
            match self.store.read(&self.mutex_key, true).await {
                Ok(kv) => trace!("{} held at version {}, waiting", self.mutex_key, kv.version),
                Err(Error::NotFound) => return Ok(()),
                Err(e) => return Err(e),
            }

            let mut watcher = watch_key(self.store.clone(), self.mutex_key.clone(), Some(now));
            loop {
                tokio::select! {
                    event = watcher.next() => match event {
                        Some(Ok(event)) if event.action.is_removal() => {
                            trace!("{} freed by {:?}", self.mutex_key, event.action);
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(Error::ResyncRequired(at))) => {
                            warn!("watch on {} fell behind at {at}, reading again", self.mutex_key);
                            break;
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::WatchEnded),
                    },
                    _ = stop.as_mut() => {
                        info!("stopped waiting for lock {}", self.mutex_key);
                        return Err(Error::AcquisitionAborted);
                    }
                }
            }
        }
    }

    ///
    /// Releases the lock.
    ///
    /// Stops the renewal task and waits for it to terminate, then deletes the mutex key under the last
    /// version renewal observed. If the lease was already lost the delete fails and the error is returned;
    /// watch the [`LockLostNotify`] to avoid that. The handle can be locked again afterwards.
    ///
    pub async fn unlock(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let LockState::Held(Renewal { stop_tx, handle }) =
            std::mem::replace(&mut *state, LockState::Idle)
        else {
            return Err(Error::InvalidState("unlock called without holding the lock"));
        };

        // The renewal task may already be gone if the lease was lost.
        let _ = stop_tx.send(());
        let last_version = handle.await?;

        cas::compare_and_delete(
            self.store.as_ref(),
            &self.mutex_key,
            &Precondition::version(last_version),
        )
        .await?;
        info!("released lock {}", self.mutex_key);
        Ok(())
    }
}

///
/// Keeps the mutex key alive until told to stop or until a renewal fails.
///
/// Dropping `lost_tx` on exit closes every [`LockLostNotify`] exactly once.
///
async fn renew(
    store: Arc<dyn VersionedStore>,
    key: String,
    ttl: Duration,
    mut version: Version,
    mut stop_rx: oneshot::Receiver<()>,
    renew_stop: Option<StopSignal>,
    lost_tx: broadcast::Sender<()>,
) -> Version {
    let renew_interval = ttl / 3;
    let external_stop = async move {
        match renew_stop {
            Some(renew_stop) => renew_stop.stopped().await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(external_stop);

    let mut last_renewal = Instant::now();
    let mut next_renewal = last_renewal + renew_interval;
    loop {
        tokio::select! {
            biased;
            // Also resolves when the handle is dropped.
            _ = &mut stop_rx => {
                trace!("stopped renewing {key}");
                break;
            }
            _ = &mut external_stop => {
                info!("renewal of {key} stopped by external signal");
                break;
            }
            _ = tokio::time::sleep_until(next_renewal) => {
                let since_last_renewal = last_renewal.elapsed();
                if since_last_renewal > renew_interval {
                    let dt = since_last_renewal - renew_interval;
                    if dt >= AT_LEAST_10_JIFFIES {
                        warn!("renewal of {key} was {dt:?} late");
                    }
                }
                let renewed = cas::compare_and_swap(
                    store.as_ref(),
                    &key,
                    Vec::new(),
                    &Precondition::version(version),
                    Some(ttl),
                )
                .await;
                match renewed {
                    Ok(kv) => {
                        trace!("renewed {key} at {since_last_renewal:?}, version {}", kv.version);
                        version = kv.version;
                        last_renewal = Instant::now();
                        next_renewal += renew_interval;
                    }
                    Err(e) => {
                        warn!("lost lock {key}, renewal failed: {e}");
                        break;
                    }
                }
            }
        }
    }
    drop(lost_tx);
    version
}
