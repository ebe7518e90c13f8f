use {
    crate::{
        error::Error,
        store::{is_mutex_key, ChangeEvent, VersionedStore, VersionedValue},
        sync::watch,
        Version,
    },
    futures::Stream,
    std::{future::Future, sync::Arc},
    tokio::sync::oneshot,
    tracing::{trace, warn},
};

///
/// Blocking view over the changes of a single key.
///
/// A background task long-polls the store, one call per event, and resumes each call from the version
/// of the previous event so consecutive polls leave no gap. Events are not buffered: a slow consumer
/// only sees the latest change observed so far. Dropping the watcher stops the background task.
///
pub struct KeyWatcher {
    rx: watch::Receiver<Result<ChangeEvent, Error>>,
    // Never used, dropping it wakes up the background task so it stops polling.
    _tx_terminate: oneshot::Sender<()>,
}

impl KeyWatcher {
    ///
    /// Waits for the next change.
    ///
    /// Returns `None` once the watch was stopped. A store error is delivered once and ends the sequence.
    ///
    pub async fn next(&mut self) -> Option<Result<ChangeEvent, Error>> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeEvent, Error>> {
        futures::stream::unfold(self, |mut watcher| async move {
            watcher.next().await.map(|item| (item, watcher))
        })
    }
}

///
/// Watches `key` for changes strictly after version `after`, or from now on when `after` is `None`.
///
pub fn watch_key(
    store: Arc<dyn VersionedStore>,
    key: impl Into<String>,
    after: Option<Version>,
) -> KeyWatcher {
    watch_key_until(store, key, after, std::future::pending())
}

///
/// Same as [`watch_key`] but the sequence terminates, without error, as soon as `stop` completes.
/// A long-poll in flight at that moment is abandoned.
///
pub fn watch_key_until<S>(
    store: Arc<dyn VersionedStore>,
    key: impl Into<String>,
    after: Option<Version>,
    stop: S,
) -> KeyWatcher
where
    S: Future<Output = ()> + Send + 'static,
{
    let key: String = key.into();
    let (tx, rx) = watch::watch();
    let (tx_terminate, mut rx_terminate) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut after = after;
        tokio::pin!(stop);
        loop {
            let result = tokio::select! {
                biased;
                _ = &mut stop => {
                    trace!("watch on {key} stopped");
                    break;
                }
                _ = &mut rx_terminate => break,
                result = store.watch(&key, after) => result,
            };
            let failed = match &result {
                Ok(event) => {
                    after = Some(event.version);
                    false
                }
                Err(e) => {
                    warn!("watch on {key} failed: {e}");
                    true
                }
            };
            if tx.update(result).is_err() {
                trace!("closed watch event receiver for {key}");
                break;
            }
            if failed {
                break;
            }
        }
    });
    KeyWatcher {
        rx,
        _tx_terminate: tx_terminate,
    }
}

///
/// Latest listing of a directory, refreshed after every change below it.
///
/// Lock side keys are left out of the listing and their renewals do not trigger a refresh.
///
pub struct TreeWatcher {
    rx: watch::Receiver<Result<Vec<VersionedValue>, Error>>,
    _tx_terminate: oneshot::Sender<()>,
}

impl TreeWatcher {
    ///
    /// Waits for the next listing. The first one is the listing the watch started from.
    ///
    pub async fn next(&mut self) -> Option<Result<Vec<VersionedValue>, Error>> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<VersionedValue>, Error>> {
        futures::stream::unfold(self, |mut watcher| async move {
            watcher.next().await.map(|item| (item, watcher))
        })
    }
}

async fn list_children(
    store: &dyn VersionedStore,
    prefix: &str,
) -> Result<Vec<VersionedValue>, Error> {
    match store.list(prefix, true).await {
        Ok(kvs) => Ok(kvs.into_iter().filter(|kv| !is_mutex_key(&kv.key)).collect()),
        Err(Error::NotFound) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

///
/// Watches every key starting with `prefix` for changes strictly after version `after`.
/// `initial` is delivered first, then the children are listed again after each change.
/// The sequence terminates, without error, as soon as `stop` completes.
///
pub fn watch_tree_until<S>(
    store: Arc<dyn VersionedStore>,
    prefix: impl Into<String>,
    after: Version,
    initial: Vec<VersionedValue>,
    stop: S,
) -> TreeWatcher
where
    S: Future<Output = ()> + Send + 'static,
{
    let prefix: String = prefix.into();
    let (tx, rx) = watch::watch();
    let (tx_terminate, mut rx_terminate) = oneshot::channel::<()>();
    // The receiver is alive, this cannot fail.
    let _ = tx.update(Ok(initial));
    tokio::spawn(async move {
        let mut after = after;
        tokio::pin!(stop);
        loop {
            let result = tokio::select! {
                biased;
                _ = &mut stop => {
                    trace!("tree watch on {prefix} stopped");
                    break;
                }
                _ = &mut rx_terminate => break,
                result = store.watch_prefix(&prefix, Some(after)) => result,
            };
            let listing = match result {
                Ok(event) => {
                    after = event.version;
                    if is_mutex_key(&event.key) {
                        continue;
                    }
                    list_children(store.as_ref(), &prefix).await
                }
                Err(e) => Err(e),
            };
            let failed = match &listing {
                Ok(_) => false,
                Err(e) => {
                    warn!("tree watch on {prefix} failed: {e}");
                    true
                }
            };
            if tx.update(listing).is_err() {
                trace!("closed tree listing receiver for {prefix}");
                break;
            }
            if failed {
                break;
            }
        }
    });
    TreeWatcher {
        rx,
        _tx_terminate: tx_terminate,
    }
}
