use {
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    tokio::sync::Notify,
};

struct Inner<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
    sender_closed: AtomicBool,
    receiver_closed: AtomicBool,
}

pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

pub fn watch<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(None),
        notify: Notify::new(),
        sender_closed: AtomicBool::new(false),
        receiver_closed: AtomicBool::new(false),
    });

    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

impl<T> Inner<T> {
    fn take(&self) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn replace(&self, value: T) {
        *self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(value);
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.inner.sender_closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.receiver_closed.store(true, Ordering::Release);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Channel is closed")]
pub struct SendError<T> {
    inner: T,
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> Sender<T> {
    ///
    /// Overwrites any value the receiver has not consumed yet.
    ///
    pub fn update(&self, value: T) -> Result<(), SendError<T>> {
        if self.is_closed() {
            return Err(SendError { inner: value });
        }
        self.inner.replace(value);
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.receiver_closed.load(Ordering::Acquire)
    }
}

impl<T> Receiver<T> {
    ///
    /// Waits for the latest value. Returns `None` once the sender is gone and the last
    /// value it sent has been consumed.
    ///
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(value) = self.inner.take() {
                return Some(value);
            }
            if self.inner.sender_closed.load(Ordering::Acquire) {
                return self.inner.take();
            }
            self.inner.notify.notified().await;
        }
    }
}
