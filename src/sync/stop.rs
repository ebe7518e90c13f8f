use tokio::sync::watch;

///
/// Raising half of a stop signal. Dropping the trigger without calling [`StopTrigger::stop`]
/// leaves every [`StopSignal`] pending forever.
///
#[derive(Debug)]
pub struct StopTrigger {
    tx: watch::Sender<bool>,
}

///
/// Observing half of a stop signal. Cheap to clone, every clone observes the same trigger.
///
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

pub fn stop_signal() -> (StopTrigger, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopTrigger { tx }, StopSignal { rx })
}

impl StopTrigger {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    ///
    /// Resolves once the trigger has been raised, immediately if it already was.
    ///
    pub async fn stopped(mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            // Trigger dropped without ever stopping.
            std::future::pending::<()>().await;
        }
    }
}
