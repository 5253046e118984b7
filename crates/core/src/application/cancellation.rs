// Cooperative stop signals (task cancellation and worker shutdown)

use tokio::sync::watch;

/// Observed by a running task at its checkpoints
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves if the source
    /// was dropped without canceling.
    pub async fn canceled(&mut self) {
        let closed = self.rx.wait_for(|canceled| *canceled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// A token nobody can cancel
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }
}

pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }
}

pub fn cancellation_pair() -> (CancellationSource, CancellationToken) {
    let (tx, rx) = watch::channel(false);
    (CancellationSource { tx }, CancellationToken { rx })
}
