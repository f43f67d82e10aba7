use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::handle::LifecycleRequest;

#[async_trait]
pub trait LifecycleHandler: Send + Sync + 'static {
    async fn handle(&self, request: LifecycleRequest);
}

/// Receives maintenance/retry/retire requests raised by session drivers and
/// runs each one in its own task, so a slow teardown for one session never
/// delays another. Ordering per session comes from the registry slot.
pub struct LifecycleScheduler {
    shutdown: CancellationToken,
    dispatched: TaskTracker,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleScheduler {
    pub fn channel() -> (
        mpsc::UnboundedSender<LifecycleRequest>,
        mpsc::UnboundedReceiver<LifecycleRequest>,
    ) {
        mpsc::unbounded_channel()
    }

    pub fn spawn<H: LifecycleHandler>(
        handler: Weak<H>,
        mut requests: mpsc::UnboundedReceiver<LifecycleRequest>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let dispatched = TaskTracker::new();
        let tracker = dispatched.clone();
        let task = tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                debug!(
                    session_id = %request.session_id(),
                    generation = request.generation(),
                    request = ?request,
                    "lifecycle request"
                );
                tracker.spawn(async move {
                    handler.handle(request).await;
                });
            }
        });
        Self {
            shutdown,
            dispatched,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stops accepting requests and waits for the ones already dispatched,
    /// so no lifecycle work is still running once this returns.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.dispatched.close();
        self.dispatched.wait().await;
    }
}
