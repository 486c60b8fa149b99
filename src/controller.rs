use std::sync::Arc;

use log::{error, info, warn};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    cache::QualifiedName, config::Config, error::Result, queue::RetryQueue,
    reconciler::Reconciler,
};

/// Drains the retry queue into the reconciler.
pub struct Controller {
    workers: usize,
    max_requeues: u32,
    queue: Arc<RetryQueue<QualifiedName>>,
    reconciler: Arc<Reconciler>,
}

impl Controller {
    pub fn new(
        config: &Config,
        queue: Arc<RetryQueue<QualifiedName>>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            workers: config.workers.max(1),
            max_requeues: config.max_requeues,
            queue,
            reconciler,
        }
    }

    /// Runs the workers until `shutdown` fires, then drains them and any pending status sync.
    pub async fn run(&self, shutdown: CancellationToken) {
        let workers = TaskTracker::new();
        for _ in 0..self.workers {
            workers.spawn(worker(
                Arc::clone(&self.queue),
                Arc::clone(&self.reconciler),
                self.max_requeues,
            ));
        }
        workers.close();
        info!("Started {} worker(s)", self.workers);

        shutdown.cancelled().await;
        info!("Shutting down workers");
        self.queue.shut_down();
        workers.wait().await;
        self.reconciler.shutdown().await;
    }
}

async fn worker(
    queue: Arc<RetryQueue<QualifiedName>>,
    reconciler: Arc<Reconciler>,
    max_requeues: u32,
) {
    while let Some(key) = queue.get().await {
        let result = reconciler.reconcile(&key).await;
        handle_result(&queue, &key, result, max_requeues);
        queue.done(&key);
    }
}

fn handle_result(
    queue: &Arc<RetryQueue<QualifiedName>>,
    key: &QualifiedName,
    result: Result<()>,
    max_requeues: u32,
) {
    match result {
        Ok(()) => queue.forget(key),
        Err(err) if queue.num_requeues(key) < max_requeues => {
            warn!("Error syncing ingress {key}, retrying: {err}");
            queue.add_rate_limited(key.clone());
        }
        Err(err) => {
            queue.forget(key);
            error!("Dropping ingress {key} out of the queue: {err}");
        }
    }
}
