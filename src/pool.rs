use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Runs one handler per item with at most `concurrency` handlers in flight, then waits
/// for all of them.
///
/// A failing handler never affects its siblings. The exception is a fatal error
/// (see [`crate::error::is_fatal`]): it stops scheduling, lets in-flight handlers finish
/// and is returned in [`PoolReport::fatal`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

#[derive(Debug, Default)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
    pub not_started: usize,
    pub fatal: Option<anyhow::Error>,
}

impl PoolReport {
    pub fn interrupted(&self) -> bool {
        self.fatal.is_some() || self.not_started > 0
    }
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run<T, F, Fut>(
        &self,
        items: Vec<T>,
        cancel: &CancellationToken,
        handler: F,
    ) -> PoolReport
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let stop = cancel.child_token();
        let mut tasks = JoinSet::new();
        let mut report = PoolReport::default();

        let mut items = items.into_iter();
        while let Some(item) = items.next() {
            let permit = tokio::select! {
                biased;
                () = stop.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            // A fatal task cancels `stop` before releasing its permit, so the check
            // after acquiring one sees it.
            let Some(permit) = permit.filter(|_| !stop.is_cancelled()) else {
                report.not_started = 1 + items.len();
                break;
            };

            let fut = handler(item);
            let task_stop = stop.clone();
            tasks.spawn(async move {
                let result = fut.await;
                if result.as_ref().is_err_and(crate::error::is_fatal) {
                    task_stop.cancel();
                }
                drop(permit);
                result
            });

            while let Some(joined) = tasks.try_join_next() {
                record(&mut report, joined, &stop);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record(&mut report, joined, &stop);
        }

        if report.not_started > 0 {
            tracing::warn!(not_started = report.not_started, "worker pool stopped early");
        }
        report
    }
}

fn record(
    report: &mut PoolReport,
    joined: Result<anyhow::Result<()>, JoinError>,
    stop: &CancellationToken,
) {
    match joined {
        Ok(Ok(())) => report.completed += 1,
        Ok(Err(err)) if crate::error::is_fatal(&err) => {
            stop.cancel();
            if report.fatal.is_none() {
                report.fatal = Some(err);
            } else {
                tracing::debug!(?err, "additional fatal worker error");
            }
        }
        Ok(Err(err)) => {
            tracing::warn!(err = %format!("{err:#}"), "worker failed");
            report.failed += 1;
        }
        Err(err) => {
            tracing::error!(?err, "worker panicked or was aborted");
            report.failed += 1;
        }
    }
}
