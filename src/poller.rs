use std::{future::Future, time::Duration};

use log::debug;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Polls a remote resource on a fixed interval until it is ready.
#[derive(Debug, Clone, Copy)]
pub struct StatusPoller {
    pub interval: Duration,
    pub timeout: Duration,
}

impl StatusPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Calls `fetch` once per interval until `is_ready` accepts its result.
    ///
    /// Fetch errors are logged and retried on the next tick. Fails with
    /// [`Error::Timeout`] once the timeout elapses and with [`Error::Cancelled`]
    /// when `cancel` fires first, including while a fetch is still in flight.
    pub async fn wait<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut fetch: F,
        is_ready: impl Fn(&T) -> bool,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut deadline => return Err(self.timed_out()),
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut deadline => return Err(self.timed_out()),
                result = fetch() => result,
            };
            match result {
                Ok(value) if is_ready(&value) => return Ok(value),
                Ok(_) => {}
                Err(err) => debug!("Status poll failed, retrying: {err}"),
            }
        }
    }

    fn timed_out(&self) -> Error {
        Error::Timeout(format!("resource not ready after {:?}", self.timeout))
    }
}
