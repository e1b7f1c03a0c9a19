use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::drain::DrainController;
use crate::sink::Sink;

/// Background nudge that drains the buffer once it has gone `timeout`
/// without a flush, checked every `tick`.
pub struct FlushScheduler {
    interval: Interval,
    timeout: Duration,
}

impl FlushScheduler {
    pub fn new(tick: Duration, timeout: Duration) -> Self {
        let mut interval = time::interval_at(Instant::now() + tick, tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, timeout }
    }

    pub async fn next_tick(&mut self) {
        self.interval.tick().await;
    }

    /// Flush once the timeout has elapsed since `last_flush`.
    pub fn should_flush(&self, last_flush: Instant) -> bool {
        last_flush.elapsed() >= self.timeout
    }

    /// Tick until `cancel` fires. A drain already started by a tick runs to
    /// completion before the loop observes cancellation.
    pub async fn run<S: Sink>(mut self, drain: DrainController<S>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.next_tick() => {
                    if !self.should_flush(drain.last_flush()) {
                        continue;
                    }
                    match drain.drain().await {
                        Ok(()) => debug!("drained buffer from flush timer"),
                        Err(e) => warn!(error = %e, "failed to drain buffer from flush timer"),
                    }
                }
            }
        }
        debug!("flush scheduler stopped");
    }

    pub fn spawn<S: Sink>(
        self,
        drain: DrainController<S>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(drain, cancel))
    }
}
