//! Process watchdog: samples pipeline states and overall progress, raises
//! the global stop on a stopped pipeline or a stall.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deltaload_core::{AckChain, PipelineState, StateCell, WatchdogConfig};
use tokio_util::sync::CancellationToken;
use tracing::error;

pub struct Watchdog {
    pub cfg: WatchdogConfig,
    pub pipelines: Vec<(String, Arc<StateCell>, Arc<AckChain>)>,
    /// Loaded-batch counter shared with every loader.
    pub progress: Arc<AtomicU64>,
}

impl Watchdog {
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.cfg.sample_interval_ms));
        let stall_timeout = Duration::from_millis(self.cfg.stall_timeout_ms);
        let mut last_progress = self.progress.load(Ordering::Relaxed);
        let mut moving_since = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            for (name, state, _) in &self.pipelines {
                if state.get() == PipelineState::Stopped {
                    error!("pipeline `{name}` stopped; halting the process");
                    cancel.cancel();
                    return;
                }
            }

            let in_flight: usize = self.pipelines.iter().map(|(_, _, c)| c.in_flight()).sum();
            metrics::gauge!("deltaload_batches_in_flight", in_flight as f64);

            let progress = self.progress.load(Ordering::Relaxed);
            if progress != last_progress || in_flight == 0 {
                last_progress = progress;
                moving_since = Instant::now();
            } else if moving_since.elapsed() > stall_timeout {
                error!(
                    "no batch loaded for {:?} with {in_flight} in flight; halting the process",
                    moving_since.elapsed()
                );
                cancel.cancel();
                return;
            }
        }
    }
}
