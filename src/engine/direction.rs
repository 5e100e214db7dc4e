use super::balancer::LoadBalancer;
use super::chunk::ChunkReport;
use super::counter::Counter;
use super::Error;
use crate::stats::Welford;
use crate::units::ByteRate;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Deadline for a single connection handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(4);
/// Cadence of the rate sampler.
pub const DEFAULT_SAMPLING_PERIOD: Duration = Duration::from_millis(50);
/// Moving window of the Welford estimator.
pub const DEFAULT_SAMPLING_WINDOW: Duration = Duration::from_secs(5);
/// Hard stop for a direction that never converges.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionKind {
    Download,
    Upload,
}

/// Append-only record of every request the direction issued.
pub type TraceHandle = Arc<Mutex<Vec<ChunkReport>>>;

pub type RateCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Outcome of one download or upload pass.
#[derive(Debug, Clone, Copy)]
pub struct DirectionResult {
    /// Smoothed byte rate at cancellation; the N/A sentinel when the
    /// direction moved nothing and most requests failed.
    pub rate: ByteRate,
    pub duration: Duration,
    pub requests: usize,
    pub failures: usize,
}

/// A single measurement pass in one direction: owns the byte counter, the
/// Welford estimator, the load balancer and the worker pool. Constructed per
/// call and never reused; cancellation (convergence, deadline, or the
/// caller's signal) tears the whole pass down through one shared signal.
pub struct TestDirection {
    kind: DirectionKind,
    counter: Arc<Counter>,
    balancer: Arc<LoadBalancer>,
    trace: TraceHandle,
    max_connections: usize,
    sampling_period: Duration,
    sampling_window: Duration,
    deadline: Duration,
    callback: Option<RateCallback>,
    debug: bool,
}

impl TestDirection {
    pub fn new(kind: DirectionKind, max_connections: usize) -> Self {
        Self {
            kind,
            counter: Arc::new(Counter::new()),
            balancer: Arc::new(LoadBalancer::new()),
            trace: Arc::new(Mutex::new(Vec::new())),
            max_connections: max_connections.max(1),
            sampling_period: DEFAULT_SAMPLING_PERIOD,
            sampling_window: DEFAULT_SAMPLING_WINDOW,
            deadline: DEFAULT_DEADLINE,
            callback: None,
            debug: false,
        }
    }

    /// Override the sampler timing; used by callers that need a tighter
    /// schedule and by tests.
    pub fn with_timing(mut self, period: Duration, window: Duration, deadline: Duration) -> Self {
        self.sampling_period = period;
        self.sampling_window = window;
        self.deadline = deadline;
        self
    }

    pub fn with_callback(mut self, callback: RateCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn kind(&self) -> DirectionKind {
        self.kind
    }

    pub fn counter(&self) -> Arc<Counter> {
        self.counter.clone()
    }

    pub fn trace(&self) -> TraceHandle {
        self.trace.clone()
    }

    /// Register one balanced task, usually a closure bound to a candidate
    /// server. The task set never outgrows the worker pool.
    pub fn register<F>(&self, priority: u64, action: F)
    where
        F: Fn() -> futures::future::BoxFuture<'static, Result<(), Error>> + Send + Sync + 'static,
    {
        if self.balancer.len() < self.max_connections {
            self.balancer.add(priority, action);
        }
    }

    pub fn registered(&self) -> usize {
        self.balancer.len()
    }

    /// Run the pass to completion: start the sampler and `max_connections`
    /// worker loops, then wait for convergence, the deadline, or the parent
    /// signal. Returns the realised rate and duration.
    pub async fn run(self, parent: Option<watch::Receiver<bool>>) -> Result<DirectionResult, Error> {
        if self.balancer.is_empty() {
            return Err(Error::NoAvailableServers);
        }

        let start = Instant::now();

        let sampler = tokio::spawn(rate_sampling(
            self.counter.clone(),
            self.sampling_period,
            self.sampling_window,
            self.callback.clone(),
            self.debug,
        ));

        // Deadline timer and parent cancellation both funnel into the
        // direction's one-shot signal.
        let watchdog = {
            let counter = self.counter.clone();
            let deadline = self.deadline;
            tokio::spawn(async move {
                match parent {
                    Some(mut rx) => {
                        tokio::select! {
                            _ = tokio::time::sleep(deadline) => counter.cancel(),
                            _ = rx.wait_for(|cancelled| *cancelled) => counter.cancel(),
                            _ = counter.cancelled() => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(deadline) => counter.cancel(),
                            _ = counter.cancelled() => {}
                        }
                    }
                }
            })
        };

        let mut workers = Vec::with_capacity(self.max_connections);
        for _ in 0..self.max_connections {
            let counter = self.counter.clone();
            let balancer = self.balancer.clone();
            workers.push(tokio::spawn(async move {
                // The dispatch is awaited to completion even when the signal
                // fires mid-flight: tasks observe the same signal and return
                // promptly, and every chunk they opened lands in the trace.
                while !counter.is_cancelled() {
                    balancer.dispatch().await;
                }
            }));
        }
        for worker in workers {
            let _ = worker.await;
        }
        let duration = start.elapsed();

        let ewma = sampler.await.unwrap_or(0.0);
        watchdog.abort();

        let (requests, failures) = {
            let trace = self.trace.lock().unwrap();
            let failures = trace.iter().filter(|r| r.error.is_some()).count();
            (trace.len(), failures)
        };

        // A direction that moved nothing is N/A only when the failure share
        // says the endpoint was actually broken; otherwise it is honestly
        // zero.
        let rate = if ewma == 0.0 && requests > 0 && failures * 10 > requests {
            ByteRate::NOT_AVAILABLE
        } else {
            ByteRate(ewma)
        };

        Ok(DirectionResult {
            rate,
            duration,
            requests,
            failures,
        })
    }
}

/// The sampler loop: read counter deltas at every period, feed the Welford
/// estimator, report through the callback, and cancel the direction as soon
/// as the estimate converges.
async fn rate_sampling(
    counter: Arc<Counter>,
    period: Duration,
    window: Duration,
    callback: Option<RateCallback>,
    debug: bool,
) -> f64 {
    let mut welford = Welford::new(window, period);
    let start = Instant::now();
    let mut prev_total = 0u64;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = counter.cancelled() => break,
            _ = ticker.tick() => {
                let total = counter.total();
                let delta = (total - prev_total) as f64;
                prev_total = total;
                let elapsed = start.elapsed().as_secs_f64();
                let global_avg = if elapsed > 0.0 { total as f64 / elapsed } else { 0.0 };
                if welford.update(global_avg, delta) {
                    if debug {
                        eprintln!(
                            "[debug] sampler: converged after {:.2}s, cv {:.4}",
                            elapsed,
                            welford.cv()
                        );
                    }
                    counter.cancel();
                    break;
                }
                if let Some(cb) = &callback {
                    cb(welford.rate());
                }
            }
        }
    }
    welford.rate()
}
