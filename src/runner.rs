use crate::config::{ Config, ConfigError, TestType };
use crate::endpoint::{ parse_endpoints, Endpoint, EndpointError };
use crate::executor::{ HttpExecutor, RequestExecutor };
use crate::metrics::Metrics;

use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::Mutex,
    task::JoinSet,
    time::{ interval_at, sleep, Duration, Instant, Interval, MissedTickBehavior },
};
use tokio_util::sync::CancellationToken;
use tracing::{ debug, info, warn };

const BURST_MULTIPLIER: usize = 5; // burst workers per baseline worker

/// Errors that abort a run before any request is sent.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to parse endpoints: {0}")]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] isahc::Error),
}

/// Time between dispatches for a target rate.
pub fn pacing_interval(rps: u32) -> Duration {
    (Duration::from_secs(1) / rps.max(1)).max(Duration::from_nanos(1))
}

/// Single pacing source shared by every worker of one load phase.
///
/// Each tick admits exactly one worker, so the aggregate rate follows the
/// target no matter how many workers wait on it.
pub struct Pacer {
    interval: Mutex<Interval>,
}

impl Pacer {
    pub fn new(rps: u32) -> Self {
        let period = pacing_interval(rps);
        // first dispatch one period in, ticks missed while everyone is busy are dropped
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval: Mutex::new(interval) }
    }

    pub async fn tick(&self) {
        self.interval.lock().await.tick().await;
    }
}

/// Runs a test of the configured shape against the configured endpoints.
///
/// A runner drives exactly one run: [`Runner::run`] consumes it.
pub struct Runner<E: RequestExecutor = HttpExecutor> {
    config: Arc<Config>,
    executor: Arc<E>,
}

impl Runner<HttpExecutor> {
    /// Runner sending HTTP requests and recording into `metrics`.
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Result<Self, RunError> {
        let executor = HttpExecutor::new(&config, metrics)?;
        Ok(Self::with_executor(config, executor))
    }
}

impl<E: RequestExecutor> Runner<E> {
    /*------------------==| Public Functions |==-------------------------*/
    pub fn with_executor(config: Config, executor: E) -> Self {
        Self {
            config: Arc::new(config),
            executor: Arc::new(executor),
        }
    }

    /// Run until the configured duration elapses or `cancel` fires.
    ///
    /// Only an invalid endpoint list is an error; failed requests end up in
    /// the metrics. Returns once every worker has stopped.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), RunError> {
        let endpoints: Arc<[Endpoint]> = parse_endpoints(&self.config.endpoints)?.into();

        info!(
            test_type = %self.config.test_type,
            duration = ?self.config.duration,
            rps = self.config.target_rps,
            concurrency = self.config.concurrency,
            endpoints = endpoints.len(),
            "run started"
        );

        // cancelled at the deadline, on external cancellation, or when this returns
        let run_token = cancel.child_token();
        let _guard = run_token.clone().drop_guard();

        let mut tasks = JoinSet::new();
        self.spawn_workers(
            &mut tasks,
            &endpoints,
            Arc::new(Pacer::new(self.config.target_rps)),
            &run_token,
            self.config.concurrency,
            |_| 0
        );

        match self.config.test_type {
            TestType::Load | TestType::Endurance => {}
            TestType::Spike => {
                let runner = self.clone();
                let endpoints = Arc::clone(&endpoints);
                let token = run_token.clone();
                tasks.spawn(async move { runner.run_spikes(endpoints, token).await });
            }
        }

        tokio::select! {
            _ = sleep(self.config.duration) => { debug!("run deadline reached"); }
            _ = run_token.cancelled() => { debug!("run cancelled"); }
        }
        run_token.cancel();

        Self::join_all(&mut tasks).await;
        info!("run stopped");
        Ok(())
    }

    /*-------------------==| Private/Helpers |==----------------------- */

    /// Fire a burst every two spike durations until the run ends.
    async fn run_spikes(self, endpoints: Arc<[Endpoint]>, run_token: CancellationToken) {
        let period = self.config.spike_duration.checked_mul(2);
        let first = period.and_then(|period| Instant::now().checked_add(period));
        let (Some(period), Some(first)) = (period, first) else {
            // the first burst would land past any representable instant
            debug!(spike_duration = ?self.config.spike_duration, "spike period out of range, no bursts");
            return;
        };
        let mut ticker = interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut burst = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = run_token.cancelled() => { return; }
                _ = ticker.tick() => {}
            }
            burst += 1;
            self.run_burst(burst, &endpoints, &run_token).await;
        }
    }

    /// One burst window: fresh workers at the spike rate for one spike duration.
    async fn run_burst(&self, burst: usize, endpoints: &Arc<[Endpoint]>, run_token: &CancellationToken) {
        let workers = self.config.concurrency * BURST_MULTIPLIER;
        debug!(burst, workers, rps = self.config.spike_rps, "burst started");

        let burst_token = run_token.child_token();
        let mut tasks = JoinSet::new();
        self.spawn_workers(
            &mut tasks,
            endpoints,
            Arc::new(Pacer::new(self.config.spike_rps)),
            &burst_token,
            workers,
            |worker| worker
        );

        tokio::select! {
            _ = sleep(self.config.spike_duration) => {}
            _ = run_token.cancelled() => {}
        }
        burst_token.cancel();

        Self::join_all(&mut tasks).await;
        debug!(burst, "burst finished");
    }

    fn spawn_workers(
        &self,
        tasks: &mut JoinSet<()>,
        endpoints: &Arc<[Endpoint]>,
        pacer: Arc<Pacer>,
        token: &CancellationToken,
        count: usize,
        first_index: impl Fn(usize) -> usize
    ) {
        for worker in 0..count {
            tasks.spawn(
                Self::worker(
                    Arc::clone(&self.executor),
                    Arc::clone(endpoints),
                    Arc::clone(&pacer),
                    token.clone(),
                    first_index(worker)
                )
            );
        }
    }

    /// Dispatch round-robin on every pacer tick until cancelled.
    async fn worker(
        executor: Arc<E>,
        endpoints: Arc<[Endpoint]>,
        pacer: Arc<Pacer>,
        cancel: CancellationToken,
        mut index: usize
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => { return; }
                _ = pacer.tick() => {}
            }
            let endpoint = &endpoints[index % endpoints.len()];
            index = index.wrapping_add(1);
            executor.execute(endpoint, &cancel).await;
        }
    }

    async fn join_all(tasks: &mut JoinSet<()>) {
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "worker task failed");
            }
        }
    }
}

// manual impl: a derive would require `E: Clone`
impl<E: RequestExecutor> Clone for Runner<E> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            executor: Arc::clone(&self.executor),
        }
    }
}
