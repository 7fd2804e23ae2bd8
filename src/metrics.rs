//! Concurrent request-outcome aggregation.
//!
//! Every worker records into one shared [`Metrics`]. Counters are atomics; the
//! latency vector and the status map sit behind separate mutexes so writers
//! touching one never wait on the other. [`Metrics::snapshot`] copies state out
//! under those brief locks and does all sorting and statistics lock-free.

use std::collections::{ BTreeMap, HashMap };
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::{ Mutex, MutexGuard, PoisonError };
use std::time::{ Duration, Instant };

use chrono::{ DateTime, Local };
use serde::{ Serialize, Serializer };
use sysinfo::{ Pid, ProcessesToUpdate, System };

const LATENCY_CAPACITY: usize = 10_000; // pre-sized latency buffer
const BUCKET_COUNT: usize = 10; // size of the histogram
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Status recorded when a request produced no HTTP response at all.
pub const NO_STATUS: u16 = 0;

/*------------------==| Resource sampling |==-------------------------*/

/// Raw process resource figures, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    pub allocated: u64,
    pub total_allocated: u64,
    pub system: u64,
    pub gc_cycles: u32,
}

/// Source of process memory statistics.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Reports zeros. For environments without process introspection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSampler;

impl ResourceSampler for NoopSampler {
    fn sample(&self) -> ResourceSample {
        ResourceSample::default()
    }
}

/// Samples the current process through `sysinfo`.
///
/// `allocated` is resident memory, `total_allocated` the highest resident
/// figure seen so far and `system` the virtual memory size. There is no
/// garbage collector, so `gc_cycles` stays at zero.
pub struct ProcessSampler {
    pid: Option<Pid>,
    system: Mutex<System>,
    peak: AtomicU64,
}

impl ProcessSampler {
    pub fn new() -> Self {
        ProcessSampler {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
            peak: AtomicU64::new(0),
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for ProcessSampler {
    fn sample(&self) -> ResourceSample {
        let Some(pid) = self.pid else {
            return ResourceSample::default();
        };

        let mut system = lock(&self.system);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let Some(process) = system.process(pid) else {
            return ResourceSample::default();
        };

        let resident = process.memory();
        let peak = self.peak.fetch_max(resident, Ordering::Relaxed).max(resident);
        ResourceSample {
            allocated: resident,
            total_allocated: peak,
            system: process.virtual_memory(),
            gc_cycles: 0,
        }
    }
}

/*------------------==| Aggregator |==-------------------------*/

/// Requests-per-second over coarse one second windows.
///
/// Not a sliding window: the first recorder to notice that a second has passed
/// publishes the finished count and starts the next one.
#[derive(Debug, Default)]
struct RollingCounter {
    boundary: AtomicU64, // nanos since the aggregator epoch
    count: AtomicU64,
    current: AtomicU64,
}

impl RollingCounter {
    fn observe(&self, now: u64) {
        let boundary = self.boundary.load(Ordering::Acquire);
        if now.saturating_sub(boundary) >= NANOS_PER_SEC
            && self
                .boundary
                .compare_exchange(boundary, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // this request opens the new window
            let finished = self.count.swap(1, Ordering::AcqRel);
            self.current.store(finished, Ordering::Release);
        } else {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn reset(&self, now: u64) {
        self.boundary.store(now, Ordering::Release);
        self.count.store(0, Ordering::Release);
        self.current.store(0, Ordering::Release);
    }

    fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }
}

struct RunClock {
    instant: Instant,
    wall: DateTime<Local>,
}

impl RunClock {
    fn now() -> Self {
        RunClock {
            instant: Instant::now(),
            wall: Local::now(),
        }
    }
}

/// Thread-safe accumulator of request outcomes.
pub struct Metrics {
    epoch: Instant,
    success: AtomicU64,
    errors: AtomicU64,
    latencies: Mutex<Vec<Duration>>,
    errors_by_status: Mutex<HashMap<u16, u64>>,
    rolling: RollingCounter,
    started: Mutex<RunClock>,
    baseline: Mutex<ResourceSample>,
    sampler: Box<dyn ResourceSampler>,
}

impl Metrics {
    /// Aggregator sampling the current process's memory.
    pub fn new() -> Self {
        Self::with_sampler(ProcessSampler::new())
    }

    pub fn with_sampler(sampler: impl ResourceSampler + 'static) -> Self {
        let baseline = sampler.sample();
        Metrics {
            epoch: Instant::now(),
            success: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies: Mutex::new(Vec::with_capacity(LATENCY_CAPACITY)),
            errors_by_status: Mutex::new(HashMap::new()),
            rolling: RollingCounter::default(),
            started: Mutex::new(RunClock::now()),
            baseline: Mutex::new(baseline),
            sampler: Box::new(sampler),
        }
    }

    /// Record a request that produced an HTTP response.
    ///
    /// 2xx and 3xx count as success; everything else is an error and is also
    /// counted per status code.
    pub fn record_request(&self, latency: Duration, status: u16) {
        if (200..400).contains(&status) {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.count_error(status);
        }

        lock(&self.latencies).push(latency);
        self.rolling.observe(self.nanos_since_epoch());
    }

    /// Record a request that failed before any response arrived.
    ///
    /// Counts toward the total and the error breakdown but carries no latency.
    pub fn record_error(&self, status: u16) {
        self.count_error(status);
    }

    /// Point-in-time copy of all statistics.
    pub fn snapshot(&self) -> Snapshot {
        let resources = self.sampler.sample();

        let latencies = lock(&self.latencies).clone();
        let errors_by_status: BTreeMap<u16, u64> = lock(&self.errors_by_status)
            .iter()
            .map(|(status, count)| (*status, *count))
            .collect();
        let (started, start_time) = {
            let clock = lock(&self.started);
            (clock.instant, clock.wall)
        };
        let baseline = *lock(&self.baseline);

        let success = self.success.load(Ordering::Acquire);
        let errors = self.errors.load(Ordering::Acquire);
        let total = success + errors;
        let duration = started.elapsed();
        let seconds = duration.as_secs_f64();

        let error_rate = if total > 0 {
            (errors as f64) / (total as f64) * 100.0
        } else {
            0.0
        };
        let average_rps = if seconds > 0.0 {
            (total as f64) / seconds
        } else {
            0.0
        };

        Snapshot {
            start_time,
            end_time: Local::now(),
            duration,
            total_requests: total,
            success_requests: success,
            error_requests: errors,
            current_rps: self.rolling.current(),
            average_rps,
            latency: LatencySummary::from_samples(latencies),
            errors_by_status,
            error_rate,
            memory: MemoryDelta::between(&baseline, &resources, duration),
        }
    }

    /// Clear all state and restart the clock. Not meant to run alongside recording.
    pub fn reset(&self) {
        self.success.store(0, Ordering::Release);
        self.errors.store(0, Ordering::Release);
        lock(&self.latencies).clear();
        lock(&self.errors_by_status).clear();
        self.rolling.reset(self.nanos_since_epoch());
        *lock(&self.started) = RunClock::now();
        *lock(&self.baseline) = self.sampler.sample();
    }

    fn count_error(&self, status: u16) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *lock(&self.errors_by_status).entry(status).or_insert(0) += 1;
    }

    fn nanos_since_epoch(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/*------------------==| Snapshot |==-------------------------*/

/// Immutable view of the aggregate metrics at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub total_requests: u64,
    pub success_requests: u64,
    pub error_requests: u64,
    pub current_rps: u64,
    pub average_rps: f64,
    pub latency: Option<LatencySummary>, // None until the first response
    pub errors_by_status: BTreeMap<u16, u64>,
    pub error_rate: f64, // percent of total
    pub memory: MemoryDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySummary {
    #[serde(rename = "min_ms", serialize_with = "as_millis")]
    pub min: Duration,
    #[serde(rename = "max_ms", serialize_with = "as_millis")]
    pub max: Duration,
    #[serde(rename = "mean_ms", serialize_with = "as_millis")]
    pub mean: Duration,
    #[serde(rename = "stdev_ms", serialize_with = "as_millis")]
    pub stdev: Duration,
    #[serde(rename = "p50_ms", serialize_with = "as_millis")]
    pub p50: Duration,
    #[serde(rename = "p95_ms", serialize_with = "as_millis")]
    pub p95: Duration,
    #[serde(rename = "p99_ms", serialize_with = "as_millis")]
    pub p99: Duration,
    #[serde(rename = "p999_ms", serialize_with = "as_millis")]
    pub p999: Duration,
    pub histogram: Vec<HistogramBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBucket {
    pub lower_ms: f64,
    pub upper_ms: f64,
    pub count: u64,
}

impl LatencySummary {
    /// Statistics over unsorted samples, `None` when there are none.
    pub fn from_samples(mut samples: Vec<Duration>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();

        let n = samples.len() as u128;
        let sum: u128 = samples.iter().map(Duration::as_nanos).sum();
        let mean_nanos = sum / n;

        let mean = mean_nanos as f64;
        let variance = samples
            .iter()
            .map(|d| (d.as_nanos() as f64 - mean).powi(2))
            .sum::<f64>()
            / (n as f64);

        Some(LatencySummary {
            min: samples[0],
            max: samples[samples.len() - 1],
            mean: Duration::from_nanos(mean_nanos as u64),
            stdev: Duration::from_nanos(variance.sqrt() as u64),
            p50: percentile(&samples, 0.50),
            p95: percentile(&samples, 0.95),
            p99: percentile(&samples, 0.99),
            p999: percentile(&samples, 0.999),
            histogram: histogram(&samples),
        })
    }
}

/// Nearest-rank percentile: `sorted[floor(len * p)]`, clamped to the last sample.
///
/// `sorted` must be ascending. Returns zero for an empty slice.
pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let index = ((sorted.len() as f64) * p) as usize;
    sorted[index.min(sorted.len() - 1)]
}

// equal-width buckets from zero to the slowest sample
fn histogram(sorted: &[Duration]) -> Vec<HistogramBucket> {
    let max_ms = sorted.last().copied().map(millis).unwrap_or(0.0);
    let bucket_size = max_ms / (BUCKET_COUNT as f64);

    let mut counts = [0u64; BUCKET_COUNT];
    for latency in sorted {
        let bucket = if bucket_size > 0.0 {
            ((millis(*latency) / bucket_size) as usize).min(BUCKET_COUNT - 1)
        } else {
            0
        };
        counts[bucket] += 1;
    }

    counts
        .iter()
        .enumerate()
        .map(|(i, &count)| HistogramBucket {
            lower_ms: (i as f64) * bucket_size,
            upper_ms: ((i as f64) + 1.0) * bucket_size,
            count,
        })
        .collect()
}

/// Memory movement since the aggregator's baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemoryDelta {
    pub allocated: u64,
    pub total_allocated: u64,
    pub system: u64,
    pub gc_cycles: u32,
    pub gc_per_minute: f64,
}

impl MemoryDelta {
    fn between(baseline: &ResourceSample, now: &ResourceSample, elapsed: Duration) -> Self {
        let gc_cycles = now.gc_cycles.saturating_sub(baseline.gc_cycles);
        let seconds = elapsed.as_secs_f64();
        MemoryDelta {
            allocated: now.allocated.saturating_sub(baseline.allocated),
            total_allocated: now.total_allocated.saturating_sub(baseline.total_allocated),
            system: now.system.saturating_sub(baseline.system),
            gc_cycles,
            gc_per_minute: if seconds > 0.0 {
                f64::from(gc_cycles) / seconds * 60.0
            } else {
                0.0
            },
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(millis(*duration))
}

// a panicking recorder must not take the whole aggregator down with it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
