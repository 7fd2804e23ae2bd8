use std::fmt;
use std::fs;
use std::io::{ self, Write };
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ Config, ReportFormat, TestType };
use crate::metrics::{ LatencySummary, Metrics, Snapshot, NO_STATUS };

const FIELD_WIDTH: usize = 18; // width of each label column
const RULE_WIDTH: usize = 80;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Human-readable report, rendered through `Display`.
pub struct TextReport<'a> {
    pub config: &'a Config,
    pub snapshot: &'a Snapshot,
}

impl fmt::Display for TextReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.snapshot;
        let c = self.config;

        writeln!(f, "{}", "=".repeat(RULE_WIDTH))?;
        writeln!(f, "LOAD TEST REPORT")?;
        writeln!(f, "{}\n", "=".repeat(RULE_WIDTH))?;

        section(f, "Test Timestamps")?;
        field(f, "Start Time:", s.start_time.format(TIMESTAMP_FORMAT))?;
        field(f, "End Time:", s.end_time.format(TIMESTAMP_FORMAT))?;
        field(f, "Duration:", format_duration(s.duration))?;
        writeln!(f)?;

        section(f, "Test Configuration")?;
        field(f, "Test Type:", c.test_type)?;
        field(f, "Server Addr:", &c.server_addr)?;
        field(f, "Concurrent:", c.concurrency)?;
        field(f, "Target RPS:", c.target_rps)?;
        if c.test_type == TestType::Spike {
            field(f, "Spike RPS:", c.spike_rps)?;
            field(f, "Spike Duration:", format_duration(c.spike_duration))?;
        }
        writeln!(f)?;

        section(f, "Request Statistics")?;
        field(f, "Total Requests:", s.total_requests)?;
        field(
            f,
            "Success Requests:",
            format!("{} ({:.2}%)", s.success_requests, percent(s.success_requests, s.total_requests))
        )?;
        field(f, "Error Requests:", format!("{} ({:.2}%)", s.error_requests, s.error_rate))?;
        writeln!(f)?;

        section(f, "Throughput")?;
        field(f, "Current RPS:", s.current_rps)?;
        field(f, "Average RPS:", format!("{:.2}", s.average_rps))?;
        writeln!(f)?;

        section(f, "Latency")?;
        match &s.latency {
            Some(latency) => write_latency(f, latency)?,
            None => writeln!(f, "  No latency data available")?,
        }
        writeln!(f)?;

        if !s.errors_by_status.is_empty() {
            section(f, "Error Breakdown")?;
            for (status, count) in &s.errors_by_status {
                if *status == NO_STATUS {
                    writeln!(f, "  no response: {} requests", count)?;
                } else {
                    writeln!(f, "  {}: {} requests", status, count)?;
                }
            }
            writeln!(f)?;
        }

        section(f, "Memory Statistics")?;
        field(f, "Allocated:", format_bytes(s.memory.allocated))?;
        field(f, "Peak Alloc:", format_bytes(s.memory.total_allocated))?;
        field(f, "Virtual:", format_bytes(s.memory.system))?;
        field(f, "GC Cycles:", s.memory.gc_cycles)?;
        field(f, "GC Rate:", format!("{:.2} cycles/min", s.memory.gc_per_minute))?;
        writeln!(f)?;

        writeln!(f, "{}", "=".repeat(RULE_WIDTH))
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    test_type: &'static str,
    server_addr: &'a str,
    concurrency: usize,
    target_rps: u32,
    #[serde(flatten)]
    metrics: &'a Snapshot,
}

pub fn render_json(config: &Config, snapshot: &Snapshot) -> serde_json::Result<String> {
    serde_json::to_string_pretty(
        &(JsonReport {
            test_type: config.test_type.as_str(),
            server_addr: &config.server_addr,
            concurrency: config.concurrency,
            target_rps: config.target_rps,
            metrics: snapshot,
        })
    )
}

/// Write the final report in the configured format. Returns the file written, if any.
pub fn write_report(config: &Config, snapshot: &Snapshot) -> io::Result<Option<PathBuf>> {
    let rendered = match config.report_format {
        ReportFormat::Text => (TextReport { config, snapshot }).to_string(),
        ReportFormat::Json => render_json(config, snapshot)? + "\n",
    };

    match config.report_path() {
        Some(path) => {
            fs::write(&path, rendered)?;
            Ok(Some(path))
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(rendered.as_bytes())?;
            stdout.flush()?;
            Ok(None)
        }
    }
}

/// One-line progress summary, redrawn in place.
pub fn progress_line(snapshot: &Snapshot) -> String {
    let p95 = snapshot.latency
        .as_ref()
        .map(|l| format_duration(l.p95))
        .unwrap_or_else(|| "-".to_string());

    format!(
        "[{}] [{}] Requests: {} | RPS: {:.2} | Errors: {} ({:.2}%) | Latency P95: {}",
        Local::now().format("%H:%M:%S"),
        format_duration(snapshot.duration),
        snapshot.total_requests,
        snapshot.average_rps,
        snapshot.error_requests,
        snapshot.error_rate,
        p95
    )
}

/// Print a progress line every `every` until `stop` fires.
pub async fn print_progress(metrics: Arc<Metrics>, every: Duration, stop: CancellationToken) {
    // ANSI: return to start of line and clear it
    const REDRAW: &str = "\r\x1b[K";

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                println!();
                return;
            }
            _ = ticker.tick() => {
                print!("{}{}", REDRAW, progress_line(&metrics.snapshot()));
                let _ = io::stdout().flush(); // ensure the output is displayed immediately
            }
        }
    }
}

/*---------= Formatting helpers =----------*/

fn section(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
    writeln!(f, "{}:", title)?;
    writeln!(f, "{}", "-".repeat(RULE_WIDTH))
}

fn field(f: &mut fmt::Formatter<'_>, label: &str, value: impl fmt::Display) -> fmt::Result {
    writeln!(f, "  {:<width$}{}", label, value, width = FIELD_WIDTH)
}

fn write_latency(f: &mut fmt::Formatter<'_>, latency: &LatencySummary) -> fmt::Result {
    field(f, "Min:", format_duration(latency.min))?;
    field(f, "Mean:", format_duration(latency.mean))?;
    field(f, "Stdev:", format_duration(latency.stdev))?;
    field(f, "P50:", format_duration(latency.p50))?;
    field(f, "P95:", format_duration(latency.p95))?;
    field(f, "P99:", format_duration(latency.p99))?;
    field(f, "P99.9:", format_duration(latency.p999))?;
    field(f, "Max:", format_duration(latency.max))?;

    writeln!(f)?;
    writeln!(f, "  {:<15} {:<15} {:>10}", "Range (ms)", "Upper Bound", "Requests")?;
    for bucket in &latency.histogram {
        writeln!(f, "  {:<15.2} {:<15.2} {:>10}", bucket.lower_ms, bucket.upper_ms, bucket.count)?;
    }
    Ok(())
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64) / (total as f64) * 100.0
    }
}

/// Pick a unit so the figure stays readable: ns, µs, ms, then seconds.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos() as f64;
    if d < Duration::from_micros(1) {
        format!("{:.2}ns", nanos)
    } else if d < Duration::from_millis(1) {
        format!("{:.2}µs", nanos / 1_000.0)
    } else if d < Duration::from_secs(1) {
        format!("{:.2}ms", nanos / 1_000_000.0)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.2} {}B", (bytes as f64) / (div as f64), ['K', 'M', 'G', 'T', 'P', 'E'][exp])
}
