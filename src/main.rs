use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::runtime::{ Builder, Runtime };
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use loadshape::{ report, Config, Metrics, Runner };

const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            return ExitCode::from(2);
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("load test failed: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> anyhow::Result<()> {
    let runtime = get_runtime(config.worker_threads())?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc
        ::set_handler(move || {
            tracing::info!("interrupt received, stopping");
            on_interrupt.cancel();
        })
        .context("failed to install Ctrl+C handler")?;

    let metrics = Arc::new(Metrics::new());
    let runner = Runner::new(config.clone(), Arc::clone(&metrics))?;

    runtime.block_on(async {
        let stop_progress = CancellationToken::new();
        let progress = (!config.no_progress).then(|| {
            tokio::spawn(
                report::print_progress(Arc::clone(&metrics), PROGRESS_INTERVAL, stop_progress.clone())
            )
        });

        let result = runner.run(cancel).await;

        stop_progress.cancel();
        if let Some(progress) = progress {
            let _ = progress.await;
        }
        result
    })?;

    let snapshot = metrics.snapshot();
    if let Some(path) = report::write_report(&config, &snapshot).context("failed to write report")? {
        println!("Report written to {}", path.display());
    }
    Ok(())
}

/// Helper function to create the tokio runtime
fn get_runtime(threads: usize) -> anyhow::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")
}
