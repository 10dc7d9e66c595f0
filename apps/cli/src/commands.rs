//! CLI command implementations

use crate::output::{format_bytes, print_output};
use crate::progress::TransferProgress;
use crate::{OutputFormat, TransferArgs};
use anyhow::{anyhow, Context, Result};
use console::style;
use s3pipe_core::{
    Credentials, LocalTarget, S3Config, S3Store, TransferEngine, TransferError, TransferRequest,
};
use s3pipe_types::{Direction, ObjectRef, PartSizePolicy, TransferConfig, TransferReport};
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

// ============================================================================
// Transfer Commands
// ============================================================================

pub async fn upload(
    args: &TransferArgs,
    headers: Vec<(String, String)>,
    format: OutputFormat,
    debug: bool,
) -> Result<()> {
    let mut config = build_config(args, Direction::Upload);
    config.headers = headers;
    run(args, config, format, debug).await
}

pub async fn download(args: &TransferArgs, format: OutputFormat, debug: bool) -> Result<()> {
    let config = build_config(args, Direction::Download);
    run(args, config, format, debug).await
}

fn build_config(args: &TransferArgs, direction: Direction) -> TransferConfig {
    let mut config = TransferConfig::new(
        direction,
        ObjectRef::new(args.bucket.clone(), args.key.clone()),
    );
    config.concurrency = args.concurrency;
    config.part_size = PartSizePolicy::with_initial(args.part_size);
    config.verify_checksum = !args.md5_check_off;
    config.retry.max_attempts = args.retries.saturating_add(1);
    config.retry.attempt_timeout = Duration::from_secs(args.part_timeout);
    config.deadline = args.timeout.map(Duration::from_secs);
    config
}

async fn run(
    args: &TransferArgs,
    config: TransferConfig,
    format: OutputFormat,
    debug: bool,
) -> Result<()> {
    let direction = config.direction;
    let local = match &args.file {
        Some(path) => LocalTarget::Path(path.clone()),
        None => LocalTarget::Stdio,
    };
    // Downloads to stdout keep stdout for the object bytes
    let data_on_stdout = direction == Direction::Download && local == LocalTarget::Stdio;

    let store = S3Store::new(s3_config(args)?).context("Failed to create S3 client")?;
    let engine = TransferEngine::new(Arc::new(store));

    let mut rx = engine.subscribe();
    let mut progress = TransferProgress::new(direction, &config.object);
    let progress_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(update) => progress.handle_event(&update.event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Progress display skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        progress.finish();
    });

    let result = engine.run(TransferRequest { config, local: local.clone() }).await;

    // Dropping the engine closes the event channel and ends the progress task
    drop(engine);
    let _ = progress_task.await;

    match result {
        Ok(report) => {
            let elapsed = report.elapsed().to_std().unwrap_or_default();
            info!("Duration: {:?}", elapsed);
            if report.checksum.is_degraded() {
                warn!("{} was stored without a checksum record", report.object);
            }
            print_report(&report, format, data_on_stdout, elapsed)
        }
        Err(e) => {
            report_failure(&e, &local, debug);
            Err(e.into())
        }
    }
}

fn s3_config(args: &TransferArgs) -> Result<S3Config> {
    Ok(S3Config {
        endpoint: args.endpoint.clone(),
        region: args.region.clone(),
        path_style: args.path_style,
        credentials: credentials_from_env()?,
    })
}

/// Read credentials from the standard AWS variables, or their legacy names
fn credentials_from_env() -> Result<Credentials> {
    let access_key = env_any(&["AWS_ACCESS_KEY_ID", "AWS_ACCESS_KEY"])
        .ok_or_else(|| anyhow!("AWS_ACCESS_KEY_ID is not set"))?;
    let secret_key = env_any(&["AWS_SECRET_ACCESS_KEY", "AWS_SECRET_KEY"])
        .ok_or_else(|| anyhow!("AWS_SECRET_ACCESS_KEY is not set"))?;

    Ok(Credentials {
        access_key,
        secret_key,
        session_token: env_any(&["AWS_SESSION_TOKEN"]),
    })
}

fn env_any(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.is_empty())
}

fn print_report(
    report: &TransferReport,
    format: OutputFormat,
    data_on_stdout: bool,
    elapsed: Duration,
) -> Result<()> {
    if format == OutputFormat::Human {
        let rate = if elapsed.as_secs_f64() > 0.0 {
            format!(
                "{}/s",
                format_bytes((report.bytes as f64 / elapsed.as_secs_f64()) as u64)
            )
        } else {
            "-".to_string()
        };
        let line = format!(
            "{} {} {} in {:.1}s ({})",
            style("✓").green().bold(),
            format_bytes(report.bytes),
            match report.direction {
                Direction::Upload => "uploaded",
                Direction::Download => "downloaded",
            },
            elapsed.as_secs_f64(),
            rate
        );
        if data_on_stdout {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
    }
    print_output(report, format, data_on_stdout)
}

fn report_failure(err: &TransferError, local: &LocalTarget, debug: bool) {
    error!("Transfer failed: {}", err);

    if err.output_invalid() {
        match local {
            LocalTarget::Path(path) => {
                error!("{} does not match the stored checksum; do not use it", path.display())
            }
            LocalTarget::Stdio => {
                error!("The data written to standard output does not match the stored checksum")
            }
        }
    }

    if debug {
        let mut source = err.source();
        while let Some(cause) = source {
            debug!("Caused by: {}", cause);
            source = cause.source();
        }
    }
}
