//! s3pipe CLI - Stream large files to and from S3
//!
//! Uploads and downloads run as concurrent multipart transfers with an MD5
//! checksum recorded next to every uploaded object.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// s3pipe - Fast, verified S3 transfers
#[derive(Parser)]
#[command(name = "s3pipe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format for the transfer summary
    #[arg(long, global = true, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Debug logging, including the cause chain of errors
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file or standard input to S3
    Up {
        #[command(flatten)]
        transfer: TransferArgs,

        /// Extra header sent with the upload, as "Name: value"
        #[arg(short = 'm', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },

    /// Download an object to a file or standard output
    Down {
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Options shared by uploads and downloads
#[derive(Args, Debug, Clone)]
struct TransferArgs {
    /// Bucket name
    #[arg(short, long)]
    bucket: String,

    /// Object key
    #[arg(short, long)]
    key: String,

    /// Local file; standard input or output when omitted
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Number of parts in flight at once
    #[arg(short, long, default_value_t = 20)]
    concurrency: usize,

    /// Initial part size, e.g. 20MB (decimal), 64MiB or 64M (binary), or a byte count
    #[arg(short = 's', long, default_value = "20MiB", value_parser = parse_size)]
    part_size: u64,

    /// Skip recording (upload) or verifying (download) the MD5 checksum
    #[arg(long)]
    md5_check_off: bool,

    /// Retries per part after the first attempt
    #[arg(long, default_value_t = 4)]
    retries: u32,

    /// Timeout in seconds for a single part request
    #[arg(long, default_value_t = 120)]
    part_timeout: u64,

    /// Timeout in seconds for the whole transfer
    #[arg(long)]
    timeout: Option<u64>,

    /// S3-compatible endpoint URL
    #[arg(long, env = "S3_ENDPOINT")]
    endpoint: Option<String>,

    /// Signing region
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Use path-style addressing (bucket in the path, not the host)
    #[arg(long)]
    path_style: bool,
}

/// Parse sizes like "20MB", "64MiB", "5G" or a plain byte count
///
/// "KB", "MB" and "GB" are decimal powers of 1000. "KiB", "MiB", "GiB" and
/// the bare "K", "M", "G" are powers of 1024.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid size: {:?}", s))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        other => return Err(format!("unknown size unit: {:?}", other)),
    };

    number
        .checked_mul(multiplier)
        .filter(|size| *size > 0)
        .ok_or_else(|| format!("size out of range: {:?}", s))
}

/// Parse a "Name: value" header
fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("header must look like \"Name: value\", got {:?}", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in {:?}", s));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn init_logging(verbose: bool, debug: bool) {
    let default_level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.debug);

    match cli.command {
        Commands::Up { transfer, headers } => {
            commands::upload(&transfer, headers, cli.output, cli.debug).await?
        }

        Commands::Down { transfer } => {
            commands::download(&transfer, cli.output, cli.debug).await?
        }

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "s3pipe", &mut std::io::stdout());
        }
    }

    Ok(())
}
