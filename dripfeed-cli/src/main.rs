use std::time::Duration;

use clap::Parser;
use dripfeed::{Engine, EngineConfig};
use error::AppError;
use indicatif::MultiProgress;
use tracing::{Level, debug, error, info};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod commands;
mod error;
mod utils;

use cli::{CliArgs, Command};
use commands::{DownloadArgs, FetchArgs};
use utils::progress::ProgressManager;
use utils::{format_bytes, parse_headers, parse_size};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("dripfeed.log")?;

    let multi_writer = MakeWriterExt::and(std::io::stdout, log_file);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(multi_writer)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    let headers = parse_headers(&args.headers);

    let mut builder = EngineConfig::builder()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_read_timeout(Duration::from_secs(args.read_timeout))
        .with_headers(headers.clone());
    if let Some(user_agent) = &args.user_agent {
        builder = builder.with_user_agent(user_agent);
    }
    if let Some(dir) = &args.cache_dir {
        builder = builder.with_cache_dir(dir);
    }
    if let Some(size) = &args.cache_size {
        let bytes = parse_size(size)?;
        info!("Cache budget: {}", format_bytes(bytes));
        builder = builder.with_cache_size(bytes);
    }

    info!(
        "HTTP timeout configuration: overall={}s, connect={}s, read={}s",
        args.timeout, args.connect_timeout, args.read_timeout
    );

    match args.command {
        Command::Fetch {
            urls,
            priority,
            no_cache,
            progressive,
            output,
            wait,
        } => {
            let engine = Engine::new(builder.build()).await?;
            let fetch = FetchArgs {
                urls,
                priority,
                no_cache,
                progressive,
                output,
                wait: Duration::from_secs(wait),
                headers,
            };
            commands::run_fetch(&engine, fetch).await
        }
        Command::Download {
            urls,
            output_dir,
            overwrite,
            concurrency,
            retries,
            show_progress,
        } => {
            builder = builder
                .with_download_concurrency(concurrency)
                .with_max_retries(retries);
            if let Some(dir) = output_dir {
                builder = builder.with_download_dir(dir);
            }
            let engine = Engine::new(builder.build()).await?;
            debug!(directory = ?engine.config().download.directory, "Download directory");
            let manager = engine.download_manager().await?;

            let multi = MultiProgress::new();
            let progress = if show_progress {
                ProgressManager::new(multi)
            } else {
                ProgressManager::new_disabled(multi)
            };
            let download = DownloadArgs {
                urls,
                overwrite,
                headers,
            };
            commands::run_download(&manager, &progress, download).await
        }
        Command::Cache { action } => {
            let engine = Engine::new(builder.build()).await?;
            commands::run_cache(engine.cache(), action).await
        }
    }
}
