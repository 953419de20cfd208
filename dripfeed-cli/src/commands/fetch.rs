use std::path::PathBuf;
use std::time::Duration;

use dripfeed::{Engine, LoadOptions, Priority};
use reqwest::header::HeaderMap;
use tracing::{error, info};

use crate::error::AppError;
use crate::utils::format_bytes;

pub struct FetchArgs {
    pub urls: Vec<String>,
    pub priority: Priority,
    pub no_cache: bool,
    pub progressive: bool,
    pub output: Option<PathBuf>,
    pub wait: Duration,
    pub headers: HeaderMap,
}

/// Queue every URL on the loader, then report each result in order
pub async fn run_fetch(engine: &Engine, args: FetchArgs) -> Result<(), AppError> {
    if args.output.is_some() && args.urls.len() != 1 {
        return Err(AppError::InvalidInput(
            "--output needs exactly one URL".to_string(),
        ));
    }

    let loader = engine.loader();
    let mut ids = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let options = LoadOptions::new()
            .with_priority(args.priority)
            .no_cache(args.no_cache)
            .force_progressive(args.progressive)
            .with_headers(args.headers.clone());
        ids.push(loader.load(url.as_str(), options).await?);
    }

    let mut failed = 0;
    for (url, id) in args.urls.iter().zip(ids) {
        match loader.wait_for_load(id, args.wait).await {
            Ok(result) => {
                info!(
                    url = %result.url,
                    size = %format_bytes(result.total_bytes),
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    from_cache = result.from_cache,
                    streamed = result.streamed,
                    content_type = result.content_type.as_deref().unwrap_or("unknown"),
                    "Fetched"
                );
                if let Some(output) = &args.output {
                    tokio::fs::write(output, &result.content).await?;
                    info!(path = %output.display(), "Wrote body");
                }
            }
            Err(e) => {
                failed += 1;
                error!(%url, error = %e, "Fetch failed");
            }
        }
    }

    let stats = loader.get_stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        cache_hits = stats.cache_hits,
        loaded = %format_bytes(stats.bytes_loaded),
        "Loader finished"
    );
    engine.cache().flush().await;

    if failed > 0 {
        return Err(AppError::Incomplete {
            failed,
            total: args.urls.len(),
        });
    }
    Ok(())
}
