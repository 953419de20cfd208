use dripfeed::AssetCache;
use tracing::info;

use crate::cli::CacheAction;
use crate::error::AppError;
use crate::utils::format_bytes;

pub async fn run_cache(cache: &AssetCache, action: CacheAction) -> Result<(), AppError> {
    match action {
        CacheAction::Stats => {
            let stats = cache.stats().await;
            info!("Cache directory: {}", cache.config().directory.display());
            info!("Entries:         {}", stats.entry_count);
            info!(
                "Usage:           {} of {}",
                format_bytes(stats.total_usage),
                format_bytes(cache.config().max_cache_size)
            );
            info!("  volatile:      {}", format_bytes(stats.volatile_usage));
            info!("  durable:       {}", format_bytes(stats.durable_usage));
            info!(
                "Hits / misses:   {} / {} ({:.1}%)",
                stats.hit_count,
                stats.miss_count,
                stats.hit_rate * 100.0
            );
            info!("Evictions:       {}", stats.eviction_count);
        }
        CacheAction::Clear => {
            cache.clear().await?;
            info!("Cache cleared");
        }
        CacheAction::Clean => {
            let removed = cache.clean_expired().await;
            info!(removed, "Removed expired entries");
        }
    }
    Ok(())
}
