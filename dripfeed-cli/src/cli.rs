use clap::{Parser, Subcommand};
use dripfeed::Priority;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Fetch, cache and download content over slow links",
    long_about = "A client for slow or unreliable networks.\n\
                  \n\
                  Resources fetched with `fetch` go through a prioritized loader backed by a\n\
                  two-tier cache, so repeated fetches are served locally. Files fetched with\n\
                  `download` are written through a resumable queue that survives interruptions\n\
                  and restarts."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Cache directory
    #[arg(
        long,
        global = true,
        help = "Directory holding the durable cache tier (default: system temp dir)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Cache budget with optional unit (B, KB, MB, GB, TB)
    #[arg(
        long,
        global = true,
        help = "Total cache budget with optional unit (B, KB, MB, GB, TB). Examples: \"50MB\", \"1GB\""
    )]
    pub cache_size: Option<String>,

    /// Overall timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "0",
        help = "Overall timeout in seconds for HTTP requests (0 disables it)"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "15",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Read timeout in seconds
    #[arg(
        long,
        global = true,
        default_value = "30",
        help = "Read timeout in seconds (maximum time between receiving data chunks)"
    )]
    pub read_timeout: u64,

    /// User agent
    #[arg(long, global = true, help = "User agent sent with every request")]
    pub user_agent: Option<String>,

    /// Custom HTTP headers
    #[arg(
        long = "header",
        short = 'H',
        global = true,
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load resources through the progressive loader and its cache
    Fetch {
        #[arg(required = true, help = "URL(s) to load")]
        urls: Vec<String>,

        #[arg(long, value_enum, default_value_t = Priority::Medium, help = "Priority lane for every URL")]
        priority: Priority,

        #[arg(long, help = "Bypass the cache for reads and writes")]
        no_cache: bool,

        #[arg(
            long,
            help = "Force chunked delivery and link prefetching for capable content"
        )]
        progressive: bool,

        #[arg(
            short,
            long,
            help = "Write the body to this file (only valid with a single URL)"
        )]
        output: Option<PathBuf>,

        #[arg(long, default_value = "120", help = "Seconds to wait for each load")]
        wait: u64,
    },

    /// Download files through the resumable download queue
    Download {
        #[arg(required = true, help = "URL(s) to download")]
        urls: Vec<String>,

        #[arg(
            short,
            long,
            help = "Directory where files are saved (default: system temp dir)"
        )]
        output_dir: Option<PathBuf>,

        #[arg(long, help = "Replace existing files instead of picking numbered names")]
        overwrite: bool,

        #[arg(long, default_value = "2", help = "Downloads transferring at once")]
        concurrency: usize,

        #[arg(long, default_value = "3", help = "Retry attempts for failed downloads")]
        retries: u32,

        #[arg(
            short = 'P',
            long = "progress",
            default_value = "false",
            help = "Show progress bars for downloads"
        )]
        show_progress: bool,
    },

    /// Inspect or maintain the cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// Print cache usage and hit statistics
    Stats,
    /// Remove every cached entry
    Clear,
    /// Remove entries older than the maximum age
    Clean,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch_with_globals() {
        let args = CliArgs::parse_from([
            "dripfeed",
            "--cache-size",
            "4MB",
            "fetch",
            "--priority",
            "high",
            "http://example.com/a.css",
            "-v",
        ]);
        assert!(args.verbose);
        assert_eq!(args.cache_size.as_deref(), Some("4MB"));
        match args.command {
            Command::Fetch {
                urls,
                priority,
                no_cache,
                ..
            } => {
                assert_eq!(urls, vec!["http://example.com/a.css"]);
                assert_eq!(priority, Priority::High);
                assert!(!no_cache);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_parse_cache_action() {
        let args = CliArgs::parse_from(["dripfeed", "cache", "clean"]);
        assert!(matches!(
            args.command,
            Command::Cache {
                action: CacheAction::Clean
            }
        ));
    }
}
