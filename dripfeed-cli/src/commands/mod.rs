mod cache;
mod download;
mod fetch;

pub use cache::run_cache;
pub use download::{DownloadArgs, run_download};
pub use fetch::{FetchArgs, run_fetch};
