use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;

/// Command-line overrides. Anything not given keeps its environment value.
#[derive(Parser, Debug, Default)]
#[command(
    name = "bulk-uploader",
    version,
    about = "Fetch remote video files and republish them to YouTube in bulk"
)]
pub struct Cli {
    /// Address to bind (HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (PORT)
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Public origin for the OAuth callback (BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Uploads running at once (MAX_CONCURRENT_UPLOADS)
    #[arg(long)]
    pub max_concurrent_uploads: Option<usize>,

    /// Items accepted per submission (MAX_BULK_ITEMS)
    #[arg(long)]
    pub max_bulk_items: Option<usize>,

    /// Cap on jobs kept in memory (MAX_RETAINED_JOBS)
    #[arg(long)]
    pub max_retained_jobs: Option<usize>,

    /// Directory for staged downloads (STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Directory of browser assets (STATIC_DIR)
    #[arg(long)]
    pub static_dir: Option<PathBuf>,

    /// Directory for log files (LOG_DIR)
    #[arg(long)]
    pub log_dir: Option<String>,
}

impl Cli {
    pub fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(base_url) = self.base_url {
            config.base_url = Some(base_url.trim_end_matches('/').to_string());
        }
        if let Some(max) = self.max_concurrent_uploads {
            config.max_concurrent_uploads = max;
        }
        if let Some(max) = self.max_bulk_items {
            config.max_bulk_items = max;
        }
        if let Some(max) = self.max_retained_jobs {
            config.max_retained_jobs = Some(max);
        }
        if let Some(dir) = self.staging_dir {
            config.staging_dir = dir;
        }
        if let Some(dir) = self.static_dir {
            config.static_dir = dir;
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = dir;
        }
    }
}
