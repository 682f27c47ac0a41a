use clap::Parser;
use pixfetch_engine::{ExecutionOrder, LoadOptions, ProxyType};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Image download and cache tool",
    long_about = "Fetches images over HTTP, decodes them and keeps them in a two-tier\n\
                  memory and disk cache. Repeated runs against the same cache directory\n\
                  are answered from disk without touching the network.\n\
                  \n\
                  Every URL is loaded concurrently; identical URLs share one transfer."
)]
pub struct CliArgs {
    /// Image URL(s) to load
    #[arg(required = true, help = "URL(s) of the images to load")]
    pub urls: Vec<String>,

    /// Output directory for fetched images
    #[arg(
        short,
        long,
        help = "Directory where fetched images are written (nothing is written when omitted)"
    )]
    pub output_dir: Option<PathBuf>,

    /// Disk cache directory
    #[arg(
        long,
        help = "Directory for the disk cache (default: a pixfetch directory under the system temp dir)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Maximum disk cache size with optional unit (B, KB, MB, GB, TB)
    #[arg(
        long,
        default_value = "500MB",
        help = "Maximum size of the disk cache with optional unit (B, KB, MB, GB, TB). Use 0 to disable the disk cache."
    )]
    pub max_disk_cache: String,

    /// Maximum memory cache size with optional unit
    #[arg(
        long,
        default_value = "100MB",
        help = "Maximum decoded pixel bytes kept in memory with optional unit. Use 0 to disable the memory cache."
    )]
    pub max_memory_cache: String,

    #[arg(long, help = "Keep fetched images in memory only, never write them to the disk cache")]
    pub memory_only: bool,

    #[arg(long, help = "Revalidate cached images against the server")]
    pub refresh: bool,

    #[arg(long, help = "Retry URLs that failed earlier in this run")]
    pub retry_failed: bool,

    #[arg(long, help = "Decode images progressively while they download")]
    pub progressive: bool,

    #[arg(long, help = "Scale images above the decoded pixel budget down")]
    pub scale_down: bool,

    #[arg(long, help = "Only answer from the cache, never hit the network")]
    pub from_cache_only: bool,

    /// Request timeout in seconds
    #[arg(
        long,
        default_value = "15",
        help = "Timeout in seconds for each image request"
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    #[arg(
        long,
        default_value = "6",
        help = "Maximum number of transfers running at once"
    )]
    pub max_concurrent: usize,

    #[arg(
        long,
        value_enum,
        default_value_t = ExecutionOrder::Fifo,
        help = "Order in which queued transfers are started"
    )]
    pub execution_order: ExecutionOrder,

    /// Custom HTTP headers for image requests
    #[arg(
        long = "header",
        short = 'H',
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    #[arg(
        long,
        help = "Proxy server URL for downloads (e.g., \"http://proxy.example.com:8080\")"
    )]
    pub proxy: Option<String>,

    #[arg(
        long,
        value_enum,
        default_value_t = ProxyType::Http,
        help = "Proxy type"
    )]
    pub proxy_type: ProxyType,

    #[arg(long, help = "Username for proxy authentication")]
    pub proxy_user: Option<String>,

    #[arg(long, help = "Password for proxy authentication")]
    pub proxy_pass: Option<String>,

    /// Disable all proxy settings for downloads
    #[arg(
        long,
        help = "Disable all proxy settings (including system proxy) for downloads"
    )]
    pub no_proxy: bool,

    #[arg(long, help = "Username sent when a server asks for authentication")]
    pub user: Option<String>,

    #[arg(long, requires = "user", help = "Password sent along with --user")]
    pub password: Option<String>,

    /// Show progress bars for downloads
    #[arg(
        short = 'P',
        long = "progress",
        default_value = "false",
        help = "Show a progress bar per image"
    )]
    pub show_progress: bool,

    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    #[arg(long, help = "Also write logs to this file")]
    pub log_file: Option<PathBuf>,
}

impl CliArgs {
    /// Load options selected by the flags.
    pub fn load_options(&self) -> LoadOptions {
        let flags = [
            (self.memory_only, LoadOptions::CACHE_MEMORY_ONLY),
            (self.refresh, LoadOptions::REFRESH_CACHED),
            (self.retry_failed, LoadOptions::RETRY_FAILED),
            (self.progressive, LoadOptions::PROGRESSIVE_DOWNLOAD),
            (self.scale_down, LoadOptions::SCALE_DOWN_LARGE_IMAGES),
            (self.from_cache_only, LoadOptions::FROM_CACHE_ONLY),
        ];

        flags
            .into_iter()
            .filter(|(enabled, _)| *enabled)
            .fold(LoadOptions::empty(), |options, (_, flag)| options | flag)
    }
}
