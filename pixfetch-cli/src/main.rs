use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use error::AppError;
use indicatif::MultiProgress;
use pixfetch_engine::transport::Credentials;
use pixfetch_engine::{CacheConfig, CodecChain, DownloaderConfig, ImageManager, ProxyConfig};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

mod cli;
mod error;
mod output;
mod processor;
mod utils;

use cli::CliArgs;
use processor::FetchContext;
use utils::progress::ProgressManager;
use utils::{format_bytes, parse_headers, parse_size};

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>, AppError> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    Ok(guard)
}

fn proxy_settings(args: &CliArgs) -> Option<ProxyConfig> {
    if args.no_proxy {
        info!("All proxy settings disabled (--no-proxy flag)");
        return None;
    }
    let proxy_url = args.proxy.as_ref()?;

    let mut proxy = ProxyConfig::new(proxy_url.clone(), args.proxy_type);
    // Authentication only when both halves are present
    if let (Some(username), Some(password)) = (&args.proxy_user, &args.proxy_pass) {
        proxy = proxy.with_auth(username.clone(), password.clone());
    }

    info!(
        proxy_url = %proxy_url,
        proxy_type = ?args.proxy_type,
        has_auth = proxy.auth.is_some(),
        "Using explicit proxy configuration for downloads"
    );

    Some(proxy)
}

fn downloader_config(args: &CliArgs) -> Result<DownloaderConfig, AppError> {
    let headers = parse_headers(DownloaderConfig::get_default_headers(), &args.headers)?;

    let mut builder = DownloaderConfig::builder()
        .with_download_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_headers(headers)
        .with_max_concurrent_downloads(args.max_concurrent)
        .with_execution_order(args.execution_order);

    if let Some(username) = &args.user {
        builder = builder.with_credentials(Credentials {
            username: username.clone(),
            password: args.password.clone(),
        });
    }

    builder = match proxy_settings(args) {
        Some(proxy) => builder.with_proxy(proxy),
        None => builder.with_system_proxy(!args.no_proxy),
    };

    Ok(builder.build())
}

fn cache_config(args: &CliArgs) -> Result<CacheConfig, AppError> {
    Ok(CacheConfig {
        disk_cache_path: args.cache_dir.clone(),
        max_disk_cache_size: parse_size(&args.max_disk_cache)?,
        max_memory_cost: parse_size(&args.max_memory_cache)?,
        ..CacheConfig::default()
    })
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();
    let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

    if args.timeout == 0 {
        return Err(AppError::InvalidInput(
            "--timeout must be at least one second".to_string(),
        ));
    }

    let downloader_config = downloader_config(&args)?;
    let cache_config = cache_config(&args)?;
    let options = args.load_options();

    info!(
        "HTTP timeout configuration: request={}s, connect={}s, max_concurrent={}",
        args.timeout, args.connect_timeout, downloader_config.max_concurrent_downloads
    );
    info!(
        disk = %format_bytes(cache_config.max_disk_cache_size),
        memory = %format_bytes(cache_config.max_memory_cost),
        path = ?cache_config.disk_cache_path,
        "Cache configuration"
    );
    info!(?options, "Load options");

    let codecs = Arc::new(CodecChain::with_defaults());
    let manager = ImageManager::builder()
        .with_codecs(codecs.clone())
        .with_cache_config(cache_config)
        .with_downloader_config(downloader_config)
        .build();

    let multi = MultiProgress::new();
    let progress = if args.show_progress {
        ProgressManager::new(multi)
    } else {
        ProgressManager::new_disabled(multi)
    };

    let context = FetchContext {
        manager,
        codecs,
        options,
        output_dir: args.output_dir.clone(),
        progress,
    };

    let total = args.urls.len();
    let failed = processor::process_urls(&context, &args.urls).await;
    info!(total, failed, "Finished");

    if failed > 0 {
        return Err(AppError::Failed { failed, total });
    }
    Ok(())
}
