use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use pixfetch_engine::{CodecChain, Completion, ImageFormat, ImageManager, LoadEvent, LoadOptions};
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::output::{file_name_for, write_image};
use crate::utils::format_bytes;
use crate::utils::progress::ProgressManager;

/// Shared state for one run over the command line URLs.
pub struct FetchContext {
    pub manager: ImageManager,
    pub codecs: Arc<CodecChain>,
    pub options: LoadOptions,
    pub output_dir: Option<PathBuf>,
    pub progress: ProgressManager,
}

/// Load every URL concurrently. Returns the number of failures.
pub async fn process_urls(context: &FetchContext, urls: &[String]) -> usize {
    let loads = urls
        .iter()
        .enumerate()
        .map(|(index, url)| process_url(context, index, url));

    let results = join_all(loads).await;

    let mut failed = 0;
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(Some(path)) => info!(url = %url, path = %path.display(), "Saved image"),
            Ok(None) => {}
            Err(e) => {
                failed += 1;
                error!(url = %url, error = %e, "Failed to load image");
            }
        }
    }
    failed
}

async fn process_url(
    context: &FetchContext,
    index: usize,
    url: &str,
) -> Result<Option<PathBuf>, AppError> {
    let mut handle = context.manager.load(url, context.options);
    context.progress.start(url);

    let mut completion: Option<Completion> = None;
    while let Some(event) = handle.next().await {
        match event {
            LoadEvent::Progress { received, expected } => {
                if context.progress.is_disabled() {
                    debug!(url = %url, received, ?expected, "Progress");
                }
                context.progress.update(url, received, expected);
            }
            LoadEvent::Completed(interim) if !interim.finished => {
                debug!(
                    url = %url,
                    cache_type = ?interim.cache_type(),
                    "Interim image delivered"
                );
            }
            LoadEvent::Completed(done) => {
                completion = Some(done);
                break;
            }
        }
    }

    let Some(completion) = completion else {
        context.progress.finish(url, "cancelled");
        return Err(AppError::Fetch(pixfetch_engine::FetchError::Cancelled));
    };

    let loaded = match completion.result {
        Ok(loaded) => loaded,
        Err(e) => {
            context.progress.finish(url, "failed");
            return Err(e.into());
        }
    };

    let Some(image) = loaded.image else {
        context.progress.finish(url, "not cached");
        return Err(AppError::NotCached(url.to_string()));
    };

    info!(
        url = %url,
        width = image.width(),
        height = image.height(),
        frames = image.frame_count(),
        cache_type = ?loaded.cache_type,
        not_modified = loaded.not_modified,
        "Loaded image"
    );
    context.progress.finish(url, "done");

    let Some(output_dir) = context.output_dir.as_deref() else {
        return Ok(None);
    };

    let data = match loaded.data {
        Some(data) => data,
        None => {
            let format = match image.format() {
                ImageFormat::Undefined => ImageFormat::Png,
                format => format,
            };
            context
                .codecs
                .encode(&image, format)
                .map_err(|e| AppError::Encode(e.to_string()))?
        }
    };

    let format = ImageFormat::detect(&data);
    let path = save(output_dir, &file_name_for(url, index, format), &data).await?;
    Ok(Some(path))
}

async fn save(dir: &Path, file_name: &str, data: &[u8]) -> Result<PathBuf, AppError> {
    if let Ok(metadata) = tokio::fs::metadata(dir.join(file_name)).await {
        warn!(
            file = file_name,
            previous_size = %format_bytes(metadata.len()),
            "Overwriting existing file"
        );
    }
    let path = write_image(dir, file_name, data).await?;
    debug!(path = %path.display(), size = %format_bytes(data.len() as u64), "Wrote image");
    Ok(path)
}
