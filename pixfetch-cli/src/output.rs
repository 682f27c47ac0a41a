use std::path::{Path, PathBuf};

use pixfetch_engine::ImageFormat;
use url::Url;

use crate::error::AppError;

fn extension(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Jpeg => "jpg",
        ImageFormat::Png => "png",
        ImageFormat::Gif => "gif",
        ImageFormat::Tiff => "tiff",
        ImageFormat::Webp => "webp",
        ImageFormat::Heic => "heic",
        ImageFormat::Undefined => "bin",
    }
}

/// File name for the `index`-th URL: its last path segment with unsafe
/// characters replaced, or `image-<index>` when the path is empty.
pub fn file_name_for(url: &str, index: usize, format: ImageFormat) -> String {
    let segment = Url::parse(url).ok().and_then(|url| {
        url.path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_owned))
            .filter(|segment| !segment.is_empty())
    });

    let stem = match segment {
        Some(segment) => segment
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>(),
        None => format!("image-{index}"),
    };

    if Path::new(&stem).extension().is_some() {
        stem
    } else {
        format!("{stem}.{}", extension(format))
    }
}

/// Write `data` into `dir`, creating the directory when missing.
pub async fn write_image(dir: &Path, file_name: &str, data: &[u8]) -> Result<PathBuf, AppError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, data).await?;
    Ok(path)
}
