//! Process-wide [`ImageManager`], installed once at startup.

use std::sync::OnceLock;

use crate::manager::ImageManager;

static SHARED: OnceLock<ImageManager> = OnceLock::new();

/// Install the process-wide manager. Fails with the rejected manager if one
/// was already installed.
pub fn install(manager: ImageManager) -> Result<(), ImageManager> {
    SHARED.set(manager)
}

/// The installed manager, if any.
pub fn shared() -> Option<&'static ImageManager> {
    SHARED.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_once() {
        let dir = tempfile::tempdir().unwrap();
        let build = || {
            ImageManager::builder()
                .with_cache_config(crate::CacheConfig {
                    disk_cache_path: Some(dir.path().to_path_buf()),
                    ..Default::default()
                })
                .build()
        };

        assert!(install(build()).is_ok());
        assert!(install(build()).is_err());
        assert!(shared().is_some_and(|manager| !manager.is_running()));
    }
}
