use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {bytes}/{total_bytes} @ {bytes_per_sec}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// One bar per image URL, all drawn under a shared [`MultiProgress`].
#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
    disabled: bool,
}

impl ProgressManager {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: false,
        }
    }

    pub fn new_disabled(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: true,
        }
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<String, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start(&self, url: &str) {
        if self.disabled {
            return;
        }
        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(download_style());
        bar.set_message(format!("Loading {url}"));
        bar.enable_steady_tick(Duration::from_millis(500));
        self.bars().insert(url.to_string(), bar);
    }

    pub fn update(&self, url: &str, received: u64, expected: Option<u64>) {
        if self.disabled {
            return;
        }
        if let Some(bar) = self.bars().get(url) {
            if let Some(total) = expected {
                bar.set_length(total);
            }
            bar.set_position(received);
        }
    }

    pub fn finish(&self, url: &str, message: impl Into<String>) {
        if self.disabled {
            return;
        }
        if let Some(bar) = self.bars().remove(url) {
            bar.finish_with_message(format!("{url}: {}", message.into()));
        }
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indicatif::ProgressDrawTarget;

    #[test]
    fn test_bar_lifecycle() {
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        let progress = ProgressManager::new(multi);

        progress.start("http://x/a.png");
        progress.update("http://x/a.png", 10, Some(100));
        {
            let bars = progress.bars();
            let bar = bars.get("http://x/a.png").unwrap();
            assert_eq!(bar.position(), 10);
            assert_eq!(bar.length(), Some(100));
        }

        progress.finish("http://x/a.png", "done");
        assert!(progress.bars().is_empty());
    }

    #[test]
    fn test_disabled_manager_tracks_nothing() {
        let progress = ProgressManager::new_disabled(MultiProgress::new());
        progress.start("http://x/a.png");
        progress.update("http://x/a.png", 10, None);
        assert!(progress.is_disabled());
        assert!(progress.bars().is_empty());
    }
}
