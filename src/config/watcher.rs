use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{error, info};

use super::Config;

/// How often the config file's modification time is checked.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a change must settle before reloading, so a reload never
/// races an editor's partial write.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Watches the configuration file and invokes the callback with each
/// successfully parsed new version.
///
/// A reload that fails to parse, validate, or apply is logged and
/// ignored; the running configuration stays in effect. The returned task
/// is aborted at shutdown.
pub fn spawn<F>(path: PathBuf, on_change: F) -> JoinHandle<()>
where
    F: Fn(Config) -> anyhow::Result<()> + Send + 'static,
{
    tokio::spawn(async move {
        info!(file = %path.display(), "config_watcher_started");

        let mut last_seen = modified_at(&path);
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.tick().await;

        loop {
            tick.tick().await;

            let current = modified_at(&path);
            if current == last_seen {
                continue;
            }
            info!(file = %path.display(), "config_file_changed");

            // Wait out the write, then take whatever mtime it settled on.
            tokio::time::sleep(SETTLE_DELAY).await;
            last_seen = modified_at(&path);

            match Config::load(&path) {
                Ok(config) => match on_change(config) {
                    Ok(()) => info!("config_reloaded"),
                    Err(e) => error!(error = %e, "config_apply_failed"),
                },
                Err(e) => error!(error = %e, "config_reload_failed"),
            }
        }
    })
}

fn modified_at(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn reload_fires_once_per_change() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "backends:\n  - url: http://127.0.0.1:9001\n").unwrap();

        let reloads = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&reloads);
        let handle = spawn(path.clone(), move |config| {
            assert_eq!(config.backends.len(), 2);
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        // Give the watcher its baseline before touching the file.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(
            &path,
            "backends:\n  - url: http://127.0.0.1:9001\n  - url: http://127.0.0.1:9002\n",
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.abort();
        assert_eq!(reloads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalid_reload_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "backends:\n  - url: http://127.0.0.1:9001\n").unwrap();

        let reloads = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&reloads);
        let handle = spawn(path.clone(), move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        // No backends: fails validation, callback must not fire.
        std::fs::write(&path, "port: 9000\n").unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.abort();
        assert_eq!(reloads.load(Ordering::Relaxed), 0);
    }
}
