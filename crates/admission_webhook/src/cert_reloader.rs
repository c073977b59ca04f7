use anyhow::Result;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Watches the mounted certificate directory and raises a flag when the key
/// pair is rewritten. One watcher outlives every server restart; reading the
/// flag consumes it.
pub struct CertWatcher {
    changed: Arc<AtomicBool>,
}

impl CertWatcher {
    pub fn start(cert_dir: &str) -> Self {
        let changed = Arc::new(AtomicBool::new(false));
        let flag = changed.clone();
        let cert_dir = cert_dir.to_string();

        tokio::spawn(async move {
            if let Err(e) = watch_certificates(&cert_dir, flag).await {
                error!("Certificate watcher failed: {}", e);
            }
        });

        Self { changed }
    }

    /// True once per certificate rotation
    pub fn take_change(&self) -> bool {
        self.changed.swap(false, Ordering::Relaxed)
    }
}

async fn watch_certificates(cert_dir: &str, changed: Arc<AtomicBool>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(100);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Err(e) = tx.blocking_send(res) {
                error!("Failed to send file watcher event: {}", e);
            }
        },
        Config::default(),
    )?;

    watcher.watch(Path::new(cert_dir), RecursiveMode::Recursive)?;
    info!("Started watching certificate directory: {}", cert_dir);

    while let Some(event_result) = rx.recv().await {
        match event_result {
            Ok(event) => {
                // Secret mounts update through symlink swaps, so match on the
                // file names rather than event kinds
                let involves_cert_files = event.paths.iter().any(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name == "tls.crt" || name == "tls.key")
                        .unwrap_or(false)
                });

                if involves_cert_files {
                    info!("Certificate files changed - signaling server restart");
                    changed.store(true, Ordering::Relaxed);
                }
            }
            Err(e) => {
                warn!("File watcher error: {}", e);
            }
        }
    }

    Ok(())
}
