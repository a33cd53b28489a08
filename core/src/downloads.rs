use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;

use crate::adapters::Subscription;

/// Partial-file suffixes browsers use while a download is in flight.
const PARTIAL_SUFFIXES: &[&str] = &["crdownload", "download", "part"];

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadFile {
    pub path: PathBuf,
    /// Expected final size; 0 when unknown. Browser partial files carry
    /// no total, so this is usually 0 and completion is detected by the
    /// partial file vanishing.
    pub total: u64,
    /// Latest sampled size.
    pub bytes: u64,
    pub progress: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadState {
    pub files: Vec<DownloadFile>,
    /// Set when the downloads directory cannot be read for lack of
    /// permission. Non-fatal; the UI layer decides whether to prompt.
    pub permission_denied: bool,
}

/// Watches the downloads directory for in-progress browser downloads by
/// periodic sampling. Completion is the partial file vanishing (renamed
/// to its final name) or reaching a known total.
pub struct DownloadWatcher {
    dir: PathBuf,
    files: Vec<DownloadFile>,
    permission_denied: bool,
}

impl DownloadWatcher {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            files: Vec::new(),
            permission_denied: false,
        }
    }

    /// One scan-and-sample pass; returns the state to publish.
    pub fn tick(&mut self) -> DownloadState {
        self.scan();
        self.sample();
        DownloadState {
            files: self.files.clone(),
            permission_denied: self.permission_denied,
        }
    }

    fn scan(&mut self) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                self.permission_denied = true;
                return;
            }
            Err(_) => return,
        };
        self.permission_denied = false;

        for entry in entries.flatten() {
            let path = entry.path();
            if !is_partial(&path) {
                continue;
            }
            if self.files.iter().any(|f| f.path == path) {
                continue;
            }

            log::debug!("Tracking download: {}", path.display());
            self.files.push(DownloadFile {
                path,
                total: 0,
                bytes: 0,
                progress: 0.0,
            });
        }
    }

    fn sample(&mut self) {
        self.files.retain_mut(|file| {
            let Ok(meta) = fs::metadata(&file.path) else {
                // renamed to its final name or deleted
                return false;
            };
            file.bytes = meta.len();
            if file.total > 0 {
                file.progress = (file.bytes as f64 / file.total as f64).min(1.0);
                if file.progress >= 1.0 {
                    return false;
                }
            }
            true
        });
    }
}

fn is_partial(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy();
            PARTIAL_SUFFIXES.iter().any(|suffix| ext == *suffix)
        })
        .unwrap_or(false)
}

/// Spawns the sampling loop. Dropping the subscription stops it; state is
/// republished only when it changes.
pub fn spawn(dir: PathBuf, period: Duration) -> (Subscription, watch::Receiver<DownloadState>) {
    let mut watcher = DownloadWatcher::new(dir);
    let (tx, rx) = watch::channel(DownloadState::default());

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let state = watcher.tick();
            if *tx.borrow() != state {
                if tx.send(state).is_err() {
                    break;
                }
            }
        }
    });

    (Subscription::from_handle(handle), rx)
}
