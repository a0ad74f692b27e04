//! Directory watching for new capture files.
//!
//! Files already present are listed in file-name order; afterwards the
//! `notify` watcher reports files created in (or renamed into) the
//! directory. Only `.pcap` and `.pcapng` files qualify.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};

/// True for paths with a `.pcap` or `.pcapng` extension.
pub fn is_capture_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pcap") || e.eq_ignore_ascii_case("pcapng"))
        .unwrap_or(false)
}

/// Capture files already in `dir`, sorted by file name.
pub fn existing_captures(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| watch_error(dir, e))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && is_capture_file(p))
        .collect();
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

/// Paths in a filesystem event that name a newly arrived capture file.
fn arrived(event: &notify::Event) -> Vec<PathBuf> {
    let candidates: &[PathBuf] = match event.kind {
        EventKind::Create(_) => &event.paths,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => &event.paths,
        // Both carries [from, to]; only the destination is new.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().map(std::slice::from_ref).unwrap_or(&[])
        }
        _ => &[],
    };
    candidates
        .iter()
        .filter(|p| is_capture_file(p))
        .cloned()
        .collect()
}

fn watch_error(dir: &Path, reason: impl ToString) -> PipelineError {
    PipelineError::WatchDirectory {
        path: dir.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Reports capture files arriving in a directory.
pub struct DirectoryWatcher {
    rx: mpsc::UnboundedReceiver<PathBuf>,
    queued: VecDeque<PathBuf>,
    // Dropping the watcher stops the event stream.
    _watcher: notify::RecommendedWatcher,
}

impl DirectoryWatcher {
    pub fn new(dir: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for path in arrived(&event) {
                    if tx.send(path).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Directory watcher error");
            }
        })
        .map_err(|e| watch_error(dir, e))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(dir, e))?;
        tracing::info!(dir = %dir.display(), "Watching directory for new captures");

        Ok(Self {
            rx,
            queued: VecDeque::new(),
            _watcher: watcher,
        })
    }

    /// Wait for the next arrived capture file. `None` once the watcher is
    /// gone.
    pub async fn next(&mut self) -> Option<PathBuf> {
        if let Some(path) = self.queued.pop_front() {
            return Some(path);
        }
        self.rx.recv().await
    }

    /// Drop already-reported events for `path`, keeping others queued in
    /// arrival order.
    pub fn coalesce(&mut self, path: &Path) {
        while let Ok(next) = self.rx.try_recv() {
            if next != path && !self.queued.contains(&next) {
                self.queued.push_back(next);
            }
        }
        self.queued.retain(|p| p != path);
    }
}
