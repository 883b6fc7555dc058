use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::configuration::Error;

const DEBOUNCE: Duration = Duration::from_millis(100);
const KUBERNETES_DATA_LINK: &str = "..data";

/// Receives a notification once the watched files changed on disk.
pub trait ChangeNotifier: Send + Sync {
    fn notify_change(&self);
}

/// Watches a set of files through their parent directories, so both
/// in-place writes and the `..data` symlink swap of a Kubernetes secret or
/// configmap volume are seen.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    _handle: tokio::task::JoinHandle<()>,
}

impl FileWatcher {
    pub fn new<P: AsRef<Path>>(
        name: &str,
        files: &[P],
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Result<Self, Error> {
        let targets = files
            .iter()
            .map(|file| WatchTarget::new(file.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let (tx, rx) = mpsc::channel::<Event>(100);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        })?;

        let dirs = targets
            .iter()
            .map(|target| target.dir.clone())
            .collect::<HashSet<_>>();
        for dir in &dirs {
            info!("Watching {} for {name} changes", dir.display());
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }

        let name = name.to_string();
        let handle = tokio::spawn(async move {
            watch_loop(&name, rx, &targets, notifier.as_ref()).await;
        });

        Ok(Self {
            _watcher: watcher,
            _handle: handle,
        })
    }
}

struct WatchTarget {
    dir: PathBuf,
    file_name: OsString,
}

impl WatchTarget {
    fn new(file: &Path) -> Result<Self, Error> {
        let file_name = file
            .file_name()
            .ok_or_else(|| Error::Watcher(format!("Not a file: {}", file.display())))?
            .to_os_string();

        let dir = match file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let dir = std::fs::canonicalize(&dir).map_err(|e| {
            Error::Watcher(format!("Cannot watch directory {}: {e}", dir.display()))
        })?;

        Ok(Self { dir, file_name })
    }

    fn matches(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name() else {
            return false;
        };
        if file_name != self.file_name && file_name != KUBERNETES_DATA_LINK {
            return false;
        }

        path.parent()
            .map(|dir| std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf()))
            .is_some_and(|dir| dir == self.dir)
    }
}

async fn watch_loop(
    name: &str,
    mut rx: mpsc::Receiver<Event>,
    targets: &[WatchTarget],
    notifier: &dyn ChangeNotifier,
) {
    loop {
        let Some(event) = rx.recv().await else {
            debug!("{name} watcher channel closed");
            return;
        };

        if !is_relevant(&event, targets) {
            continue;
        }

        // editors and kubelet produce bursts of events for one change
        tokio::time::sleep(DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        debug!("{name} change detected: {:?}", event.paths);
        notifier.notify_change();
    }
}

fn is_relevant(event: &Event, targets: &[WatchTarget]) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|path| targets.iter().any(|target| target.matches(path)))
}
