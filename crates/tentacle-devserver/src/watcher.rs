//! Source tree watching with per-path debounce
//!
//! Every accepted directory gets its own non-recursive watch, so skipped
//! trees such as `ui/node_modules` never consume watch descriptors.
//! Directories created later are added as their create events arrive.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tentacle_core::{Error, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Directory names never watched
const SKIPPED_DIRS: &[&str] = &["vendor", "node_modules"];

/// Per-path debounce: every event for a path restarts that path's timer,
/// and a path settles once it has been quiet for the whole window
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    /// Debouncer with the given quiet window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record an event for `path` at `now`
    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path, now + self.window);
    }

    /// Earliest instant at which some path settles
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every path settled at `now`
    pub fn take_settled(&mut self, now: Instant) -> Vec<PathBuf> {
        let mut settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &settled {
            self.pending.remove(path);
        }
        settled.sort();
        settled
    }

    /// Whether any path is waiting
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Whether `path` lies outside hidden, vendor and node_modules directories
/// below `root`
pub fn should_watch(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().all(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_ref())
        }
        _ => true,
    })
}

/// Whether a change to `path` can affect the Go build
pub fn is_go_source(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some("go.mod") | Some("go.sum") => true,
        Some(name) => name.ends_with(".go"),
        None => false,
    }
}

/// Per-directory watches over the accepted part of a tree
struct TreeWatch {
    root: PathBuf,
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
}

impl std::fmt::Debug for TreeWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeWatch")
            .field("root", &self.root)
            .field("watched", &self.watched.len())
            .finish_non_exhaustive()
    }
}

impl TreeWatch {
    fn new(root: PathBuf, watcher: RecommendedWatcher) -> Self {
        Self {
            root,
            watcher,
            watched: HashSet::new(),
        }
    }

    /// Watch `dir` and every accepted directory below it.
    ///
    /// Returns the Go sources already present in newly watched
    /// directories. Only a failure to watch the root is an error.
    fn add(&mut self, dir: &Path) -> notify::Result<Vec<PathBuf>> {
        let mut sources = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            if !should_watch(&self.root, &dir) || self.watched.contains(&dir) {
                continue;
            }
            if let Err(e) = self.watcher.watch(&dir, RecursiveMode::NonRecursive) {
                if dir == self.root {
                    return Err(e);
                }
                warn!(dir = %dir.display(), error = %e, "Failed to watch directory");
                continue;
            }
            match std::fs::read_dir(&dir) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        match entry.file_type() {
                            Ok(kind) if kind.is_dir() => stack.push(path),
                            Ok(_) if is_go_source(&path) => sources.push(path),
                            _ => {}
                        }
                    }
                }
                Err(e) => debug!(dir = %dir.display(), error = %e, "Failed to list directory"),
            }
            self.watched.insert(dir);
        }
        Ok(sources)
    }

    fn forget(&mut self, path: &Path) {
        if self.watched.remove(path) {
            // The kernel drops watches on deleted directories by itself
            let _ = self.watcher.unwatch(path);
        }
    }

    #[cfg(test)]
    fn is_watched(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }
}

/// Watches a source tree and delivers debounced batches of changed files
#[derive(Debug)]
pub struct SourceWatcher {
    root: PathBuf,
    debounce: Duration,
}

impl SourceWatcher {
    /// Watcher over `root`
    pub fn new(root: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            root: root.into(),
            debounce,
        }
    }

    /// Start watching.
    ///
    /// Settled batches of changed Go sources arrive on the returned
    /// receiver until `token` is cancelled.
    pub fn start(self, token: CancellationToken) -> Result<mpsc::Receiver<Vec<PathBuf>>> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            Config::default(),
        )
        .map_err(|e| Error::internal(format!("failed to create file watcher: {e}")))?;

        let mut tree = TreeWatch::new(self.root.clone(), watcher);
        tree.add(&self.root).map_err(|e| {
            Error::internal(format!(
                "failed to watch {}: {e}",
                self.root.display()
            ))
        })?;

        info!(
            root = %self.root.display(),
            directories = tree.watched.len(),
            "Source watcher started"
        );

        let (batch_tx, batch_rx) = mpsc::channel(8);
        tokio::spawn(self.run(tree, raw_rx, batch_tx, token));
        Ok(batch_rx)
    }

    async fn run(
        self,
        // Dropping the watches stops event delivery
        mut tree: TreeWatch,
        mut raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
        batch_tx: mpsc::Sender<Vec<PathBuf>>,
        token: CancellationToken,
    ) {
        let mut debouncer = Debouncer::new(self.debounce);

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                _ = token.cancelled() => break,
                res = raw_rx.recv() => match res {
                    Some(Ok(event)) => {
                        if !is_relevant(&event.kind) {
                            continue;
                        }
                        let now = Instant::now();
                        for path in event.paths {
                            if !should_watch(&self.root, &path) {
                                continue;
                            }
                            match event.kind {
                                EventKind::Create(_) if path.is_dir() => match tree.add(&path) {
                                    Ok(sources) => {
                                        for source in sources {
                                            debouncer.touch(source, now);
                                        }
                                    }
                                    Err(e) => warn!(dir = %path.display(), error = %e, "Failed to watch new directory"),
                                },
                                EventKind::Remove(_) => tree.forget(&path),
                                _ => {}
                            }
                            if is_go_source(&path) {
                                debouncer.touch(path, now);
                            }
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "File watcher error"),
                    None => break,
                },
                _ = sleep_until_opt(deadline) => {
                    let settled = debouncer.take_settled(Instant::now());
                    if settled.is_empty() {
                        continue;
                    }
                    debug!(files = settled.len(), "Source changes settled");
                    if batch_tx.send(settled).await.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(root = %self.root.display(), "Source watcher stopped");
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
