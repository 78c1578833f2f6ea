//! Change watcher
//!
//! Watches a unit directory (single mode) or a parent holding one directory
//! per unit (multi mode) and emits one [`WatchSignal`] per unit after its
//! debounce window has passed without further qualifying changes.

use hotdeploy_api::{UnitManifest, MANIFEST_FILE};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Path segments that never trigger a deploy
pub const IGNORED_SEGMENTS: &[&str] = &[
    "node_modules",
    "dist",
    "build",
    "target",
    "out",
    ".git",
    ".cache",
];

/// Extensions of source and asset files that trigger a deploy
pub const WATCHED_EXTENSIONS: &[&str] = &[
    "js", "mjs", "cjs", "jsx", "ts", "tsx", "json", "css", "scss", "less", "html", "vue", "svelte",
    "rs", "toml", "yaml", "yml", "svg", "png",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// The root is itself the unit
    Single,
    /// Every direct subdirectory of the root is a unit
    Multi,
}

/// A unit whose sources settled after a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSignal {
    pub identity: String,
    pub root: PathBuf,
    /// Last qualifying path seen before the signal
    pub path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    #[error("Watch root {0} is not a directory")]
    NotADirectory(PathBuf),
}

/// Whether `path` (inside `root`) should trigger a deploy
pub fn is_qualifying(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };

    for component in relative.components() {
        let Component::Normal(segment) = component else {
            continue;
        };
        let segment = segment.to_string_lossy();
        if segment.starts_with('.') || IGNORED_SEGMENTS.contains(&segment.as_ref()) {
            return false;
        }
    }

    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| WATCHED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Identity declared by the unit's manifest, else its directory name
pub fn target_identity(root: &Path) -> String {
    if let Ok(bytes) = std::fs::read(root.join(MANIFEST_FILE)) {
        match UnitManifest::from_slice(&bytes) {
            Ok(manifest) => return manifest.name,
            Err(e) => tracing::debug!(root = %root.display(), error = %e, "Unusable manifest"),
        }
    }
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string())
}

/// Unit root a changed path belongs to
pub fn target_root(root: &Path, mode: WatchMode, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(root).ok()?;
    match mode {
        WatchMode::Single => Some(root.to_path_buf()),
        WatchMode::Multi => {
            let mut components = relative.components();
            let first = match components.next()? {
                Component::Normal(first) => first,
                _ => return None,
            };
            // Files directly under the parent belong to no unit
            components.next()?;
            Some(root.join(first))
        }
    }
}

struct Pending {
    deadline: Instant,
    path: PathBuf,
}

/// One debounce timer per unit root
#[derive(Default)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record a qualifying change, restarting that unit's timer
    pub fn touch(&mut self, target: PathBuf, path: PathBuf, now: Instant) {
        self.pending.insert(
            target,
            Pending {
                deadline: now + self.window,
                path,
            },
        );
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every target whose window has passed
    pub fn take_due(&mut self, now: Instant) -> Vec<(PathBuf, PathBuf)> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(target, _)| target.clone())
            .collect();

        let mut fired: Vec<(PathBuf, PathBuf)> = due
            .into_iter()
            .filter_map(|target| {
                self.pending
                    .remove(&target)
                    .map(|pending| (target, pending.path))
            })
            .collect();
        fired.sort();
        fired
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Running watcher; dropping it stops the notifications
pub struct ChangeWatcher {
    root: PathBuf,
    mode: WatchMode,
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
}

impl ChangeWatcher {
    /// Start watching `root`; signals arrive on the returned receiver
    pub fn start(
        root: impl AsRef<Path>,
        mode: WatchMode,
        debounce: Duration,
    ) -> Result<(Self, mpsc::Receiver<WatchSignal>), WatcherError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(WatcherError::NotADirectory(root));
        }
        // Event paths are absolute; compare against the same form
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
        let (signal_tx, signal_rx) = mpsc::channel::<WatchSignal>(64);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => tracing::debug!(error = %e, "Watch error"),
            }
        })
        .map_err(WatcherError::WatcherInit)?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(WatcherError::WatcherInit)?;
        tracing::info!(root = %root.display(), ?mode, "Watching for changes");

        let task_root = root.clone();
        tokio::spawn(async move {
            let mut debouncer = Debouncer::new(debounce);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(root = %task_root.display(), "Watcher shutting down");
                        break;
                    }

                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        if matches!(event.kind, EventKind::Access(_)) {
                            continue;
                        }
                        let now = Instant::now();
                        for path in event.paths {
                            if !is_qualifying(&task_root, &path) {
                                continue;
                            }
                            if let Some(target) = target_root(&task_root, mode, &path) {
                                tracing::trace!(path = %path.display(), "Qualifying change");
                                debouncer.touch(target, path, now);
                            }
                        }
                    }

                    _ = async {
                        match debouncer.next_deadline() {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        for (target, path) in debouncer.take_due(Instant::now()) {
                            let signal = WatchSignal {
                                identity: target_identity(&target),
                                root: target,
                                path,
                            };
                            tracing::debug!(unit = %signal.identity, "Unit changed");
                            if signal_tx.send(signal).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                root,
                mode,
                _watcher: watcher,
                shutdown_tx,
            },
            signal_rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    /// Stop the watcher
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_qualifying_paths() {
        let root = Path::new("/work/unit");
        assert!(is_qualifying(root, Path::new("/work/unit/src/index.ts")));
        assert!(is_qualifying(root, Path::new("/work/unit/manifest.json")));
        assert!(is_qualifying(root, Path::new("/work/unit/styles/App.SCSS")));

        assert!(!is_qualifying(root, Path::new("/work/unit/node_modules/x/index.js")));
        assert!(!is_qualifying(root, Path::new("/work/unit/dist/main.js")));
        assert!(!is_qualifying(root, Path::new("/work/unit/.git/HEAD.json")));
        assert!(!is_qualifying(root, Path::new("/work/unit/.vscode/settings.json")));
        assert!(!is_qualifying(root, Path::new("/work/unit/src/.main.ts.swp")));
        assert!(!is_qualifying(root, Path::new("/work/unit/README.md")));
        assert!(!is_qualifying(root, Path::new("/work/unit/Makefile")));
        assert!(!is_qualifying(root, Path::new("/elsewhere/index.js")));
    }

    #[test]
    fn test_target_root_by_mode() {
        let root = Path::new("/work/units");
        let path = Path::new("/work/units/alpha/src/a.ts");
        assert_eq!(
            target_root(root, WatchMode::Single, path),
            Some(root.to_path_buf())
        );
        assert_eq!(
            target_root(root, WatchMode::Multi, path),
            Some(PathBuf::from("/work/units/alpha"))
        );
        assert_eq!(
            target_root(root, WatchMode::Multi, Path::new("/work/units/loose.json")),
            None
        );
    }

    #[test]
    fn test_target_identity_prefers_manifest() {
        let temp = TempDir::new().unwrap();
        let unit = temp.path().join("folder-name");
        fs::create_dir_all(&unit).unwrap();
        assert_eq!(target_identity(&unit), "folder-name");

        fs::write(unit.join(MANIFEST_FILE), r#"{"name": "declared"}"#).unwrap();
        assert_eq!(target_identity(&unit), "declared");
    }

    #[test]
    fn test_burst_collapses_to_one_signal() {
        let mut debouncer = Debouncer::new(Duration::from_millis(400));
        let start = Instant::now();
        let target = PathBuf::from("/u");

        for i in 0..10u64 {
            debouncer.touch(
                target.clone(),
                PathBuf::from(format!("/u/f{}.js", i)),
                start + Duration::from_millis(i * 50),
            );
            // Nothing fires inside the window
            assert!(debouncer
                .take_due(start + Duration::from_millis(i * 50 + 10))
                .is_empty());
        }

        let deadline = debouncer.next_deadline().unwrap();
        assert_eq!(deadline, start + Duration::from_millis(450 + 400));

        let fired = debouncer.take_due(deadline);
        assert_eq!(fired, vec![(target, PathBuf::from("/u/f9.js"))]);
        assert!(debouncer.is_empty());
        assert!(debouncer.take_due(deadline + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_units_debounce_independently() {
        let mut debouncer = Debouncer::new(Duration::from_millis(400));
        let start = Instant::now();
        let quiet = PathBuf::from("/units/quiet");
        let noisy = PathBuf::from("/units/noisy");

        debouncer.touch(quiet.clone(), quiet.join("a.ts"), start);
        for i in 0..20u64 {
            debouncer.touch(
                noisy.clone(),
                noisy.join("b.ts"),
                start + Duration::from_millis(i * 100),
            );
        }
        assert_eq!(debouncer.len(), 2);

        let fired = debouncer.take_due(start + Duration::from_millis(400));
        assert_eq!(fired, vec![(quiet, PathBuf::from("/units/quiet/a.ts"))]);
        assert_eq!(debouncer.len(), 1);
    }

    #[tokio::test]
    async fn test_start_rejects_missing_root() {
        let temp = TempDir::new().unwrap();
        let result = ChangeWatcher::start(
            temp.path().join("missing"),
            WatchMode::Single,
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(WatcherError::NotADirectory(_))));
    }
}
