//! Filesystem watcher for classpath roots
//!
//! Turns raw `notify` events under each watched root into classified
//! [`FileChange`]s: class files (resolved to a binary type name),
//! configuration resources and structural resources. Debouncing is left
//! to the command scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use hotswap_kernel::config::{WatchConfig, WatchRootConfig};
use hotswap_kernel::{LoaderId, ResourceRef, TypeName};

const CHANNEL_CAPACITY: usize = 1024;

/// Watcher errors
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WatchError {
    #[error("Watch backend error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Watch root does not exist: {}", .0.display())]
    MissingRoot(PathBuf),

    #[error("Watcher already started")]
    AlreadyStarted,
}

/// Filesystem event kind after normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Create,
    Modify,
    Delete,
}

/// What a changed file is to the reload pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceClass {
    Class(TypeName),
    Config,
    Structural,
}

/// One classified filesystem change under a watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub loader: LoaderId,
    pub kind: FileEventKind,
    pub class: ResourceClass,
}

impl FileChange {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::from_path(&self.path)
    }
}

/// Decides whether a path is a class file, a config resource, a
/// structural resource, or noise.
#[derive(Debug, Clone)]
pub struct ResourceClassifier {
    class_extension: String,
    config_extensions: Vec<String>,
    structural_suffixes: Vec<String>,
    ignore_patterns: Vec<String>,
}

impl ResourceClassifier {
    pub fn new(config: &WatchConfig) -> Self {
        Self {
            class_extension: config.class_extension.clone(),
            config_extensions: config.config_extensions.clone(),
            structural_suffixes: config
                .structural_extensions
                .iter()
                .map(|ext| format!(".{ext}"))
                .collect(),
            ignore_patterns: config.ignore_patterns.clone(),
        }
    }

    /// `*.tmp`, `prefix*` and exact names.
    pub fn is_ignored(&self, file_name: &str) -> bool {
        self.ignore_patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                file_name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                file_name.starts_with(prefix)
            } else {
                file_name == pattern
            }
        })
    }

    pub fn classify(&self, root: &Path, path: &Path) -> Option<ResourceClass> {
        let file_name = path.file_name()?.to_str()?;
        if self.is_ignored(file_name) {
            return None;
        }

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if extension == self.class_extension {
            let relative = path.strip_prefix(root).ok()?;
            return TypeName::from_class_path(relative).map(ResourceClass::Class);
        }
        // Compound suffixes such as `.beans.toml` win over plain `.toml`.
        if self
            .structural_suffixes
            .iter()
            .any(|suffix| file_name.ends_with(suffix.as_str()))
        {
            return Some(ResourceClass::Structural);
        }
        if self.config_extensions.iter().any(|ext| ext == extension) {
            return Some(ResourceClass::Config);
        }
        None
    }

    /// Map a path to the root it lives under and classify it.
    pub fn change_for(
        &self,
        roots: &[WatchRootConfig],
        path: &Path,
        kind: FileEventKind,
    ) -> Option<FileChange> {
        let root = roots
            .iter()
            .filter(|root| path.starts_with(&root.path))
            .max_by_key(|root| root.path.components().count())?;
        let class = self.classify(&root.path, path)?;
        Some(FileChange {
            path: path.to_path_buf(),
            loader: root.loader.clone(),
            kind,
            class,
        })
    }
}

/// Normalise one notify event into `(path, kind)` pairs.
fn normalise(event: &Event) -> Vec<(PathBuf, FileEventKind)> {
    let single = |kind: FileEventKind| {
        event
            .paths
            .iter()
            .map(|path| (path.clone(), kind))
            .collect::<Vec<_>>()
    };
    match event.kind {
        EventKind::Create(_) => single(FileEventKind::Create),
        EventKind::Remove(_) => single(FileEventKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(FileEventKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(FileEventKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![
                (from.clone(), FileEventKind::Delete),
                (to.clone(), FileEventKind::Create),
            ],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => single(FileEventKind::Modify),
        _ => Vec::new(),
    }
}

/// Watches classpath roots and emits [`FileChange`]s.
pub struct ChangeWatcher {
    roots: Arc<Vec<WatchRootConfig>>,
    classifier: Arc<ResourceClassifier>,
    event_tx: mpsc::Sender<FileChange>,
    event_rx: Option<mpsc::Receiver<FileChange>>,
    watcher: Option<RecommendedWatcher>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl ChangeWatcher {
    pub fn new(config: &WatchConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            roots: Arc::new(config.roots.clone()),
            classifier: Arc::new(ResourceClassifier::new(config)),
            event_tx,
            event_rx: Some(event_rx),
            watcher: None,
            shutdown_tx: None,
        }
    }

    /// Take the change receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<FileChange>> {
        self.event_rx.take()
    }

    pub fn roots(&self) -> &[WatchRootConfig] {
        &self.roots
    }

    pub fn classifier(&self) -> &ResourceClassifier {
        &self.classifier
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching every configured root recursively.
    pub fn start(&mut self) -> Result<(), WatchError> {
        if self.watcher.is_some() {
            return Err(WatchError::AlreadyStarted);
        }
        if let Some(missing) = self.roots.iter().find(|root| !root.path.exists()) {
            return Err(WatchError::MissingRoot(missing.path.clone()));
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = raw_tx.blocking_send(event);
                }
                Err(e) => warn!("Watch backend error: {}", e),
            },
            Config::default().with_poll_interval(Duration::from_millis(100)),
        )?;
        for root in self.roots.iter() {
            info!(root = ?root.path, loader = %root.loader, "Watching classpath root");
            watcher.watch(&root.path, RecursiveMode::Recursive)?;
        }
        self.watcher = Some(watcher);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let roots = self.roots.clone();
        let classifier = self.classifier.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = raw_rx.recv() => {
                        for (path, kind) in normalise(&event) {
                            let Some(change) = classifier.change_for(&roots, &path, kind) else {
                                trace!(?path, "Ignoring path");
                                continue;
                            };
                            debug!(path = ?change.path, kind = ?change.kind, "File change");
                            if event_tx.send(change).await.is_err() {
                                error!("Change receiver dropped, stopping watcher task");
                                return;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Change watcher shutting down");
                        return;
                    }
                    else => return,
                }
            }
        });

        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.watcher = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn classifier() -> ResourceClassifier {
        ResourceClassifier::new(&WatchConfig::default())
    }

    #[test]
    fn classifies_by_extension() {
        let c = classifier();
        let root = Path::new("/srv/classes");
        assert_eq!(
            c.classify(root, Path::new("/srv/classes/com/example/UserService.class")),
            Some(ResourceClass::Class(TypeName::new("com.example.UserService")))
        );
        assert_eq!(
            c.classify(root, Path::new("/srv/classes/app.properties")),
            Some(ResourceClass::Config)
        );
        assert_eq!(
            c.classify(root, Path::new("/srv/classes/app.toml")),
            Some(ResourceClass::Config)
        );
        assert_eq!(
            c.classify(root, Path::new("/srv/classes/app.beans.toml")),
            Some(ResourceClass::Structural)
        );
        assert_eq!(
            c.classify(root, Path::new("/srv/classes/context.xml")),
            Some(ResourceClass::Structural)
        );
        assert_eq!(c.classify(root, Path::new("/srv/classes/README.md")), None);
    }

    #[test]
    fn ignore_patterns_win() {
        let c = classifier();
        let root = Path::new("/srv/classes");
        assert!(c.is_ignored("Foo.class.tmp"));
        assert!(c.is_ignored(".app.properties.swp"));
        assert!(c.is_ignored("app.properties~"));
        assert_eq!(c.classify(root, Path::new("/srv/classes/Foo.class.tmp")), None);
    }

    #[test]
    fn change_for_picks_the_innermost_root() {
        let c = classifier();
        let roots = vec![
            WatchRootConfig {
                path: PathBuf::from("/srv"),
                loader: LoaderId::new("system"),
            },
            WatchRootConfig {
                path: PathBuf::from("/srv/plugin/classes"),
                loader: LoaderId::new("plugin"),
            },
        ];
        let change = c
            .change_for(
                &roots,
                Path::new("/srv/plugin/classes/com/acme/Hook.class"),
                FileEventKind::Modify,
            )
            .unwrap();
        assert_eq!(change.loader, LoaderId::new("plugin"));
        assert_eq!(change.class, ResourceClass::Class(TypeName::new("com.acme.Hook")));
        assert!(c.change_for(&roots, Path::new("/elsewhere/A.class"), FileEventKind::Modify).is_none());
    }

    #[test]
    fn normalises_notify_events() {
        let path = PathBuf::from("/srv/classes/A.class");
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        let modified =
            Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(path.clone());
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(path.clone());
        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/srv/classes/A.class.tmp"))
            .add_path(path.clone());

        assert_eq!(normalise(&created), vec![(path.clone(), FileEventKind::Create)]);
        assert_eq!(normalise(&modified), vec![(path.clone(), FileEventKind::Modify)]);
        assert_eq!(normalise(&removed), vec![(path.clone(), FileEventKind::Delete)]);
        assert_eq!(normalise(&renamed)[1], (path, FileEventKind::Create));
    }

    #[tokio::test]
    async fn start_rejects_missing_roots() {
        let config = WatchConfig::default().with_root("/definitely/not/here", LoaderId::new("app"));
        let mut watcher = ChangeWatcher::new(&config);
        assert!(matches!(watcher.start(), Err(WatchError::MissingRoot(_))));
        assert!(watcher.take_event_receiver().is_some());
        assert!(watcher.take_event_receiver().is_none());
    }

    #[tokio::test]
    async fn emits_classified_changes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let config = WatchConfig::default().with_root(&root, LoaderId::new("app"));
        let mut watcher = ChangeWatcher::new(&config);
        let mut rx = watcher.take_event_receiver().unwrap();
        watcher.start().unwrap();

        std::fs::write(root.join("app.properties"), "a=1").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change within 5s")
            .unwrap();
        assert_eq!(change.class, ResourceClass::Config);
        assert_eq!(change.loader, LoaderId::new("app"));
        watcher.stop().await;
        assert!(!watcher.is_running());
    }
}
