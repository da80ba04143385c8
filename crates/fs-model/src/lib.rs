//! Directory model for Glance
//!
//! Enumerates one directory at a time, classifying entries into image
//! files (by an extension set derived from the decoders the codec gateway
//! supports) and subdirectories. Hidden entries are suppressed. Consumers
//! subscribe to change events over `std::sync::mpsc` and pull sorted
//! snapshots; an optional `notify` watch re-enumerates on filesystem
//! modifications.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("watch failure: {0}")]
    Watch(#[from] notify::Error),
}

/// One image file of the current listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Percent-encoded `file://` URI; authoritative for cache addressing.
    pub uri: String,
    pub path: PathBuf,
    /// Display name (the final path component).
    pub name: String,
    /// Modification time in whole seconds since the epoch.
    pub mtime: i64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    ModificationTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Change notifications; snapshots are pulled, not pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelEvent {
    /// Fired after every refresh and whenever a watch observes changes.
    FilesChanged,
    /// Fired when the set of subdirectories differs from the last refresh.
    SubdirectoriesChanged,
}

/// Snapshot-based model of a single directory.
pub struct DirectoryModel {
    dir: PathBuf,
    extensions: BTreeSet<String>,
    sort: Mutex<(SortKey, SortDirection)>,
    files: Mutex<Vec<FileEntry>>,
    subdirs: Mutex<Vec<PathBuf>>,
    subscribers: Mutex<Vec<Sender<ModelEvent>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl DirectoryModel {
    /// `extensions` is the lowercase, dot-less set of image extensions to
    /// accept, typically `CodecGateway::supported_extensions()`.
    pub fn new<I, S>(dir: impl Into<PathBuf>, extensions: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(ModelError::NotADirectory(dir));
        }
        Ok(Self {
            dir,
            extensions: extensions.into_iter().map(|s| s.into().to_lowercase()).collect(),
            sort: Mutex::new((SortKey::Name, SortDirection::Ascending)),
            files: Mutex::new(Vec::new()),
            subdirs: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sorted snapshot of the image entries.
    pub fn files(&self) -> Vec<FileEntry> {
        self.files.lock().clone()
    }

    /// Sorted snapshot of the subdirectory paths.
    pub fn subdirectories(&self) -> Vec<PathBuf> {
        self.subdirs.lock().clone()
    }

    /// Register for change events. Dead receivers are pruned on send.
    pub fn subscribe(&self) -> Receiver<ModelEvent> {
        let (tx, rx) = channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn set_sort(&self, key: SortKey, direction: SortDirection) {
        *self.sort.lock() = (key, direction);
        {
            let mut files = self.files.lock();
            let (key, direction) = *self.sort.lock();
            sort_entries(&mut files, key, direction);
        }
        self.emit(ModelEvent::FilesChanged);
    }

    /// Re-enumerate the directory. Fires `FilesChanged` after every pass
    /// and `SubdirectoriesChanged` when the subdirectory set moved.
    pub fn refresh(&self) -> Result<(), ModelError> {
        let mut files = Vec::new();
        let mut subdirs = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(dir = %self.dir.display(), %err, "unreadable directory entry");
                    continue;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!(dir = %self.dir.display(), "skipping non-UTF-8 entry name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let stat = match entry.metadata() {
                Ok(stat) => stat,
                Err(err) => {
                    warn!(path = %path.display(), %err, "cannot stat entry");
                    continue;
                }
            };
            if stat.is_dir() {
                subdirs.push(path);
            } else if stat.is_file() && self.is_image_name(name) {
                let Ok(url) = Url::from_file_path(&path) else {
                    continue;
                };
                files.push(FileEntry {
                    uri: url.to_string(),
                    name: name.to_string(),
                    mtime: whole_seconds_mtime(&stat),
                    size: stat.len(),
                    path,
                });
            }
        }

        let (key, direction) = *self.sort.lock();
        sort_entries(&mut files, key, direction);
        subdirs.sort();

        *self.files.lock() = files;
        let subdirs_changed = {
            let mut held = self.subdirs.lock();
            let changed = *held != subdirs;
            *held = subdirs;
            changed
        };

        self.emit(ModelEvent::FilesChanged);
        if subdirs_changed {
            self.emit(ModelEvent::SubdirectoriesChanged);
        }
        Ok(())
    }

    /// Enumerate on a background thread; completion is observable through
    /// the event subscription.
    pub fn refresh_async(self: &Arc<Self>) {
        let model = Arc::clone(self);
        std::thread::spawn(move || {
            if let Err(err) = model.refresh() {
                warn!(dir = %model.dir.display(), %err, "background refresh failed");
            }
        });
    }

    /// Install a filesystem watch that re-enumerates on modifications.
    /// The watch lives as long as the model.
    pub fn watch(self: &Arc<Self>) -> Result<(), ModelError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let Some(model) = weak.upgrade() else {
                    return;
                };
                match res {
                    Ok(_) => {
                        if let Err(err) = model.refresh() {
                            warn!(dir = %model.dir.display(), %err, "watch-driven refresh failed");
                        }
                    }
                    Err(err) => warn!(dir = %model.dir.display(), %err, "watch error"),
                }
            })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        *self.watcher.lock() = Some(watcher);
        Ok(())
    }

    fn is_image_name(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext.to_lowercase()))
    }

    fn emit(&self, event: ModelEvent) {
        self.subscribers.lock().retain(|tx| tx.send(event).is_ok());
    }
}

/// Stable ordering with the display name as tie-break, so equal mtimes
/// keep a deterministic order.
pub fn sort_entries(entries: &mut [FileEntry], key: SortKey, direction: SortDirection) {
    entries.sort_by(|a, b| {
        let ordering = match key {
            SortKey::Name => a.name.cmp(&b.name),
            SortKey::ModificationTime => a.mtime.cmp(&b.mtime).then_with(|| a.name.cmp(&b.name)),
        };
        match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
}

fn whole_seconds_mtime(stat: &fs::Metadata) -> i64 {
    stat.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(name: &str, mtime: i64) -> FileEntry {
        FileEntry {
            uri: format!("file:///t/{name}"),
            path: PathBuf::from(format!("/t/{name}")),
            name: name.to_string(),
            mtime,
            size: 1,
        }
    }

    fn names(entries: &[FileEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    fn populate(dir: &Path) {
        fs::write(dir.join("b.JPG"), b"x").unwrap();
        fs::write(dir.join("a.png"), b"x").unwrap();
        fs::write(dir.join("notes.txt"), b"x").unwrap();
        fs::write(dir.join(".hidden.png"), b"x").unwrap();
        fs::create_dir(dir.join("sub")).unwrap();
        fs::create_dir(dir.join(".hidden-dir")).unwrap();
    }

    #[test]
    fn test_refresh_classifies_and_filters() {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path());
        let model = DirectoryModel::new(tmp.path(), ["png", "jpg"]).unwrap();
        model.refresh().unwrap();

        let files = model.files();
        assert_eq!(names(&files), ["a.png", "b.JPG"]);
        assert!(files[0].uri.starts_with("file://"));
        assert!(files[0].mtime > 0);
        assert_eq!(model.subdirectories(), vec![tmp.path().join("sub")]);
    }

    #[test]
    fn test_nonexistent_dir_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            DirectoryModel::new(tmp.path().join("missing"), ["png"]),
            Err(ModelError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_sort_by_name_descending() {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path());
        let model = DirectoryModel::new(tmp.path(), ["png", "jpg"]).unwrap();
        model.refresh().unwrap();
        model.set_sort(SortKey::Name, SortDirection::Descending);
        assert_eq!(names(&model.files()), ["b.JPG", "a.png"]);
    }

    #[test]
    fn test_sort_by_mtime_is_stable_on_ties() {
        let mut entries =
            vec![entry("c.png", 10), entry("a.png", 20), entry("b.png", 10)];
        sort_entries(&mut entries, SortKey::ModificationTime, SortDirection::Ascending);
        assert_eq!(
            entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            ["b.png", "c.png", "a.png"]
        );
        sort_entries(&mut entries, SortKey::ModificationTime, SortDirection::Descending);
        assert_eq!(
            entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            ["a.png", "c.png", "b.png"]
        );
    }

    #[test]
    fn test_events_fired_on_refresh() {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path());
        let model = DirectoryModel::new(tmp.path(), ["png"]).unwrap();
        let rx = model.subscribe();

        model.refresh().unwrap();
        assert_eq!(rx.try_recv(), Ok(ModelEvent::FilesChanged));
        // First pass discovers `sub`.
        assert_eq!(rx.try_recv(), Ok(ModelEvent::SubdirectoriesChanged));

        model.refresh().unwrap();
        assert_eq!(rx.try_recv(), Ok(ModelEvent::FilesChanged));
        // Unchanged subdirectory set stays silent.
        assert!(rx.try_recv().is_err());

        fs::create_dir(tmp.path().join("sub2")).unwrap();
        model.refresh().unwrap();
        assert_eq!(rx.try_recv(), Ok(ModelEvent::FilesChanged));
        assert_eq!(rx.try_recv(), Ok(ModelEvent::SubdirectoriesChanged));
    }

    #[test]
    fn test_watch_triggers_refresh() {
        let tmp = tempfile::tempdir().unwrap();
        let model = Arc::new(DirectoryModel::new(tmp.path(), ["png"]).unwrap());
        model.refresh().unwrap();
        let rx = model.subscribe();
        model.watch().unwrap();

        fs::write(tmp.path().join("new.png"), b"x").unwrap();
        // The watcher may coalesce or repeat events; wait for the refresh
        // that actually lists the new file.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(ModelEvent::FilesChanged)
                    if names(&model.files()).contains(&"new.png") =>
                {
                    break;
                }
                Ok(_) => continue,
                Err(err) => panic!("no watch event: {err}"),
            }
        }
    }

    #[test]
    fn test_refresh_async_completes() {
        let tmp = tempfile::tempdir().unwrap();
        populate(tmp.path());
        let model = Arc::new(DirectoryModel::new(tmp.path(), ["png"]).unwrap());
        let rx = model.subscribe();
        model.refresh_async();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(10)),
            Ok(ModelEvent::FilesChanged)
        );
        assert_eq!(names(&model.files()), ["a.png"]);
    }
}
