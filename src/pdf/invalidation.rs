//! Asset-change notifications and cache eviction

use std::ops::AddAssign;
use std::sync::Arc;
use std::thread::JoinHandle;

use flume::Receiver;

use super::worker::Layers;

/// One notification: the logical source ids whose assets changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetChange {
    pub sources: Vec<String>,
}

impl AssetChange {
    #[must_use]
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn single(source: impl Into<String>) -> Self {
        Self {
            sources: vec![source.into()],
        }
    }
}

/// Entries removed per layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub documents: usize,
    pub pages: usize,
    pub images: usize,
}

impl EvictionStats {
    #[must_use]
    pub fn total(&self) -> usize {
        self.documents + self.pages + self.images
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for EvictionStats {
    fn add_assign(&mut self, rhs: Self) {
        self.documents += rhs.documents;
        self.pages += rhs.pages;
        self.images += rhs.images;
    }
}

/// Evicts every entry derived from a changed source, in all three layers
#[derive(Clone)]
pub struct InvalidationBus {
    layers: Arc<Layers>,
}

impl InvalidationBus {
    pub(crate) fn new(layers: Arc<Layers>) -> Self {
        Self { layers }
    }

    /// Evict one logical source, all freshness variants included
    pub fn invalidate(&self, source: &str) -> EvictionStats {
        let stats = self.layers.evict_source(source);
        log::info!(
            "Invalidated {source}: {} documents, {} pages, {} images",
            stats.documents,
            stats.pages,
            stats.images
        );
        stats
    }

    pub fn apply(&self, change: &AssetChange) -> EvictionStats {
        let mut stats = EvictionStats::default();
        for source in &change.sources {
            stats += self.invalidate(source);
        }
        stats
    }

    /// Consume notifications on a background thread until every sender is
    /// dropped
    pub fn listen(&self, changes: Receiver<AssetChange>) -> JoinHandle<()> {
        let bus = self.clone();
        std::thread::spawn(move || {
            for change in changes {
                bus.apply(&change);
            }
            log::debug!("Asset change channel closed");
        })
    }
}

#[cfg(feature = "watch")]
pub use watcher::FileWatcher;

#[cfg(feature = "watch")]
mod watcher {
    use std::collections::{HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex, PoisonError};

    use flume::Sender;
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

    use super::AssetChange;

    type Registry = Arc<Mutex<HashMap<PathBuf, String>>>;

    /// Turns on-disk changes of registered files into [`AssetChange`]s
    pub struct FileWatcher {
        watcher: RecommendedWatcher,
        files: Registry,
        dirs: HashSet<PathBuf>,
    }

    impl FileWatcher {
        pub fn new(changes: Sender<AssetChange>) -> notify::Result<Self> {
            let files: Registry = Arc::default();
            let registry = Arc::clone(&files);

            let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("File watch error: {e}");
                        return;
                    }
                };
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    return;
                }

                let sources: Vec<String> = {
                    let files = registry.lock().unwrap_or_else(PoisonError::into_inner);
                    event
                        .paths
                        .iter()
                        .filter_map(|path| files.get(&normalize(path)).cloned())
                        .collect::<HashSet<_>>()
                        .into_iter()
                        .collect()
                };
                if !sources.is_empty() {
                    log::debug!("Changed on disk: {sources:?}");
                    let _ = changes.send(AssetChange { sources });
                }
            })?;

            Ok(Self {
                watcher,
                files,
                dirs: HashSet::new(),
            })
        }

        /// Report changes to `path` under the logical id `source`
        ///
        /// The parent directory is watched so that editors replacing the
        /// file by rename are noticed.
        pub fn watch(&mut self, path: &Path, source: &str) -> notify::Result<()> {
            let path = normalize(path);
            let dir = path
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

            if self.dirs.insert(dir.clone()) {
                self.watcher.watch(&dir, RecursiveMode::NonRecursive)?;
                log::info!("Watching {}", dir.display());
            }

            self.files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(path, source.to_string());
            Ok(())
        }

        #[must_use]
        pub fn watched(&self) -> usize {
            self.files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }
    }

    fn normalize(path: &Path) -> PathBuf {
        if let Ok(canonical) = path.canonicalize() {
            return canonical;
        }
        // Removed files cannot be canonicalized; resolve through the parent.
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => parent
                .canonicalize()
                .map_or_else(|_| path.to_path_buf(), |dir| dir.join(name)),
            _ => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate() {
        let mut stats = EvictionStats {
            documents: 1,
            pages: 2,
            images: 3,
        };
        stats += EvictionStats {
            documents: 0,
            pages: 1,
            images: 1,
        };
        assert_eq!(stats.total(), 8);
        assert!(!stats.is_empty());
        assert!(EvictionStats::default().is_empty());
    }

    #[test]
    fn change_collects_sources() {
        let change = AssetChange::new(["a.pdf", "b.pdf"]);
        assert_eq!(change.sources, vec!["a.pdf", "b.pdf"]);
        assert_eq!(AssetChange::single("a.pdf").sources.len(), 1);
    }
}
