//! Gallery store: the enrolled identity → feature vector mapping.
//!
//! Readers take an `Arc` snapshot and never see a partial update; every
//! mutation builds a new map and swaps it in whole. A [`GalleryPersistence`]
//! backend mirrors the current snapshot to durable storage.

use crate::types::{FeatureVector, Identity, DESCRIPTOR_LEN};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Immutable set of enrolled vectors, ordered by identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: BTreeMap<Identity, FeatureVector>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the vector for `identity`.
    pub fn insert(&mut self, identity: Identity, vector: FeatureVector) {
        self.entries.insert(identity, vector);
    }

    pub fn get(&self, identity: &Identity) -> Option<&FeatureVector> {
        self.entries.get(identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &FeatureVector)> {
        self.entries.iter()
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entries.keys()
    }

    /// Serializable form: identity string → vector values.
    fn to_persisted(&self) -> BTreeMap<&str, &[f32]> {
        self.entries.iter().map(|(id, v)| (id.as_str(), v.values())).collect()
    }

    /// Rebuild from the persisted form, dropping entries whose identity is
    /// empty or whose vector has the wrong length.
    fn from_persisted(raw: BTreeMap<String, Vec<f32>>) -> Self {
        let mut gallery = Gallery::new();
        for (key, values) in raw {
            let identity = match Identity::parse(&key) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping gallery entry with invalid identity");
                    continue;
                }
            };
            if values.len() != DESCRIPTOR_LEN {
                tracing::warn!(
                    identity = %identity,
                    len = values.len(),
                    expected = DESCRIPTOR_LEN,
                    "skipping gallery entry with wrong vector length"
                );
                continue;
            }
            gallery.insert(identity, FeatureVector::from_values(values));
        }
        gallery
    }
}

impl FromIterator<(Identity, FeatureVector)> for Gallery {
    fn from_iter<I: IntoIterator<Item = (Identity, FeatureVector)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Durable mirror of the gallery.
pub trait GalleryPersistence: Send + Sync {
    /// Read the persisted gallery. `Ok(None)` when nothing has been saved yet.
    fn load_gallery(&self) -> Result<Option<Gallery>, GalleryError>;

    fn persist_gallery(&self, gallery: &Gallery) -> Result<(), GalleryError>;
}

/// JSON object `{ "identity": [f32; 768], ... }` on disk.
///
/// Writes go to a temporary sibling file that is then renamed over the
/// target, so a crash mid-write leaves the previous file intact.
pub struct JsonGalleryFile {
    path: PathBuf,
}

impl JsonGalleryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GalleryPersistence for JsonGalleryFile {
    fn load_gallery(&self) -> Result<Option<Gallery>, GalleryError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw: BTreeMap<String, Vec<f32>> = serde_json::from_slice(&bytes)?;
        Ok(Some(Gallery::from_persisted(raw)))
    }

    fn persist_gallery(&self, gallery: &Gallery) -> Result<(), GalleryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec(&gallery.to_persisted())?;
        // Per-process name: concurrent writers never share a temp file.
        let tmp = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Shared, atomically swappable gallery with a persisted mirror.
pub struct GalleryStore {
    current: RwLock<Arc<Gallery>>,
    persistence: Box<dyn GalleryPersistence>,
    /// Serializes writes to the mirror so the last write is the newest snapshot.
    persist_lock: Mutex<()>,
}

impl GalleryStore {
    /// Open the store, loading whatever the backend has persisted.
    ///
    /// A missing or unreadable mirror yields an empty gallery; it is never fatal.
    pub fn open(persistence: impl GalleryPersistence + 'static) -> Self {
        let gallery = match persistence.load_gallery() {
            Ok(Some(g)) => {
                tracing::info!(identities = g.len(), "loaded persisted gallery");
                g
            }
            Ok(None) => {
                tracing::info!("no persisted gallery; starting empty");
                Gallery::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "persisted gallery unreadable; starting empty");
                Gallery::new()
            }
        };

        Self {
            current: RwLock::new(Arc::new(gallery)),
            persistence: Box::new(persistence),
            persist_lock: Mutex::new(()),
        }
    }

    /// Current gallery. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Gallery> {
        Arc::clone(&self.current.read())
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Swap in `gallery` for all readers, then mirror it to storage.
    ///
    /// The in-memory swap always takes effect. An `Err` means only that the
    /// durable copy is stale and a restart may lose this update.
    pub fn replace(&self, gallery: Gallery) -> Result<(), GalleryError> {
        *self.current.write() = Arc::new(gallery);
        self.persist()
    }

    /// Drop one identity and persist. Returns false (and writes nothing) if
    /// the identity was not in the gallery.
    pub fn remove(&self, identity: &Identity) -> Result<bool, GalleryError> {
        {
            let mut current = self.current.write();
            if !current.contains(identity) {
                return Ok(false);
            }
            let mut next = Gallery::clone(&current);
            next.entries.remove(identity);
            *current = Arc::new(next);
        }
        self.persist()?;
        Ok(true)
    }

    /// Write the current snapshot to the backend.
    pub fn persist(&self) -> Result<(), GalleryError> {
        let _guard = self.persist_lock.lock();
        let snapshot = self.snapshot();
        self.persistence.persist_gallery(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(seed: usize) -> FeatureVector {
        FeatureVector::normalized((0..DESCRIPTOR_LEN).map(|i| ((i * seed + 1) % 17) as f32).collect())
    }

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    fn assert_same(a: &Gallery, b: &Gallery) {
        assert_eq!(a.len(), b.len());
        for ((ia, va), (ib, vb)) in a.iter().zip(b.iter()) {
            assert_eq!(ia, ib);
            for (x, y) in va.values().iter().zip(vb.values()) {
                assert!((x - y).abs() <= 1e-6, "{ia}: {x} vs {y}");
            }
        }
    }

    /// In-memory backend that can be told to fail writes.
    #[derive(Default)]
    struct MemoryBackend {
        saved: Arc<Mutex<Option<Gallery>>>,
        fail_writes: bool,
    }

    impl GalleryPersistence for MemoryBackend {
        fn load_gallery(&self) -> Result<Option<Gallery>, GalleryError> {
            Ok(self.saved.lock().clone())
        }

        fn persist_gallery(&self, gallery: &Gallery) -> Result<(), GalleryError> {
            if self.fail_writes {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            *self.saved.lock() = Some(gallery.clone());
            Ok(())
        }
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonGalleryFile::new(dir.path().join("gallery.json"));

        let gallery: Gallery = [(id("alice"), vector(3)), (id("bob"), vector(5))].into_iter().collect();
        file.persist_gallery(&gallery).unwrap();

        let loaded = file.load_gallery().unwrap().unwrap();
        assert_same(&loaded, &gallery);
    }

    #[test]
    fn test_persist_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonGalleryFile::new(dir.path().join("gallery.json"));
        let one: Gallery = [(id("alice"), vector(3))].into_iter().collect();
        file.persist_gallery(&one).unwrap();
        file.persist_gallery(&Gallery::new()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["gallery.json".to_string()]);
    }

    #[test]
    fn test_json_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonGalleryFile::new(dir.path().join("absent.json"));
        assert!(file.load_gallery().unwrap().is_none());
    }

    #[test]
    fn test_open_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = GalleryStore::open(JsonGalleryFile::new(&path));
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_skips_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        let good: Vec<f32> = vector(2).values().to_vec();
        let json = serde_json::json!({
            "Alice Smith": good.clone(),
            "short": [1.0, 2.0],
            "   ": good.clone(),
        });
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let loaded = JsonGalleryFile::new(&path).load_gallery().unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains(&id("alice_smith")));
    }

    #[test]
    fn test_replace_swaps_and_persists() {
        let backend = MemoryBackend::default();
        let saved = Arc::clone(&backend.saved);
        let store = GalleryStore::open(backend);

        let before = store.snapshot();
        let gallery: Gallery = [(id("alice"), vector(3))].into_iter().collect();
        store.replace(gallery.clone()).unwrap();

        assert!(before.is_empty(), "old snapshot is unaffected");
        assert_eq!(*store.snapshot(), gallery);
        assert_eq!(saved.lock().as_ref(), Some(&gallery));
    }

    #[test]
    fn test_replace_persist_failure_keeps_memory_state() {
        let store = GalleryStore::open(MemoryBackend { fail_writes: true, ..Default::default() });
        let gallery: Gallery = [(id("alice"), vector(3))].into_iter().collect();

        assert!(store.replace(gallery).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_member() {
        let store = GalleryStore::open(MemoryBackend::default());
        let gallery: Gallery = [(id("alice"), vector(3)), (id("bob"), vector(5))].into_iter().collect();
        store.replace(gallery).unwrap();

        assert!(store.remove(&id("alice")).unwrap());
        assert_eq!(store.len(), 1);
        assert!(!store.snapshot().contains(&id("alice")));
    }

    #[test]
    fn test_remove_non_member_is_noop() {
        let store = GalleryStore::open(MemoryBackend::default());
        let gallery: Gallery = [(id("alice"), vector(3))].into_iter().collect();
        store.replace(gallery.clone()).unwrap();

        assert!(!store.remove(&id("mallory")).unwrap());
        assert_eq!(*store.snapshot(), gallery);
    }

    #[test]
    fn test_open_restores_persisted_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/gallery.json");

        let gallery: Gallery = [(id("carol"), vector(7))].into_iter().collect();
        GalleryStore::open(JsonGalleryFile::new(&path)).replace(gallery.clone()).unwrap();

        let reopened = GalleryStore::open(JsonGalleryFile::new(&path));
        assert_same(&reopened.snapshot(), &gallery);
    }
}
