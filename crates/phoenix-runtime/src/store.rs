//! Persistent store capability for small named text artifacts.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::StoreError;

/// How a write treats existing artifact contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Add to the end of the artifact, creating it if missing.
    Append,
    /// Replace the artifact contents.
    Overwrite,
}

/// A location for small flat text artifacts that may come and go.
///
/// Implementors only need [`resolve_root`](Self::resolve_root); the artifact
/// operations default to plain files under the resolved directory.
pub trait PersistentStore: Send + Sync + fmt::Debug {
    /// Resolve the directory backing this store, or `None` while it is
    /// unavailable.
    fn resolve_root(&self) -> Option<PathBuf>;

    fn is_available(&self) -> bool {
        self.resolve_root().is_some()
    }

    /// Whether both stores currently resolve to the same directory.
    fn same_location(&self, other: &dyn PersistentStore) -> bool {
        match (self.resolve_root(), other.resolve_root()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Read an artifact. Returns `Ok(None)` when it does not exist.
    fn read(&self, name: &str) -> Result<Option<String>, StoreError> {
        let path = artifact_path(self.resolve_root(), name)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, name: &str, contents: &str, mode: WriteMode) -> Result<(), StoreError> {
        let path = artifact_path(self.resolve_root(), name)?;
        write_file(&path, contents, mode)?;
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        artifact_path(self.resolve_root(), name)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = artifact_path(self.resolve_root(), name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Append to or overwrite `path` with `contents`.
pub(crate) fn write_file(path: &Path, contents: &str, mode: WriteMode) -> std::io::Result<()> {
    let mut file = match mode {
        WriteMode::Append => OpenOptions::new().create(true).append(true).open(path)?,
        WriteMode::Overwrite => OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?,
    };
    file.write_all(contents.as_bytes())?;
    file.flush()
}

fn artifact_path(root: Option<PathBuf>, name: &str) -> Result<PathBuf, StoreError> {
    let root = root.ok_or(StoreError::Unavailable)?;
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(root.join(name)),
        _ => Err(StoreError::InvalidName(name.to_string())),
    }
}

/// A store rooted at a directory that is only available while it exists.
///
/// This models removable media: when the card is pulled the directory
/// vanishes and every operation reports [`StoreError::Unavailable`].
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// A store at `root`. Nothing is created.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// A store at `root`, creating the directory first.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "created store directory");
        Ok(Self { root })
    }

    /// The configured directory, whether or not it currently exists.
    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl PersistentStore for DirStore {
    fn resolve_root(&self) -> Option<PathBuf> {
        self.root.is_dir().then(|| self.root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_directory_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::new(tmp.path().join("card"));

        assert!(!store.is_available());
        assert!(!store.exists("history.txt"));
        assert!(matches!(
            store.read("history.txt"),
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            store.write("history.txt", "1\n", WriteMode::Append),
            Err(StoreError::Unavailable)
        ));
    }

    #[test]
    fn test_append_and_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::create(tmp.path().join("card")).unwrap();

        assert_eq!(store.read("a.txt").unwrap(), None);
        store.write("a.txt", "1\n", WriteMode::Append).unwrap();
        store.write("a.txt", "2\n", WriteMode::Append).unwrap();
        assert_eq!(store.read("a.txt").unwrap().as_deref(), Some("1\n2\n"));

        store.write("a.txt", "3\n", WriteMode::Overwrite).unwrap();
        assert_eq!(store.read("a.txt").unwrap().as_deref(), Some("3\n"));

        store.remove("a.txt").unwrap();
        assert!(!store.exists("a.txt"));
        // Removing twice is fine
        store.remove("a.txt").unwrap();
    }

    #[test]
    fn test_rejects_nested_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirStore::create(tmp.path()).unwrap();

        assert!(matches!(
            store.write("../escape.txt", "x", WriteMode::Overwrite),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.read("a/b.txt"),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn test_same_location() {
        let tmp = tempfile::tempdir().unwrap();
        let a = DirStore::create(tmp.path().join("a")).unwrap();
        let a2 = DirStore::new(tmp.path().join("a"));
        let b = DirStore::create(tmp.path().join("b")).unwrap();
        let gone = DirStore::new(tmp.path().join("gone"));

        assert!(a.same_location(&a2));
        assert!(!a.same_location(&b));
        assert!(!gone.same_location(&gone));
    }

    #[test]
    fn test_store_comes_and_goes_with_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("card");
        let store = DirStore::new(&root);
        assert!(!store.is_available());

        fs::create_dir_all(&root).unwrap();
        assert!(store.is_available());
        store.write("x", "y", WriteMode::Overwrite).unwrap();

        fs::remove_dir_all(&root).unwrap();
        assert!(!store.is_available());
    }
}
