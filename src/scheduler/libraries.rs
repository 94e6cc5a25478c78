//! Run-wide set of linked libraries.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::compile::{read_library_log, write_library_log};

/// Libraries seen across the run, persisted to an optional file.
///
/// Loaded from the file at start-up so repeated runs accumulate; the file is
/// overwritten on every [`flush`](Self::flush).
#[derive(Debug, Default)]
pub struct LibrarySet {
    path: Option<PathBuf>,
    libraries: BTreeSet<String>,
}

impl LibrarySet {
    /// An in-memory set that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the set from `path`, or start empty when the file does not exist.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let libraries = read_library_log(path)?;
        debug!(path = %path.display(), count = libraries.len(), "Loaded library set");
        Ok(Self {
            path: Some(path.to_path_buf()),
            libraries,
        })
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, libraries: I) {
        self.libraries.extend(libraries);
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }

    pub fn contains(&self, library: &str) -> bool {
        self.libraries.contains(library)
    }

    /// Overwrite the backing file with the current set. No-op in memory.
    pub fn flush(&self) -> std::io::Result<()> {
        match &self.path {
            Some(path) => write_library_log(path, &self.libraries),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_merge_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("libraries.txt");
        std::fs::write(&path, "m\npthread\n").expect("write");

        let mut set = LibrarySet::load(&path).expect("load");
        assert_eq!(set.len(), 2);
        set.extend(["ssl".to_string(), "m".to_string()]);
        assert_eq!(set.len(), 3);
        set.flush().expect("flush");

        let reloaded = LibrarySet::load(&path).expect("reload");
        assert!(reloaded.contains("ssl"));
        assert_eq!(reloaded.len(), 3);
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let set = LibrarySet::load(&dir.path().join("none.txt")).expect("load");
        assert!(set.is_empty());
    }

    #[test]
    fn test_in_memory_flush_is_noop() {
        let mut set = LibrarySet::in_memory();
        set.extend(["z".to_string()]);
        set.flush().expect("flush");
        assert!(set.contains("z"));
    }
}
