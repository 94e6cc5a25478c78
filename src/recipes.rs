//! Build recipe discovery.
//!
//! A recipe is a file named exactly `Makefile`. Discovery walks the whole tree
//! without following symlinks, so a repository cannot point the walk outside
//! its own working directory.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// File name identifying a build recipe.
pub const RECIPE_FILE_NAME: &str = "Makefile";

/// Paths of every `Makefile` under `root`, sorted.
pub fn find_makefile_paths(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == RECIPE_FILE_NAME)
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();
    paths
}

/// Directories under `root` containing a `Makefile`, sorted. Empty when the
/// tree has no recipes.
pub fn find_makefiles(root: &Path) -> Vec<PathBuf> {
    find_makefile_paths(root)
        .into_iter()
        .filter_map(|path| path.parent().map(Path::to_path_buf))
        .collect()
}

/// True if `dir` directly contains a file with any of the given names.
pub fn contains_files(dir: &Path, names: &[&str]) -> bool {
    names.iter().any(|name| dir.join(name).is_file())
}

/// Path of `dir` relative to `root`, with `.` for the root itself.
pub fn relative_dir(root: &Path, dir: &Path) -> PathBuf {
    match dir.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => PathBuf::from("."),
        Ok(rel) => rel.to_path_buf(),
        Err(_) => dir.to_path_buf(),
    }
}
