//! Working-tree archives.
//!
//! A repository is stored as `<archive_root>/<owner>/<name>.tar.{gz|xz}`
//! whose single top-level folder is the working directory name
//! (`<owner>_____<name>`), so extracting into the clone folder restores the
//! tree exactly where the pipeline expects it.
//!
//! Compression and extraction run on the blocking pool. A deadline sets a
//! cancellation flag checked between entries; a cancelled or failed
//! compression never leaves a partial archive behind.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::ArchiveError;

/// Archive compression format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    Gzip,
    Xz,
}

impl CompressionType {
    /// File extension including the tar suffix.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gzip => "tar.gz",
            Self::Xz => "tar.xz",
        }
    }
}

/// `<archive_root>/<owner>/<name>.<ext>`.
pub fn archive_path(
    archive_root: &Path,
    owner: &str,
    name: &str,
    compression: CompressionType,
) -> PathBuf {
    archive_root
        .join(owner)
        .join(format!("{}.{}", name, compression.extension()))
}

/// Total size in bytes of the regular files under `path`. Symlinks are not followed.
pub fn folder_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Human readable byte count, e.g. `1.50M`.
pub fn readable_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["", "K", "M", "G", "T"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}")
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

fn cancelled(path: &Path) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Interrupted,
        format!("archive operation on {} cancelled", path.display()),
    )
}

fn write_tar<W: Write>(
    writer: W,
    src_dir: &Path,
    top_name: &str,
    cancel: &AtomicBool,
) -> std::io::Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    for entry in WalkDir::new(src_dir).follow_links(false) {
        if cancel.load(Ordering::Relaxed) {
            return Err(cancelled(src_dir));
        }
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(std::io::Error::other)?;
        let name = Path::new(top_name).join(rel);
        if entry.file_type().is_dir() {
            builder.append_dir(&name, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }
    builder.into_inner()
}

fn compress_blocking(
    src_dir: &Path,
    top_name: &str,
    dest: &Path,
    compression: CompressionType,
    cancel: &AtomicBool,
) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = BufWriter::new(File::create(dest)?);
    match compression {
        CompressionType::Gzip => {
            let encoder = GzEncoder::new(file, flate2::Compression::default());
            write_tar(encoder, src_dir, top_name, cancel)?
                .finish()?
                .flush()
        }
        CompressionType::Xz => {
            let encoder = XzEncoder::new(file, 6);
            write_tar(encoder, src_dir, top_name, cancel)?
                .finish()?
                .flush()
        }
    }
}

fn unpack<R: Read>(reader: R, dest_parent: &Path, cancel: &AtomicBool) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        if cancel.load(Ordering::Relaxed) {
            return Err(cancelled(dest_parent));
        }
        entry?.unpack_in(dest_parent)?;
    }
    Ok(())
}

fn extract_blocking(
    archive: &Path,
    dest_parent: &Path,
    compression: CompressionType,
    cancel: &AtomicBool,
) -> std::io::Result<()> {
    std::fs::create_dir_all(dest_parent)?;
    let file = BufReader::new(File::open(archive)?);
    match compression {
        CompressionType::Gzip => unpack(GzDecoder::new(file), dest_parent, cancel),
        CompressionType::Xz => unpack(XzDecoder::new(file), dest_parent, cancel),
    }
}

/// Run a blocking archive job under an optional deadline.
async fn run_cancellable<F>(
    path: &Path,
    timeout: Option<Duration>,
    job: F,
) -> Result<(), ArchiveError>
where
    F: FnOnce(&AtomicBool) -> std::io::Result<()> + Send + 'static,
{
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || job(&flag));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                // Wait for the job to observe the flag before the caller cleans up.
                let _ = handle.await;
                return Err(ArchiveError::Timeout {
                    path: path.to_path_buf(),
                    timeout: limit,
                });
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(result) => result.map_err(|e| ArchiveError::Failed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
        Err(e) => Err(ArchiveError::Failed {
            path: path.to_path_buf(),
            reason: format!("archive task failed: {e}"),
        }),
    }
}

/// Compress `src_dir` into `dest` with `top_name` as the archive's root folder.
///
/// On failure or timeout the partial archive is removed.
pub async fn compress(
    src_dir: &Path,
    top_name: &str,
    dest: &Path,
    compression: CompressionType,
    timeout: Option<Duration>,
) -> Result<(), ArchiveError> {
    let (src, top, out) = (src_dir.to_path_buf(), top_name.to_string(), dest.to_path_buf());
    write_archive(dest, timeout, move |cancel| {
        compress_blocking(&src, &top, &out, compression, cancel)
    })
    .await
}

/// Run a job that writes `dest`, removing whatever it left behind when it
/// fails or runs out of time.
async fn write_archive<F>(dest: &Path, timeout: Option<Duration>, job: F) -> Result<(), ArchiveError>
where
    F: FnOnce(&AtomicBool) -> std::io::Result<()> + Send + 'static,
{
    let result = run_cancellable(dest, timeout, job).await;
    if result.is_err() && dest.exists() {
        if let Err(e) = tokio::fs::remove_file(dest).await {
            debug!(path = %dest.display(), error = %e, "Failed to remove partial archive");
        }
    }
    result
}

/// Extract `archive` into `dest_parent`, recreating its top-level folder there.
pub async fn extract(
    archive: &Path,
    dest_parent: &Path,
    compression: CompressionType,
    timeout: Option<Duration>,
) -> Result<(), ArchiveError> {
    let (src, dest) = (archive.to_path_buf(), dest_parent.to_path_buf());
    run_cancellable(archive, timeout, move |cancel| {
        extract_blocking(&src, &dest, compression, cancel)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timed_out_archive_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("owner_____name.tar.gz");
        let out = dest.clone();

        let err = write_archive(&dest, Some(Duration::from_millis(50)), move |cancel| {
            std::fs::write(&out, b"partial")?;
            while !cancel.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "cancelled"))
        })
        .await
        .expect_err("should time out");

        assert!(
            matches!(err, ArchiveError::Timeout { ref path, timeout } if path == &dest && timeout == Duration::from_millis(50)),
            "unexpected error: {err}"
        );
        assert!(!dest.exists());
    }

    fn sample_tree(root: &Path) -> PathBuf {
        let tree = root.join("owner_____name");
        std::fs::create_dir_all(tree.join("src/empty")).expect("mkdir");
        std::fs::write(tree.join("Makefile"), "all:\n\tcc main.c\n").expect("write");
        std::fs::write(tree.join("src/main.c"), "int main(void) { return 0; }\n").expect("write");
        tree
    }

    async fn round_trip(compression: CompressionType) {
        let dir = tempfile::tempdir().expect("tempdir");
        let tree = sample_tree(dir.path());
        let dest = archive_path(&dir.path().join("archives"), "owner", "name", compression);

        compress(&tree, "owner_____name", &dest, compression, Some(Duration::from_secs(30)))
            .await
            .expect("compress");
        assert!(dest.exists());

        let restore = dir.path().join("restore");
        extract(&dest, &restore, compression, Some(Duration::from_secs(30)))
            .await
            .expect("extract");

        let restored = restore.join("owner_____name");
        assert_eq!(
            std::fs::read_to_string(restored.join("src/main.c")).expect("read"),
            "int main(void) { return 0; }\n"
        );
        assert!(restored.join("Makefile").is_file());
        assert!(restored.join("src/empty").is_dir());
    }

    #[tokio::test]
    async fn test_gzip_round_trip() {
        round_trip(CompressionType::Gzip).await;
    }

    #[tokio::test]
    async fn test_xz_round_trip() {
        round_trip(CompressionType::Xz).await;
    }

    #[test]
    fn test_archive_path() {
        let path = archive_path(Path::new("dataset/archives"), "o", "n", CompressionType::Xz);
        assert_eq!(path, PathBuf::from("dataset/archives/o/n.tar.xz"));
        assert_eq!(CompressionType::Gzip.extension(), "tar.gz");
    }

    #[tokio::test]
    async fn test_failed_compress_removes_partial_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("out/missing.tar.gz");
        let err = compress(
            &dir.path().join("does-not-exist"),
            "x",
            &dest,
            CompressionType::Gzip,
            None,
        )
        .await
        .expect_err("missing source");
        assert!(matches!(err, ArchiveError::Failed { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_extract_missing_archive_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = extract(
            &dir.path().join("nope.tar.xz"),
            dir.path(),
            CompressionType::Xz,
            Some(Duration::from_secs(5)),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_folder_size_and_readable() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), vec![0u8; 1000]).expect("write");
        std::fs::create_dir_all(dir.path().join("sub")).expect("mkdir");
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 24]).expect("write");
        assert_eq!(folder_size(dir.path()), 1024);
        assert_eq!(readable_size(1024), "1.00K");
        assert_eq!(readable_size(512), "512");
        assert_eq!(readable_size(3 * 1024 * 1024 / 2), "1.50M");
    }
}
