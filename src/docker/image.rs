//! Compile-image freshness check.
//!
//! The compile image bakes in build scripts from the host checkout. A run is
//! refused when any of those sources changed after the image was built.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use bollard::errors::Error as BollardError;
use bollard::Docker;
use chrono::{DateTime, Utc};
use tracing::{debug, error};
use walkdir::WalkDir;

/// Result of comparing the image build time with its sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    /// The image is newer than every source file.
    UpToDate,
    /// `newest` was modified after the image was created.
    Stale { newest: PathBuf },
    /// The image does not exist locally.
    Missing,
}

impl ImageStatus {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Self::UpToDate)
    }
}

/// Check whether `image` was built after the last change to any file under `sources`.
///
/// Missing source paths are ignored, so an empty list only checks that the
/// image exists.
pub async fn check_image(image: &str, sources: &[PathBuf]) -> anyhow::Result<ImageStatus> {
    let docker = Docker::connect_with_local_defaults()
        .context("Failed to connect to the Docker daemon")?;

    let inspect = match docker.inspect_image(image).await {
        Ok(inspect) => inspect,
        Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
            error!(image = %image, "Docker image not found, build it with `docker build -t {image} .`");
            return Ok(ImageStatus::Missing);
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to inspect image '{image}'")),
    };

    let created = inspect
        .created
        .as_deref()
        .context("Image inspection returned no creation time")?;
    let created: DateTime<Utc> = DateTime::parse_from_rfc3339(created)
        .with_context(|| format!("Unparseable image creation time '{created}'"))?
        .with_timezone(&Utc);
    debug!(image = %image, %created, "Image creation time");

    let status = compare(created, newest_modification(sources));
    if let ImageStatus::Stale { newest } = &status {
        error!(
            image = %image,
            newest = %newest.display(),
            "Docker image is out-of-date, rebuild it with `docker build -t {image} .`"
        );
    }
    Ok(status)
}

/// Compare the image creation time with the newest source modification.
pub fn compare(created: DateTime<Utc>, newest: Option<(PathBuf, SystemTime)>) -> ImageStatus {
    match newest {
        Some((path, modified)) if DateTime::<Utc>::from(modified) > created => {
            ImageStatus::Stale { newest: path }
        }
        _ => ImageStatus::UpToDate,
    }
}

/// Find the most recently modified file below any of the given paths.
pub fn newest_modification(paths: &[PathBuf]) -> Option<(PathBuf, SystemTime)> {
    paths
        .iter()
        .filter(|p| p.exists())
        .flat_map(|p| files_under(p))
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((path, modified))
        })
        .max_by_key(|(_, modified)| *modified)
}

fn files_under(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| !entry.path().components().any(|c| c.as_os_str() == "__pycache__"))
        .map(|entry| entry.into_path())
}
