//! Container execution layer for binforge.
//!
//! Every compilation and obfuscation step runs inside a throwaway container
//! started through the docker CLI. This module provides:
//!
//! - [`ContainerRunner`]: the seam the pipeline uses to run a command in a container
//! - [`DockerRunner`]: the `docker run --rm` implementation with bind mounts,
//!   user/group mapping and an in-container `timeout` wrapper
//! - [`check_image`]: verification that the compile image is newer than its sources
//!
//! # Example
//!
//! ```ignore
//! use binforge::docker::{ContainerCommand, ContainerRunner, ContainerUser, DockerRunner};
//! use std::time::Duration;
//!
//! let runner = DockerRunner::new("gcc-custom");
//! let command = ContainerCommand::new("make -C /usr/src/repo")
//!     .with_user(ContainerUser::Uid(30_001))
//!     .with_mount("repos/torvalds_____linux", "/usr/src/repo")
//!     .with_timeout(Some(Duration::from_secs(900)));
//! let result = runner.run(&command).await?;
//! ```

pub mod image;
pub mod runner;

pub use image::{check_image, ImageStatus};
pub use runner::{
    container_name, exit_outcome, remove_container, shell_quote, CommandResult,
    ContainerCommand, ContainerRunner, ContainerUser, DockerRunner, DEFAULT_IMAGE,
    TIMEOUT_EXIT_CODE,
};

/// Truncate captured output for log lines, respecting char boundaries.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
