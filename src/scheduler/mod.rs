//! Fleet scheduling and the run-wide sinks.
//!
//! ```text
//!   repository list ──► Fleet::dispatch ──► worker 1 ─┐
//!                        (Semaphore,        worker 2 ─┼─► mpsc ──► aggregator
//!                         n_procs)          worker N ─┘            ├─ MetadataLog
//!                                                                  └─ LibrarySet
//! ```
//!
//! - **Fleet**: bounded pool running one [`RepositoryPipeline`](crate::pipeline::RepositoryPipeline) per repository
//! - **MetadataLog**: JSON array of every variant snapshot
//! - **LibrarySet**: linked libraries across the run, flushed periodically

pub mod fleet;
pub mod libraries;
pub mod metadata;

pub use fleet::{Fleet, FleetConfig, FleetSummary};
pub use crate::error::FleetError;
pub use libraries::LibrarySet;
pub use metadata::MetadataLog;
