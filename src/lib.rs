// Clippy configuration: enable pedantic but allow overly strict lints
#![allow(clippy::missing_errors_doc)] // Internal functions don't need # Errors docs
#![allow(clippy::missing_panics_doc)] // Internal functions don't need # Panics docs
#![allow(clippy::must_use_candidate)] // Not all getters need #[must_use]
#![allow(clippy::module_name_repetitions)] // e.g., ServerConfig in registry module is fine
#![allow(clippy::doc_markdown)] // Don't require backticks around rsync, sshfs, etc.
#![allow(clippy::cast_possible_truncation)] // Progress percentages are clamped first
#![allow(clippy::cast_sign_loss)] // Progress percentages are clamped first
#![allow(clippy::significant_drop_tightening)] // Lock guard drops are intentional
#![allow(clippy::redundant_closure_for_method_calls)] // Sometimes closures are clearer
#![allow(clippy::needless_pass_by_value)] // PathBuf by value is fine for config loading

//! simoffload - run simulation cases on remote backends
//!
//! Binds a local case directory to a directory on an SSH host or WSL
//! distribution, mirrors files both ways with rsync, and drives a
//! per-location task-spooler queue.
//!
//! Layers, leaves first:
//! - [`registry`]: named backend configurations
//! - [`server`]: backends (command execution, transfer, directory lifecycle)
//! - [`location`]: a remote directory with an explicit validity state
//! - [`execution`]: a location persisted next to a local case directory
//! - [`queue`]: the task-spooler client and output following
//! - [`mount`]: sshfs mounts of remote directories

pub mod config;
pub mod errors;
pub mod execution;
pub mod location;
pub mod mount;
pub mod queue;
pub mod registry;
pub mod server;
mod xml;

pub use errors::{OffloadError, Result};
pub use execution::RemoteExecutionConfig;
pub use location::{LocationState, RemoteLocation};
pub use mount::MountPoint;
pub use queue::{CommandQueueClient, Job, JobList, JobState};
pub use registry::{ServerConfig, ServerKind, ServerRegistry};
pub use server::RemoteServer;
