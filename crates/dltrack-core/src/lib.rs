//! dltrack core - download lifecycle manager
//!
//! This crate tracks every file transfer from creation through completion,
//! failure or cancellation. It persists the download list across restarts,
//! reconciles transfers interrupted by a crash, resolves naming collisions
//! in the downloads directory and applies the retention policy.
//!
//! The byte transfer itself is delegated to a [`TransferDelegate`]; opening
//! files goes through a [`ShellOpener`]. Start a registry with
//! [`RegistryHandle::open`] (SQLite store, local filesystem, system shell)
//! or [`RegistryHandle::start`] with your own collaborators.

mod coordinator;
mod error;
pub mod path_resolver;
mod platform;
pub mod progress;
pub mod query;
mod registry;
pub mod retention;
mod session;
mod settings;
pub mod state;
mod storage;

pub use coordinator::*;
pub use error::*;
pub use platform::*;
pub use query::{DateGroup, DownloadGroup};
pub use registry::{is_safe_to_open, Collaborators, SAFE_EXTENSIONS};
pub use session::{ProgressSink, TransferDelegate};
pub use settings::*;
pub use storage::*;
