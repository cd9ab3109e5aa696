//! Sync engine: resource index, persistent state, tree diff, and the
//! document/folder managers that drive them.

pub mod diff;
pub mod document;
pub mod folder;
pub mod resource;
pub mod state;

pub use document::{DocumentSync, DocumentSyncOptions, SyncOutcome};
pub use folder::{FolderSync, SyncStats};
pub use resource::ResourceIndex;
pub use state::{EntryKind, SyncState};
