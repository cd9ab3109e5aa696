//! Bidirectional sync between an Obsidian vault and Feishu/Lark documents.
//!
//! Markdown files convert to remote block trees and back; an incremental
//! tree-diff keeps both sides convergent with a minimal number of API
//! calls. See `DESIGN.md` for the component map.

pub mod auth;
pub mod block;
pub mod config;
pub mod convert;
pub mod error;
pub mod gateway;
pub mod restore;
pub mod sync;

pub use config::Config;
pub use error::SyncError;
pub use gateway::FeishuGateway;
