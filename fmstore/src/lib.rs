//! Storage core of a terminal file manager.
//!
//! A [`PathHandle`] addresses local disk, an object store, a remote shell
//! host or a member inside an archive through one operation set. Remote
//! metadata is cached in a [`CacheRegistry`]; mutations invalidate what they
//! touched before reporting success, and higher-level executors report
//! finished batches to the [`CacheInvalidationCoordinator`].

pub mod archive;
pub mod backend;
pub mod cache;
pub mod cadapter;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod locator;
pub mod path;
pub mod types;

pub use cache::CacheRegistry;
pub use config::StoreConfig;
pub use error::{Result, StorageError};
pub use invalidation::{CacheInvalidationCoordinator, Mutation};
pub use locator::{Locator, Scheme};
pub use path::{PathHandle, Presence, StorageContext};
pub use types::{DirEntry, EntryKind, Metadata};
