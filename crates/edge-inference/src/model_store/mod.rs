//! Model catalog, resumable downloads and the durable version record.

pub mod catalog;
pub mod download_manager;
pub mod integrity;
pub mod progress;
pub mod version_store;

pub use catalog::{ModelCatalog, ModelDefinition, ModelFile, ResolvedFile};
pub use download_manager::{DownloadHandle, DownloadManager};
pub use progress::{DownloadEvent, DownloadListener, DownloadState, DownloadStatus};
pub use version_store::{ModelVersionEntry, ModelVersionStore};
