pub mod file;
pub mod memory;
pub mod repository;
pub mod session;

pub use file::FileRepository;
pub use memory::MemoryRepository;
pub use repository::Repository;
pub use session::MessageLog;

use agentwire_core::{Config, Paths, StorageBackend};
use std::sync::Arc;

/// Builds the repository selected by `config.storage`.
pub fn open_repository(config: &Config, paths: &Paths) -> Arc<dyn Repository> {
    match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryRepository::new()),
        StorageBackend::File => Arc::new(FileRepository::new(config.storage_paths(paths))),
    }
}
