//! Filesystem layer: path and entry codecs, root header, directory walker,
//! file handles and the cache manager

pub mod entry;
pub mod handle;
pub mod header;
pub mod path;
pub mod registry;
pub mod volume;

pub use entry::DirEntry;
pub use handle::FileHandle;
pub use path::{compress, parse_path, PathEntry};
pub use registry::CacheManager;
pub use volume::Volume;
