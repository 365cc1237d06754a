//! Range-addressed reading of remote ZIP archives.

pub mod cache;
pub mod reader;
pub mod source;
pub mod zip;

pub use cache::ArchiveCache;
pub use reader::{RemoteArchive, Target};
pub use source::{ByteProgress, HttpSource, MemorySource, RangeSource, SourceInfo};

/// Progress callback taking a percentage in `0..=100`.
pub type ProgressFn<'a> = dyn Fn(u8) + Send + Sync + 'a;
