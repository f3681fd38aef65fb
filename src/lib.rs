pub mod codec;
pub mod config;
pub mod error;
pub mod extract;
pub mod gzi;
pub mod index;
pub mod indexer;
pub mod merge;
pub mod planner;
pub mod remove;
pub mod source;

pub use codec::{derive_key, CodecContext};
pub use config::{CodecKind, DuplicatesPolicy, KeyParams, KeySize, RetryPolicy};
pub use error::{FfdbError, Result};
pub use extract::{ExtractOptions, ExtractReport, Extractor};
pub use index::{IndexHeader, IndexRecord, IndexStore};
pub use indexer::{EntryPatterns, Indexer, IndexerOptions};
pub use merge::{merge, MergeOptions};
pub use remove::{remove, RemoveOptions};
pub use source::{open_source, ByteSource, SourceSpec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
