//! Content-addressed compilation cache.
//!
//! Maps (normalized source, compiler config, sorted dependency set) to a
//! compiled artifact. Durable across processes, safe under concurrent
//! builders, and self-healing: integrity mismatches are silent misses that
//! trigger a rebuild.

pub mod key;
pub mod metadata;
pub mod store;

pub use key::{normalize_source, CacheKey};
pub use metadata::{checksum_file, EntryMetadata, METADATA_FILE};
pub use store::{BuiltArtifact, CacheEntry, CacheError, CacheStore, GetOrBuildError};
