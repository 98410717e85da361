//! Append-only memory-mapped caches over flat chart databases.
//!
//! Two caches share one design: chunk data is appended to pre-sized
//! memory-mapped files under a cache directory named by an md5 of the cache
//! config, with a cursor file committed last so concurrent processes see
//! each chunk either completely or not at all.
//!
//! - [`query_cache::QueryCache`] holds one spatial tree per chunk, for
//!   feature lookups over a window.
//! - [`render_cache::RenderCache`] holds tessellated, grouped vertex and
//!   label buffers per chunk, ready for upload to the GPU.
//!
//! A chunk is one library/coverage pair. Conversions run on a shared
//! priority-queue scheduler whose jobs re-evaluate their priority at
//! dequeue, so stale requests can be deferred or abandoned.

pub mod cachedir;
pub mod databases;
pub mod geom;
pub mod geosym;
pub mod model;
pub mod proj;
pub mod query_cache;
pub mod render_build;
pub mod render_cache;
pub mod sched;
pub mod tree;
pub mod tree_build;

pub use geosym::{ExternalAttrs, GeosymAssignment};
pub use model::{coverage_significance, ChunkKey, ChunkPriority, Coverage, Library};
pub use proj::{PlateCarree, Projection};
pub use query_cache::{QueryCache, QueryCacheConfig, SpatialQuery};
pub use render_cache::{RenderCache, RenderCacheConfig, RenderChunk, RenderGroup};
pub use tree::Tree;
