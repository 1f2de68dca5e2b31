/*!
 * pagemerge
 * Transparent user-level page deduplication for co-located processes
 *
 * Sibling processes pinned to one node routinely replicate large read-mostly
 * data structures. This layer hands out demand-paged read-only regions,
 * privatizes pages on first write through a fault handler, and periodically
 * collapses byte-identical or all-zero pages onto shared frames of a
 * node-wide backing file.
 */

pub mod config;
pub mod core;
pub mod fault;
pub mod heap;
pub mod index;
pub mod layer;
pub mod merge;
pub mod policy;
pub mod shared;
pub mod stats;
pub mod sys;

pub use crate::core::errors::{HeapError, InitError, LayerError, MapError};
pub use crate::core::types::{Address, PageIndex, SiblingId, Size};
pub use config::{Config, MergeMode};
pub use layer::{get, init, runtime_finalize, runtime_init, Layer, PageState};
pub use stats::MemSnapshot;
