//! Persistent cache engine for a pass-through cache filesystem: the
//! Metadata Store, the Block Store, and the Coherence Engine that ties
//! them together with a backend adapter (spec.md §4.2-§4.4).

mod blocks;
mod coherence;
mod error;
mod metadata;

pub use blocks::BlockStore;
pub use coherence::CoherenceEngine;
pub use error::CacheError;
pub use metadata::{AttrLookup, MetadataStore};
