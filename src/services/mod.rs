//! Upload coordination: session actors, their registry, and finalization
//! into the content store, plus the metadata and post-processing
//! collaborators they call out to.

pub mod chunk_bitmap;
pub mod content_store;
pub mod finalize;
pub mod latch;
pub mod metadata;
pub mod post_process;
pub mod registry;
pub mod session;
pub mod upload_service;
