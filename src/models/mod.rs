//! Core data models for the chunked upload service.
//!
//! `upload` holds the caller-supplied descriptor and the wire types exchanged
//! with uploaders; `file` holds the finalized store entry as persisted by the
//! metadata store (`sqlx::FromRow`) and read back to serve
//! `GET /api/files/{digest}`.

pub mod file;
pub mod upload;
