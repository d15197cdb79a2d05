//! # OCI front-end
//!
//! Pull-through caching for the Docker/OCI distribution v2 wire protocol.
//!
//! Requests enter through the routes mounted by [`OciType`] and dispatch to
//! the configured repository whose name mappings best match the image name.
//! Blobs are cached by digest and served without touching the upstream once
//! stored; manifests are cached by tag against the upstream host and serve
//! as a fallback when the upstream is unavailable. All write operations
//! answer 405: the repository is read-only.

mod api;
mod repository;

pub use api::OciType;
pub use repository::OciRepository;
