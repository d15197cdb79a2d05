//! # Upstream access
//!
//! The round-tripper and authentication broker the repository front-ends
//! use to talk to their configured upstreams.
//!
//! [`UpstreamClient`] builds the upstream URL from the inbound request,
//! clones client headers, propagates the correlation ID and retries exactly
//! once with an `Authorization` header when the upstream answers a
//! challenge. [`UpstreamAuth`] turns that `WWW-Authenticate` challenge into
//! the header value, caching bearer and ECR credentials along the way.

mod auth;
mod challenge;
mod client;
mod error;

pub use auth::UpstreamAuth;
pub use challenge::{parse_www_authenticate, Challenge};
pub use client::UpstreamClient;
pub use error::UpstreamError;
