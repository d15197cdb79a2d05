//! Metrics and request correlation for the proxy.
//!
//! [`Metrics`] is a thin facade over a dedicated prometheus registry; every
//! metric the proxy emits is declared here exactly once. Recording is
//! best-effort: the facade never fails the operation being measured.

mod metrics;
mod request_id;

pub use metrics::{cache, Metrics};
pub use request_id::{ensure_request_id, new_request_id, RequestId, REQUEST_ID_HEADER};
