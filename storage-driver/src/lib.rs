//! Traits for storage drivers.
//!
//! This module defines the capability surface the caching engine uses to talk
//! to a filesystem backend. A backend implements [`Driver`]; everything above
//! it works in terms of forward-slash relative paths and treats "not found"
//! as a distinguished, cheap-to-test condition.

mod driver;
mod error;

pub use driver::DirEntry;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use error::StorageError;
pub use error::StorageErrorKind;
