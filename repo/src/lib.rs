//! # Repository engine
//!
//! The storage engine and registry shared by every repository type:
//!
//! - [`Digest`]: content-addressed blob identity `<algo>:<hex>`.
//! - [`Locator`]: the addressing tuple used by [`CommonStorage`].
//! - [`CommonStorage`]: blob put/open/stat, version create/get/list/delete,
//!   label bind/resolve/delete, host/name enumeration, atomic JSON writes.
//! - [`NameMatchers`]: specificity weighting of artifact names against the
//!   configured glob mappings.
//! - [`Registry`]: maps repository type IDs to their factories, mounts
//!   routes and constructs per-repository instances.

mod config;
mod digest;
mod error;
mod locator;
mod matcher;
mod registry;
mod store;
mod version_id;

pub use config::{AuthConfig, RepoConfig, UpstreamConfig};
pub use digest::Digest;
pub use error::StoreError;
pub use locator::Locator;
pub use matcher::NameMatchers;
pub use registry::{Instance, InstanceMeta, Registry, RegistryError, RepositoryType};
pub use store::{CommonStorage, FileEntry, LabelBindings, VersionMeta, VersionSummary};
pub use version_id::new_version_id;

/// The `kind` discriminator stored in label binding documents.
pub const LABEL_KIND: &str = "registry.labels";

/// The `kind` discriminator stored in version metadata documents.
pub const VERSION_KIND: &str = "registry.version";
