//! # Terraform/OpenTofu front-end
//!
//! Pull-through caching for the Terraform provider registry protocol.
//!
//! Version lists and version manifests are cached as JSON documents in the
//! repository's refs tree; provider packages are cached as archives and the
//! download metadata's `download_url` is rewritten so clients fetch the
//! archive through the proxy. The same factory serves the `terraform`,
//! `tofu` and legacy `tofo` type IDs.

mod api;
mod repository;

pub use api::TerraformType;
pub use repository::TerraformRepository;
