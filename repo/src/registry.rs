use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use observability::Metrics;
use serde::Serialize;
use storage::{Fs, StorageError};
use tokio::sync::RwLock;

use crate::config::RepoConfig;
use crate::error::StoreError;
use crate::store::CommonStorage;

/// Errors produced by the repository registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid repository type {0:?}")]
    InvalidRepoType(String),

    #[error("repository type {0:?} not initialized")]
    NotInitialized(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A factory failed to construct a repository instance.
    #[error("create repository: {0}")]
    Repository(String),
}

/// Read-only metadata describing a repository instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceMeta {
    pub id: String,
    pub label: String,
    pub description: String,
    pub type_id: String,
}

/// One configured repository at runtime.
pub trait Instance: Send + Sync {
    /// Reports how well the instance's mappings match the provided artifact
    /// path segments. Zero means no match.
    fn match_weight(&self, name: &[&str]) -> usize;

    /// Read-only metadata used to label the repository.
    fn describe(&self) -> InstanceMeta;
}

/// A repository type: mounts its wire protocol's routes once and constructs
/// per-repository instances on demand.
pub trait RepositoryType: Send + Sync + 'static {
    /// The routes served by this type. Called exactly once per factory
    /// object, however many aliases it is registered under.
    fn routes(self: Arc<Self>) -> Router;

    /// Construct an instance for the given logical repository
    /// configuration, backed by the provided storage engine.
    fn new_repository(
        &self,
        common: CommonStorage,
        config: &RepoConfig,
    ) -> Result<Arc<dyn Instance>, RegistryError>;
}

struct TypeEntry {
    factory: Arc<dyn RepositoryType>,
    root: Option<Fs>,
    ready: bool,
}

#[derive(Default)]
struct RegistryInner {
    types: BTreeMap<String, TypeEntry>,
    instances: BTreeMap<String, Arc<dyn Instance>>,
}

/// Maps repository type IDs to their factories and owns the per-repository
/// instances. Lives on the serving assembly; nothing here is process-global.
pub struct Registry {
    metrics: Metrics,
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new(metrics: Metrics) -> Self {
        Registry {
            metrics,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a factory under one or more `|`-separated type IDs.
    /// Aliases share the factory object but are distinct type entries.
    ///
    /// # Panics
    ///
    /// Panics when a type ID is registered twice; registration happens in
    /// the composition root where that is a programming error.
    pub async fn must_register(&self, type_ids: &str, factory: Arc<dyn RepositoryType>) {
        let mut inner = self.inner.write().await;
        for type_id in type_ids.split('|') {
            if inner.types.contains_key(type_id) {
                panic!("repository type {type_id:?} already registered");
            }
            inner.types.insert(
                type_id.to_string(),
                TypeEntry {
                    factory: factory.clone(),
                    root: None,
                    ready: false,
                },
            );
        }
    }

    /// Prepare every registered type: create its `type/<typeId>` storage
    /// subtree and collect its routes into one router. Each factory's
    /// routes are mounted exactly once even when it serves several aliases.
    pub async fn initialize(&self, root: &Fs) -> Result<Router, RegistryError> {
        let mut inner = self.inner.write().await;
        let mut router = Router::new();
        let mut mounted: Vec<Arc<dyn RepositoryType>> = Vec::new();

        for (type_id, entry) in inner.types.iter_mut() {
            let type_fs = root.ensure_sub(format!("type/{type_id}")).await?;
            entry.root = Some(type_fs);
            entry.ready = true;

            if !mounted
                .iter()
                .any(|factory| Arc::ptr_eq(factory, &entry.factory))
            {
                router = router.merge(entry.factory.clone().routes());
                mounted.push(entry.factory.clone());
            }
        }
        Ok(router)
    }

    /// Return the instance for `config.name`, constructing it on first
    /// reference. The instance's storage is scoped to
    /// `type/<typeId>/<repoName>` and labelled for metrics accordingly.
    pub async fn new_repository(
        &self,
        config: &RepoConfig,
    ) -> Result<Arc<dyn Instance>, RegistryError> {
        let mut inner = self.inner.write().await;
        if let Some(instance) = inner.instances.get(&config.name) {
            return Ok(instance.clone());
        }

        let entry = inner
            .types
            .get(&config.kind)
            .ok_or_else(|| RegistryError::InvalidRepoType(config.kind.clone()))?;
        if !entry.ready {
            return Err(RegistryError::NotInitialized(config.kind.clone()));
        }
        let root = entry
            .root
            .clone()
            .ok_or_else(|| RegistryError::NotInitialized(config.kind.clone()))?;

        let repo_fs = root.ensure_sub(&config.name).await?;
        let common = CommonStorage::with_labels(
            repo_fs,
            self.metrics.clone(),
            &config.kind,
            &config.name,
        );
        let instance = entry.factory.new_repository(common, config)?;
        inner
            .instances
            .insert(config.name.clone(), instance.clone());
        Ok(instance)
    }

    /// All constructed instances, in name order.
    pub async fn instances(&self) -> Vec<Arc<dyn Instance>> {
        let inner = self.inner.read().await;
        inner.instances.values().cloned().collect()
    }
}
