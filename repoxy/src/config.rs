use eyre::WrapErr;
use repo::RepoConfig;
use serde::Deserialize;
use storage::StorageConfig;

/// One listener the server binds. TLS termination is assembled outside the
/// proxy core, so a listener is just an address.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

/// The shape of one configuration file. Several files may be merged.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    #[serde(rename = "repos")]
    repositories: Vec<RepoConfig>,
}

/// The merged configuration the server runs from.
#[derive(Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub repositories: Vec<RepoConfig>,
}

/// Load and merge every configuration file matching the glob. At most one
/// file may carry the server section and one the storage section; repository
/// lists are concatenated.
pub fn load_configs(pattern: &str) -> eyre::Result<Config> {
    let mut server = None;
    let mut storage = None;
    let mut repositories = Vec::new();

    let entries =
        glob::glob(pattern).wrap_err_with(|| format!("bad config file glob {pattern:?}"))?;
    for entry in entries {
        let path = entry.wrap_err("resolve config file")?;
        let text = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("failed to open config file {}", path.display()))?;
        let file: FileConfig = serde_yaml::from_str(&text)
            .wrap_err_with(|| format!("failed to decode config file {}", path.display()))?;

        if let Some(section) = file.server {
            eyre::ensure!(server.is_none(), "multiple server configurations found");
            server = Some(section);
        }
        if let Some(section) = file.storage {
            eyre::ensure!(storage.is_none(), "multiple storage configurations found");
            storage = Some(section);
        }
        repositories.extend(file.repositories);
    }

    eyre::ensure!(
        !repositories.is_empty(),
        "no repositories found in configuration files"
    );
    let server = server
        .ok_or_else(|| eyre::eyre!("no server configuration found in configuration files"))?;
    let storage = storage
        .ok_or_else(|| eyre::eyre!("no storage configuration found in configuration files"))?;

    Ok(Config {
        server,
        storage,
        repositories,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &std::path::Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn merges_split_config_files() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "server.yaml",
            "server:\n  listeners:\n    - address: \"127.0.0.1:8080\"\nstorage:\n  url: \"memory://\"\nrepos:\n  - name: mirror\n    type: docker\n    upstream:\n      url: \"https://registry-1.docker.io\"\n    mappings: [\"library/*\"]\n",
        );
        write(
            dir.path(),
            "tf.yaml",
            "repos:\n  - name: tf\n    type: terraform\n    upstream:\n      url: \"https://registry.terraform.io\"\n    mappings: [\"hashicorp/*\"]\n",
        );

        let pattern = format!("{}/*.yaml", dir.path().display());
        let config = load_configs(&pattern).unwrap();
        assert_eq!(config.server.listeners.len(), 1);
        assert_eq!(config.repositories.len(), 2);
        assert_eq!(config.storage.url, "memory://");
    }

    #[test]
    fn duplicate_server_sections_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = "server:\n  listeners: []\nrepos:\n  - name: a\n    type: docker\n    upstream:\n      url: \"https://x\"\n";
        write(dir.path(), "a.yaml", server);
        write(dir.path(), "b.yaml", server);

        let pattern = format!("{}/*.yaml", dir.path().display());
        let err = load_configs(&pattern).unwrap_err();
        assert!(err.to_string().contains("multiple server configurations"));
    }

    #[test]
    fn missing_repositories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.yaml",
            "server:\n  listeners: []\nstorage:\n  url: \"memory://\"\n",
        );
        let pattern = format!("{}/*.yaml", dir.path().display());
        let err = load_configs(&pattern).unwrap_err();
        assert!(err.to_string().contains("no repositories"));
    }
}
