use std::collections::BTreeMap;

use serde::Deserialize;

/// One logical repository: a name, its type, the upstream it proxies and the
/// artifact-name mappings that route requests to it.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    pub name: String,

    /// Repository type id, e.g. `docker`, `container`, `terraform`, `tofu`.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub description: String,

    pub upstream: UpstreamConfig,

    /// `/`-delimited glob patterns; `*` matches a single segment.
    #[serde(default)]
    pub mappings: Vec<String>,
}

/// The upstream service a repository proxies, e.g. `https://registry-1.docker.io`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,

    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Declarative upstream authentication.
///
/// `provider` selects the mechanism (empty, `dockerhub`, `ghcr`, `bearer`,
/// `basic`, `ecr`); `config` carries its string settings such as
/// `username`/`password` or the ECR region and keys.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub provider: String,

    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_repo_config() {
        let yaml_equivalent = serde_json::json!({
            "name": "mirror",
            "type": "docker",
            "upstream": { "url": "https://registry-1.docker.io" },
            "mappings": ["library/*"],
        });
        let config: RepoConfig = serde_json::from_value(yaml_equivalent).unwrap();
        assert_eq!(config.name, "mirror");
        assert_eq!(config.kind, "docker");
        assert!(config.upstream.auth.is_none());
        assert_eq!(config.mappings, vec!["library/*"]);
    }

    #[test]
    fn auth_config_round_trips() {
        let value = serde_json::json!({
            "name": "gh",
            "type": "container",
            "upstream": {
                "url": "https://ghcr.io",
                "auth": {
                    "provider": "ghcr",
                    "config": { "username": "demo", "password": "secret" }
                }
            }
        });
        let config: RepoConfig = serde_json::from_value(value).unwrap();
        let auth = config.upstream.auth.unwrap();
        assert_eq!(auth.provider, "ghcr");
        assert_eq!(auth.config.get("username").unwrap(), "demo");
    }
}
