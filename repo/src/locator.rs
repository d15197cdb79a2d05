use crate::error::StoreError;

/// Identifies a logical object within the registry abstraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locator {
    pub host: String,
    pub name: String,
    pub label: Option<String>,
    pub version_id: Option<String>,
    pub file_name: Option<String>,
}

impl Locator {
    pub fn new(host: impl Into<String>, name: impl Into<String>) -> Self {
        Locator {
            host: host.into(),
            name: name.into(),
            ..Locator::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_version_id(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }
}

/// Validates and normalizes the host and name of a locator.
pub(crate) fn sanitize_locator(loc: &Locator) -> Result<(String, String), StoreError> {
    let host = sanitize_host(&loc.host)?;
    let name = sanitize_name(&loc.name)?;
    Ok((host, name))
}

pub(crate) fn sanitize_host(host: &str) -> Result<String, StoreError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(StoreError::InvalidLocator("host is required".to_string()));
    }
    if host.contains('/') {
        return Err(StoreError::InvalidLocator(format!(
            "host {host:?} must not contain '/'"
        )));
    }
    if host.contains("..") {
        return Err(StoreError::InvalidLocator(format!(
            "host {host:?} cannot contain '..'"
        )));
    }
    Ok(host.to_string())
}

pub(crate) fn sanitize_name(name: &str) -> Result<String, StoreError> {
    let name = name.trim().trim_matches('/');
    if name.is_empty() {
        return Err(StoreError::InvalidLocator("name is required".to_string()));
    }
    for part in name.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(StoreError::InvalidLocator(format!(
                "invalid path segment {part:?}"
            )));
        }
    }
    Ok(name.to_string())
}

pub(crate) fn sanitize_version_id(id: &str) -> Result<String, StoreError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(StoreError::InvalidLocator(
            "version id is required".to_string(),
        ));
    }
    if id.contains('/') {
        return Err(StoreError::InvalidLocator(format!(
            "version id {id:?} must not contain '/'"
        )));
    }
    Ok(id.to_string())
}
