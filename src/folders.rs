//! Runtime folders and the JSON file helpers used by every persisted state.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::types::{Error, Result};

/// Configuration scope, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scope {
    System,
    User,
    Workspace,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::System => write!(f, "system"),
            Scope::User => write!(f, "user"),
            Scope::Workspace => write!(f, "workspace"),
        }
    }
}

/// System (shared by all users), user (shared by all applications of a
/// user) and workspace (this application) folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folders {
    pub system: Option<PathBuf>,
    pub user: Option<PathBuf>,
    pub workspace: PathBuf,
}

impl Folders {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            system: None,
            user: None,
            workspace: workspace.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<PathBuf>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<PathBuf>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Existing scopes, lowest precedence first.
    pub fn scopes(&self) -> Vec<(Scope, &Path)> {
        let mut out = Vec::with_capacity(3);
        if let Some(system) = &self.system {
            out.push((Scope::System, system.as_path()));
        }
        if let Some(user) = &self.user {
            out.push((Scope::User, user.as_path()));
        }
        out.push((Scope::Workspace, self.workspace.as_path()));
        out
    }

    pub fn scope(&self, scope: Scope) -> Option<&Path> {
        match scope {
            Scope::System => self.system.as_deref(),
            Scope::User => self.user.as_deref(),
            Scope::Workspace => Some(self.workspace.as_path()),
        }
    }

    /// Logging folder; relative values are resolved from the workspace.
    pub fn logs(&self, logs_folder: &str) -> PathBuf {
        let path = Path::new(logs_folder);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }
}

/// Read a JSON file. A missing file is `Ok(None)`; a file that does not
/// deserialize into `T` is a validation error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::validation(format!("invalid json file {}: {}", path.display(), e)))
}

/// Write a JSON file, creating parent folders. The content goes through a
/// sibling temporary file so readers never see a partial document.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_scopes_are_ordered_by_precedence() {
        let folders = Folders::new("/ws").with_user("/u").with_system("/s");
        let scopes: Vec<Scope> = folders.scopes().into_iter().map(|(s, _)| s).collect();
        assert_eq!(scopes, vec![Scope::System, Scope::User, Scope::Workspace]);

        let folders = Folders::new("/ws");
        assert_eq!(folders.scopes().len(), 1);
        assert!(folders.scope(Scope::User).is_none());
    }

    #[test]
    fn test_logs_folder_resolution() {
        let folders = Folders::new("/ws");
        assert_eq!(folders.logs("logs"), PathBuf::from("/ws/logs"));
        assert_eq!(folders.logs("/var/log/x"), PathBuf::from("/var/log/x"));
    }

    #[test]
    fn test_json_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let missing: Option<BTreeMap<String, String>> = read_json(&path).unwrap();
        assert!(missing.is_none());

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), "1".to_string());
        write_json(&path, &map).unwrap();
        let back: BTreeMap<String, String> = read_json(&path).unwrap().unwrap();
        assert_eq!(back, map);

        std::fs::write(&path, "{\"a\": 1}").unwrap();
        let err = read_json::<BTreeMap<String, String>>(&path).unwrap_err();
        assert_eq!(err.code(), crate::types::ResultCode::ErrorValidation);
    }
}
