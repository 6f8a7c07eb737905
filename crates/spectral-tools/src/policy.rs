use spectral_core::PathPolicyConfig;
use std::path::{Path, PathBuf};

/// Filesystem allow/deny policy for adapters. An operation path must fall
/// under one of the allowed roots and under none of the denied roots; deny
/// takes precedence over allow.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    allow: Vec<PathBuf>,
    deny: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn new(allow: Vec<PathBuf>, deny: Vec<PathBuf>) -> Self {
        Self { allow, deny }
    }

    /// Build from config. An empty allow list falls back to the home and
    /// temp directories so a fresh install can operate at all.
    pub fn from_config(cfg: &PathPolicyConfig) -> Self {
        let mut allow: Vec<PathBuf> = cfg.allow.iter().map(PathBuf::from).collect();
        if allow.is_empty() {
            if let Some(home) = spectral_core::home_dir() {
                allow.push(home);
            }
            allow.push(std::env::temp_dir());
        }
        let deny = cfg.deny.iter().map(PathBuf::from).collect();
        Self { allow, deny }
    }

    pub fn is_allowed(&self, path: &Path) -> bool {
        let normalized = normalize(path);
        if self.deny.iter().any(|root| normalized.starts_with(normalize(root))) {
            return false;
        }
        self.allow
            .iter()
            .any(|root| normalized.starts_with(normalize(root)))
    }

    pub fn denial_message(&self, path: &Path) -> String {
        format!(
            "access denied by path policy: {} is outside the allowed roots",
            path.display()
        )
    }
}

/// Resolve the nearest existing ancestor so policy checks see through
/// not-yet-created leaf components, then re-append the remainder.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Ok(canonical_parent) = parent.canonicalize() {
            return canonical_parent.join(name);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn deny_takes_precedence_over_allow() {
        let root = TempDir::new().expect("tempdir");
        let blocked = root.path().join("secrets");
        std::fs::create_dir_all(&blocked).expect("mkdir");
        let policy = PathPolicy::new(vec![root.path().to_path_buf()], vec![blocked.clone()]);
        assert!(policy.is_allowed(&root.path().join("ok.txt")));
        assert!(!policy.is_allowed(&blocked.join("nope.txt")));
    }

    #[test]
    fn paths_outside_allow_are_rejected() {
        let root = TempDir::new().expect("tempdir");
        let other = TempDir::new().expect("tempdir");
        let policy = PathPolicy::new(vec![root.path().to_path_buf()], vec![]);
        assert!(!policy.is_allowed(&other.path().join("x.txt")));
    }

    #[test]
    fn nonexistent_leaf_is_checked_via_parent() {
        let root = TempDir::new().expect("tempdir");
        let policy = PathPolicy::new(vec![root.path().to_path_buf()], vec![]);
        assert!(policy.is_allowed(&root.path().join("brand-new.txt")));
    }
}
