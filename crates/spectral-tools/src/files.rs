use crate::params::{optional_bool, optional_str, require_str};
use crate::policy::PathPolicy;
use serde_json::json;
use spectral_core::ActionResult;
use std::fs;
use std::path::{Path, PathBuf};

/// File and directory adapters. Every operation is gated by the path
/// policy before it touches the filesystem.
pub struct FileActions {
    policy: PathPolicy,
}

impl FileActions {
    pub fn new(policy: PathPolicy) -> Self {
        Self { policy }
    }

    fn check(&self, action: &str, path: &Path) -> Option<ActionResult> {
        if self.policy.is_allowed(path) {
            return None;
        }
        Some(ActionResult::fail(action, self.policy.denial_message(path)))
    }

    pub fn list(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "file_list";
        let directory = match require_str(params, &["directory", "path"]) {
            Ok(dir) => PathBuf::from(dir),
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        if let Some(denied) = self.check(ACTION, &directory) {
            return denied;
        }
        if !directory.exists() {
            return ActionResult::fail(
                ACTION,
                format!("directory does not exist: {}", directory.display()),
            );
        }
        let recursive = optional_bool(params, "recursive").unwrap_or(false);
        let mut entries = Vec::new();
        if recursive {
            collect_recursive(&directory, &directory, &mut entries);
        } else {
            match fs::read_dir(&directory) {
                Ok(dir) => {
                    for entry in dir.flatten() {
                        entries.push(entry.file_name().to_string_lossy().to_string());
                    }
                }
                Err(err) => return ActionResult::fail(ACTION, err.to_string()),
            }
        }
        entries.sort();
        let count = entries.len();
        ActionResult::ok(
            ACTION,
            format!("Listed {count} entries in {}", directory.display()),
        )
        .with_data(json!({"directory": directory, "entries": entries, "count": count}))
    }

    pub fn create_file(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "file_create";
        let path = match require_str(params, &["path", "file_path"]) {
            Ok(p) => PathBuf::from(p),
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        if let Some(denied) = self.check(ACTION, &path) {
            return denied;
        }
        let content = optional_str(params, "content").unwrap_or_default();
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                return ActionResult::fail(ACTION, err.to_string());
            }
        }
        match fs::write(&path, content.as_bytes()) {
            Ok(()) => ActionResult::ok(ACTION, format!("Created file {}", path.display()))
                .with_data(json!({"path": path, "size_bytes": content.len()})),
            Err(err) => ActionResult::fail(ACTION, err.to_string()),
        }
    }

    pub fn read_file(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "file_read";
        let path = match require_str(params, &["path", "file_path"]) {
            Ok(p) => PathBuf::from(p),
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        if let Some(denied) = self.check(ACTION, &path) {
            return denied;
        }
        match fs::read_to_string(&path) {
            Ok(content) => {
                let size = content.len();
                ActionResult::ok(ACTION, format!("Read {} ({size} bytes)", path.display()))
                    .with_data(json!({"path": path, "content": content, "size_bytes": size}))
            }
            Err(err) => ActionResult::fail(
                ACTION,
                format!("failed to read {}: {err}", path.display()),
            ),
        }
    }

    pub fn create_directory(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "file_create_directory";
        let path = match require_str(params, &["path", "directory"]) {
            Ok(p) => PathBuf::from(p),
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        if let Some(denied) = self.check(ACTION, &path) {
            return denied;
        }
        match fs::create_dir_all(&path) {
            Ok(()) => ActionResult::ok(ACTION, format!("Created directory {}", path.display()))
                .with_data(json!({"path": path})),
            Err(err) => ActionResult::fail(ACTION, err.to_string()),
        }
    }

    pub fn delete_file(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "file_delete";
        let path = match require_str(params, &["path", "file_path"]) {
            Ok(p) => PathBuf::from(p),
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        if let Some(denied) = self.check(ACTION, &path) {
            return denied;
        }
        if !path.exists() {
            return ActionResult::fail(
                ACTION,
                format!("file does not exist: {}", path.display()),
            );
        }
        match fs::remove_file(&path) {
            Ok(()) => ActionResult::ok(ACTION, format!("Deleted file {}", path.display()))
                .with_data(json!({"path": path})),
            Err(err) => ActionResult::fail(ACTION, err.to_string()),
        }
    }

    pub fn delete_directory(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "file_delete_directory";
        let path = match require_str(params, &["path", "directory"]) {
            Ok(p) => PathBuf::from(p),
            Err(err) => return ActionResult::fail(ACTION, err),
        };
        if let Some(denied) = self.check(ACTION, &path) {
            return denied;
        }
        if !path.exists() {
            return ActionResult::fail(
                ACTION,
                format!("directory does not exist: {}", path.display()),
            );
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => ActionResult::ok(ACTION, format!("Deleted directory {}", path.display()))
                .with_data(json!({"path": path})),
            Err(err) => ActionResult::fail(ACTION, err.to_string()),
        }
    }

    pub fn move_file(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "file_move";
        self.transfer(ACTION, params, |source, destination| {
            fs::rename(source, destination)
        })
    }

    pub fn copy_file(&self, params: &serde_json::Value) -> ActionResult {
        const ACTION: &str = "file_copy";
        self.transfer(ACTION, params, |source, destination| {
            fs::copy(source, destination).map(|_| ())
        })
    }

    fn transfer(
        &self,
        action: &str,
        params: &serde_json::Value,
        op: impl Fn(&Path, &Path) -> std::io::Result<()>,
    ) -> ActionResult {
        let source = match require_str(params, &["source", "from"]) {
            Ok(p) => PathBuf::from(p),
            Err(err) => return ActionResult::fail(action, err),
        };
        let destination = match require_str(params, &["destination", "to"]) {
            Ok(p) => PathBuf::from(p),
            Err(err) => return ActionResult::fail(action, err),
        };
        for path in [&source, &destination] {
            if let Some(denied) = self.check(action, path) {
                return denied;
            }
        }
        if !source.exists() {
            return ActionResult::fail(
                action,
                format!("source does not exist: {}", source.display()),
            );
        }
        if let Some(parent) = destination.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                return ActionResult::fail(action, err.to_string());
            }
        }
        match op(&source, &destination) {
            Ok(()) => ActionResult::ok(
                action,
                format!("{} -> {}", source.display(), destination.display()),
            )
            .with_data(json!({"source": source, "destination": destination})),
            Err(err) => ActionResult::fail(action, err.to_string()),
        }
    }
}

fn collect_recursive(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().to_string());
        }
        if path.is_dir() {
            collect_recursive(root, &path, out);
        }
    }
}
