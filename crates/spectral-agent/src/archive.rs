use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Export sink for code generations:
/// `<root>/<date>/<request-id>/attempt_<k>/` per attempt, `FINAL/` for the
/// successful copy, and a `MANIFEST.json` at the archive root recording
/// every attempt, successful or not.
pub struct CodeArchive {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub request_id: String,
    pub attempt: u32,
    pub success: bool,
    pub path: String,
    pub recorded_at: String,
}

impl CodeArchive {
    pub fn new() -> Self {
        Self {
            root: spectral_core::archive_root(),
        }
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    fn request_dir(&self, request_id: &str) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d").to_string();
        self.root.join(date).join(request_id)
    }

    /// Persist one attempt: the generated program, its metadata, and the
    /// streamed-chunk log.
    pub fn record_attempt(
        &self,
        request_id: &str,
        attempt: u32,
        code: &str,
        metadata: &serde_json::Value,
        chunk_log: &str,
        success: bool,
    ) -> Result<PathBuf> {
        let dir = self.request_dir(request_id).join(format!("attempt_{attempt}"));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("generated.py"), code)?;
        fs::write(dir.join("metadata.json"), serde_json::to_vec_pretty(metadata)?)?;
        fs::write(dir.join("chunks.log"), chunk_log)?;
        self.append_manifest(ManifestEntry {
            request_id: request_id.to_string(),
            attempt,
            success,
            path: dir.to_string_lossy().to_string(),
            recorded_at: Utc::now().to_rfc3339(),
        })?;
        Ok(dir)
    }

    /// Final successful copy under `FINAL/`. Returns the exported path.
    pub fn record_final(&self, request_id: &str, code: &str) -> Result<PathBuf> {
        let dir = self.request_dir(request_id).join("FINAL");
        fs::create_dir_all(&dir)?;
        let path = dir.join("generated.py");
        fs::write(&path, code)?;
        Ok(path)
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join("MANIFEST.json")
    }

    fn append_manifest(&self, entry: ManifestEntry) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let mut entries: Vec<ManifestEntry> = if self.manifest_path().exists() {
            serde_json::from_str(&fs::read_to_string(self.manifest_path())?)
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        entries.push(entry);
        fs::write(self.manifest_path(), serde_json::to_vec_pretty(&entries)?)?;
        Ok(())
    }

    pub fn manifest(&self) -> Result<Vec<ManifestEntry>> {
        if !self.manifest_path().exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&fs::read_to_string(
            self.manifest_path(),
        )?)?)
    }
}

impl Default for CodeArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn attempts_and_final_are_laid_out_with_manifest() {
        let root = TempDir::new().expect("tempdir");
        let archive = CodeArchive::with_root(root.path().to_path_buf());

        let attempt_dir = archive
            .record_attempt(
                "req-1",
                1,
                "print('broken'",
                &serde_json::json!({"status": "syntax_error"}),
                "chunk1\nchunk2\n",
                false,
            )
            .expect("attempt 1");
        assert!(attempt_dir.join("generated.py").exists());
        assert!(attempt_dir.join("metadata.json").exists());
        assert!(attempt_dir.join("chunks.log").exists());

        archive
            .record_attempt(
                "req-1",
                2,
                "print('ok')",
                &serde_json::json!({"status": "success"}),
                "",
                true,
            )
            .expect("attempt 2");
        let final_path = archive.record_final("req-1", "print('ok')").expect("final");
        assert!(final_path.exists());
        assert!(final_path.to_string_lossy().contains("FINAL"));

        let manifest = archive.manifest().expect("manifest");
        assert_eq!(manifest.len(), 2);
        assert!(!manifest[0].success);
        assert!(manifest[1].success);
    }
}
