//! Per-submission staging directories under the exchange root.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::errors::RunnerError;
use crate::types::StagedConfig;

pub const CONFIG_FILE: &str = "config.json";

#[cfg(unix)]
const DIR_MODE: u32 = 0o755;
#[cfg(unix)]
const FILE_MODE: u32 = 0o644;

/// Replaces every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_id(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if safe.is_empty() {
        "anonymous".to_string()
    } else {
        safe
    }
}

/// A staged submission: one directory holding the code and its config.
#[derive(Debug)]
pub struct StagedSubmission {
    dir: PathBuf,
    dir_name: String,
    code_file: String,
}

impl StagedSubmission {
    /// Writes `code` and `config` into a fresh directory under `root`.
    ///
    /// The directory is `submission_<safe_id>`; if a submission with the same
    /// identifier is still staged, a random suffix keeps the two apart.
    pub async fn create(
        root: &Path,
        safe_id: &str,
        code_file: &str,
        code: &str,
        config: &StagedConfig,
    ) -> Result<Self, RunnerError> {
        fs::create_dir_all(root).await.map_err(|e| {
            RunnerError::Staging(format!("cannot create exchange dir {}: {}", root.display(), e))
        })?;

        let mut dir_name = format!("submission_{}", safe_id);
        let mut dir = root.join(&dir_name);
        if let Err(e) = fs::create_dir(&dir).await {
            if e.kind() != io::ErrorKind::AlreadyExists {
                return Err(RunnerError::Staging(format!("cannot create {}: {}", dir.display(), e)));
            }
            dir_name = format!("submission_{}_{}", safe_id, Uuid::new_v4().simple());
            dir = root.join(&dir_name);
            log::debug!("Staging dir for {} already exists, using {}", safe_id, dir_name);
            fs::create_dir(&dir).await.map_err(|e| {
                RunnerError::Staging(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        let staged = Self {
            dir,
            dir_name,
            code_file: code_file.to_string(),
        };
        if let Err(e) = staged.populate(code, config).await {
            staged.cleanup().await;
            return Err(e);
        }
        log::debug!("Staged submission in {}", staged.dir.display());
        Ok(staged)
    }

    async fn populate(&self, code: &str, config: &StagedConfig) -> Result<(), RunnerError> {
        let config_json = serde_json::to_vec(config)?;
        fs::write(self.code_path(), code).await?;
        fs::write(self.config_path(), config_json).await?;

        set_mode(&self.dir, DirOrFile::Dir).await?;
        set_mode(&self.code_path(), DirOrFile::File).await?;
        set_mode(&self.config_path(), DirOrFile::File).await?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn code_path(&self) -> PathBuf {
        self.dir.join(&self.code_file)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    /// Paths of the code and config files as seen from inside the container.
    pub fn container_paths(&self, container_root: &str) -> (String, String) {
        let base = format!("{}/{}", container_root.trim_end_matches('/'), self.dir_name);
        (
            format!("{}/{}", base, self.code_file),
            format!("{}/{}", base, CONFIG_FILE),
        )
    }

    /// Removes the directory tree. Failures are logged, never returned.
    pub async fn cleanup(&self) {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => log::debug!("Removed staging dir {}", self.dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove staging dir {}: {}", self.dir.display(), e),
        }
    }
}

enum DirOrFile {
    Dir,
    File,
}

#[cfg(unix)]
async fn set_mode(path: &Path, kind: DirOrFile) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match kind {
        DirOrFile::Dir => DIR_MODE,
        DirOrFile::File => FILE_MODE,
    };
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _kind: DirOrFile) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ForbiddenRule;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("abc-123_X"), "abc-123_X");
        assert_eq!(sanitize_id("../../etc/passwd"), "______etc_passwd");
        assert_eq!(sanitize_id("a b;c"), "a_b_c");
        assert_eq!(sanitize_id(""), "anonymous");
    }

    #[tokio::test]
    async fn test_stage_writes_code_and_config() {
        let root = TempDir::new().unwrap();
        let config = StagedConfig {
            blacklist: vec![ForbiddenRule {
                path: "time.sleep".to_string(),
                reason: "no".to_string(),
            }],
            engine: None,
        };

        let staged = StagedSubmission::create(root.path(), "s1", "student_solution.rhai", "print(1);", &config)
            .await
            .unwrap();

        assert_eq!(staged.dir(), root.path().join("submission_s1"));
        assert_eq!(std::fs::read_to_string(staged.code_path()).unwrap(), "print(1);");
        let written: StagedConfig =
            serde_json::from_slice(&std::fs::read(staged.config_path()).unwrap()).unwrap();
        assert_eq!(written, config);

        let (code, cfg) = staged.container_paths("/exchange/");
        assert_eq!(code, "/exchange/submission_s1/student_solution.rhai");
        assert_eq!(cfg, "/exchange/submission_s1/config.json");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(staged.code_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
            let mode = std::fs::metadata(staged.dir()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        staged.cleanup().await;
        assert!(!staged.dir().exists());
        staged.cleanup().await;
    }

    #[tokio::test]
    async fn test_duplicate_ids_get_separate_dirs() {
        let root = TempDir::new().unwrap();
        let config = StagedConfig::default();

        let first = StagedSubmission::create(root.path(), "dup", "a.rhai", "1", &config).await.unwrap();
        let second = StagedSubmission::create(root.path(), "dup", "a.rhai", "2", &config).await.unwrap();

        assert_ne!(first.dir(), second.dir());
        assert_eq!(std::fs::read_to_string(first.code_path()).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(second.code_path()).unwrap(), "2");
    }
}
