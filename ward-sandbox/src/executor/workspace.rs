//! Per-execution scratch directory for the process strategies

use super::runner::RUNNER_SCRIPT;
use crate::config::SandboxConfiguration;
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub(super) const PROGRAM_FILE: &str = "program.py";
pub(super) const RUNNER_FILE: &str = "runner.py";
pub(super) const POLICY_FILE: &str = "policy.json";
pub(super) const RESULT_FILE: &str = "result.json";

/// Holds the program, the runner and the result file; removed on drop
#[derive(Debug)]
pub(super) struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub(super) fn create(source: &str, config: &SandboxConfiguration) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("ward-").tempdir()?;
        std::fs::write(dir.path().join(PROGRAM_FILE), source)?;
        std::fs::write(dir.path().join(RUNNER_FILE), RUNNER_SCRIPT)?;

        let policy = json!({
            "forbidden": config.forbidden_imports,
            "allowed": config.allowed_imports,
        });
        std::fs::write(dir.path().join(POLICY_FILE), policy.to_string())?;

        // the program may run as an unmapped or unprivileged uid that cannot
        // create files, so the result file exists up front
        let result = dir.path().join(RESULT_FILE);
        std::fs::write(&result, "")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&result, std::fs::Permissions::from_mode(0o666))?;
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755))?;
        }

        Ok(Self { dir })
    }

    pub(super) fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(super) fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// The JSON value written by the runner, if the program produced one
    pub(super) fn read_return_value(&self) -> Option<serde_json::Value> {
        let raw = std::fs::read_to_string(self.file(RESULT_FILE)).ok()?;
        let mut parsed: serde_json::Value = serde_json::from_str(&raw).ok()?;
        match parsed.get_mut("value").map(serde_json::Value::take) {
            Some(serde_json::Value::Null) | None => None,
            Some(value) => Some(value),
        }
    }
}
