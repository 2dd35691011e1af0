//! Per-request staging directory
//!
//! Holds the submitted source under the language's fixed file name and the
//! stdin text under `input.txt`. Never outlives the request.

use std::io;
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::languages::LanguageConfig;

/// File the run step reads stdin from
pub const STDIN_FILE: &str = "input.txt";

const DIR_PREFIX: &str = "sandbox-";

/// Uniquely named staging directory owned by one request
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create the directory and materialize the source and stdin files
    pub fn create(
        root: &Path,
        language: &LanguageConfig,
        source: &str,
        stdin: Option<&str>,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix(DIR_PREFIX).tempdir_in(root)?;

        // From here on `dir` removes itself if a write fails
        std::fs::write(dir.path().join(&language.source_file), source)?;
        std::fs::write(dir.path().join(STDIN_FILE), stdin.unwrap_or_default())?;

        debug!(path = %dir.path().display(), "workspace created");

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory tree. Failures are logged, not returned.
    pub fn destroy(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "workspace removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove workspace"),
        }
    }
}

/// Count leftover workspaces under `root` (used by leak checks)
#[cfg(test)]
pub fn count_workspaces(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with(DIR_PREFIX))
                .count()
        })
        .unwrap_or(0)
}
