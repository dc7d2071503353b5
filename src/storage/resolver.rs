//! Backup directory resolution.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Yields the directory snapshots are served from.
pub trait BackupDirResolver: Send + Sync + Debug {
    fn backup_dir(&self) -> PathBuf;
}

/// A fixed directory, made absolute at construction.
#[derive(Debug, Clone)]
pub struct StaticDir(PathBuf);

impl StaticDir {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(absolutize(path.as_ref()))
    }
}

impl BackupDirResolver for StaticDir {
    fn backup_dir(&self) -> PathBuf {
        self.0.clone()
    }
}

/// Reads the directory from an environment variable on every call,
/// falling back to a configured path.
#[derive(Debug, Clone)]
pub struct EnvDir {
    var: String,
    fallback: PathBuf,
}

impl EnvDir {
    pub fn new(var: impl Into<String>, fallback: impl Into<PathBuf>) -> Self {
        Self {
            var: var.into(),
            fallback: fallback.into(),
        }
    }
}

impl BackupDirResolver for EnvDir {
    fn backup_dir(&self) -> PathBuf {
        let dir = std::env::var_os(&self.var)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.fallback.clone());
        absolutize(&dir)
    }
}

fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_dir_is_absolute() {
        let resolver = StaticDir::new("backups");
        assert!(resolver.backup_dir().is_absolute());
        assert!(resolver.backup_dir().ends_with("backups"));
    }

    #[test]
    fn env_dir_falls_back_when_unset() {
        let resolver = EnvDir::new("SNAPSHOT_SERVER_TEST_UNSET_DIR", "/srv/snapshots");
        assert_eq!(resolver.backup_dir(), PathBuf::from("/srv/snapshots"));
    }
}
