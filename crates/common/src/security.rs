//! Working-directory validation for newly opened terminals.
//!
//! The caller controls the `cwd` argument of `open_terminal`, so it is checked
//! before a shell is started there: no `..` components, no dangling symlinks,
//! and (when configured) it must sit under one of the allowed base directories.

use crate::{Result, TtymuxError};
use std::path::{Path, PathBuf};

/// Rules applied to caller-supplied working directories.
#[derive(Debug, Clone)]
pub struct PathSecurityConfig {
    /// Allowed base directories. Empty = allow all.
    pub allowed_base_dirs: Vec<PathBuf>,

    /// Used when the caller gives no working directory.
    pub default_working_dir: PathBuf,
}

impl Default for PathSecurityConfig {
    fn default() -> Self {
        Self {
            allowed_base_dirs: Vec::new(),
            default_working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// Validate and resolve a working directory.
///
/// `None` or a blank string resolves to `config.default_working_dir`. Existing
/// paths are canonicalized; the directory must exist since a shell is about to
/// be started in it.
pub fn validate_working_dir(working_dir: Option<&str>, config: &PathSecurityConfig) -> Result<PathBuf> {
    let dir = match working_dir.map(str::trim) {
        Some(d) if !d.is_empty() => d,
        _ => return Ok(config.default_working_dir.clone()),
    };

    let path = PathBuf::from(dir);
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(TtymuxError::Config(format!(
            "Working directory '{dir}' contains '..' path components which are not allowed"
        )));
    }

    let is_symlink = path
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_symlink && !path.exists() {
        return Err(TtymuxError::Config(format!(
            "Working directory '{dir}' is a dangling symbolic link"
        )));
    }

    if !path.is_dir() {
        return Err(TtymuxError::Config(format!(
            "Working directory '{dir}' does not exist or is not a directory"
        )));
    }

    let canonical = path.canonicalize().map_err(|e| {
        TtymuxError::Config(format!("Failed to resolve working directory '{dir}': {e}"))
    })?;

    if !config.allowed_base_dirs.is_empty()
        && !config
            .allowed_base_dirs
            .iter()
            .any(|base| canonical.starts_with(canonical_or_self(base)))
    {
        let allowed: Vec<String> = config
            .allowed_base_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        return Err(TtymuxError::Config(format!(
            "Working directory '{dir}' is not under any allowed base directory. Allowed: {allowed:?}"
        )));
    }

    Ok(canonical)
}

fn canonical_or_self(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_with_default(dir: &Path) -> PathSecurityConfig {
        PathSecurityConfig {
            allowed_base_dirs: Vec::new(),
            default_working_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_missing_dir_uses_default() {
        let config = config_with_default(Path::new("/srv/work"));
        assert_eq!(
            validate_working_dir(None, &config).unwrap(),
            PathBuf::from("/srv/work")
        );
        assert_eq!(
            validate_working_dir(Some("   "), &config).unwrap(),
            PathBuf::from("/srv/work")
        );
    }

    #[test]
    fn test_rejects_parent_components() {
        let config = PathSecurityConfig::default();
        assert!(validate_working_dir(Some("/home/../etc"), &config).is_err());
        assert!(validate_working_dir(Some("../../tmp"), &config).is_err());
    }

    #[test]
    fn test_rejects_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("does-not-exist");
        let config = PathSecurityConfig::default();
        let err = validate_working_dir(Some(missing.to_str().unwrap()), &config).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_accepts_existing_directory() {
        let tmp = TempDir::new().unwrap();
        let config = PathSecurityConfig::default();
        let resolved = validate_working_dir(Some(tmp.path().to_str().unwrap()), &config).unwrap();
        assert_eq!(resolved, tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn test_enforces_allowed_base() {
        let allowed = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let inner = allowed.path().join("project");
        std::fs::create_dir(&inner).unwrap();

        let config = PathSecurityConfig {
            allowed_base_dirs: vec![allowed.path().to_path_buf()],
            default_working_dir: allowed.path().to_path_buf(),
        };

        assert!(validate_working_dir(Some(inner.to_str().unwrap()), &config).is_ok());
        let err = validate_working_dir(Some(other.path().to_str().unwrap()), &config).unwrap_err();
        assert!(err.to_string().contains("not under any allowed base directory"));
    }
}
