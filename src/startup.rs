use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DirectoryError {
    #[error("the path must be absolute")]
    NotAbsolute,

    #[error("the path must not end with '/'")]
    TrailingSlash,

    #[error("{0} already exists")]
    AlreadyExists(PathBuf),
}

/// Suggests `<home>/<model>`, or `<home>/<model>_<n>` when earlier sessions
/// for the same camera are already there.
pub fn default_session_dir(home: &Path, model: &str) -> PathBuf {
    let mut matching = 0u32;
    let mut highest: Option<u32> = None;

    if let Ok(entries) = std::fs::read_dir(home) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.contains(model) {
                continue;
            }
            matching += 1;

            // e.g. "imx708_wide" has no number after the last '_'
            if let Some((_, suffix)) = name.rsplit_once('_') {
                if let Ok(n) = suffix.parse::<u32>() {
                    highest = Some(highest.map_or(n, |h| h.max(n)));
                }
            }
        }
    }

    let mut n = match (matching, highest) {
        (0, _) => return home.join(model),
        (_, Some(h)) => h + 1,
        (count, None) => count,
    };

    // another entry could still be in the way
    loop {
        let candidate = home.join(format!("{}_{}", model, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Checks a typed directory. An empty entry selects `default`.
pub fn resolve_session_dir(text: &str, default: &Path) -> Result<PathBuf, DirectoryError> {
    let text = text.trim();
    let path = if text.is_empty() {
        default.to_path_buf()
    } else {
        if !text.starts_with('/') {
            return Err(DirectoryError::NotAbsolute);
        }
        if text.ends_with('/') {
            return Err(DirectoryError::TrailingSlash);
        }
        PathBuf::from(text)
    };

    if path.exists() {
        return Err(DirectoryError::AlreadyExists(path));
    }
    Ok(path)
}

pub fn create_session_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create session directory {}", path.display()))?;
    log::info!("Session directory: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_dir_first_session() {
        let home = TempDir::new().unwrap();
        assert_eq!(default_session_dir(home.path(), "imx219"), home.path().join("imx219"));
    }

    #[test]
    fn test_default_dir_counts_unnumbered_sessions() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir(home.path().join("imx219")).unwrap();
        assert_eq!(default_session_dir(home.path(), "imx219"), home.path().join("imx219_1"));
    }

    #[test]
    fn test_default_dir_continues_numbering() {
        let home = TempDir::new().unwrap();
        for name in ["imx219", "imx219_1", "imx219_4", "imx477_9"] {
            std::fs::create_dir(home.path().join(name)).unwrap();
        }
        assert_eq!(default_session_dir(home.path(), "imx219"), home.path().join("imx219_5"));
    }

    #[test]
    fn test_default_dir_skips_taken_names() {
        let home = TempDir::new().unwrap();
        for name in ["imx708_wide", "imx708_wide_noir", "imx708_2"] {
            std::fs::create_dir(home.path().join(name)).unwrap();
        }
        // 2 unnumbered matches plus imx708_2 -> next after the highest number
        assert_eq!(default_session_dir(home.path(), "imx708"), home.path().join("imx708_3"));

        std::fs::create_dir(home.path().join("imx708_wide_1")).unwrap();
        assert_eq!(default_session_dir(home.path(), "imx708"), home.path().join("imx708_3"));
    }

    #[test]
    fn test_resolve_rules() {
        let home = TempDir::new().unwrap();
        let default = home.path().join("imx219");

        assert_eq!(resolve_session_dir("", &default), Ok(default.clone()));
        assert_eq!(resolve_session_dir("relative/dir", &default), Err(DirectoryError::NotAbsolute));
        assert_eq!(resolve_session_dir("/tmp/session/", &default), Err(DirectoryError::TrailingSlash));

        let existing = home.path().to_string_lossy().into_owned();
        assert!(matches!(
            resolve_session_dir(&existing, &default),
            Err(DirectoryError::AlreadyExists(_))
        ));

        let fresh = home.path().join("fresh");
        assert_eq!(resolve_session_dir(&fresh.to_string_lossy(), &default), Ok(fresh.clone()));
        create_session_dir(&fresh).unwrap();
        assert!(fresh.is_dir());
    }
}
