//! Which files an identity may bundle into an archive.

use std::path::{Component, Path, PathBuf};

use quarry_protocol::Identity;

use crate::config::{DirectoryConfig, QueryConfig};

pub trait FileAccess: Send + Sync {
    /// Resolved path of `file_path` when it exists and `identity` may read it.
    fn check_file(&self, identity: Option<&Identity>, file_path: &str) -> Option<PathBuf>;
}

/// Files below configured directories, gated by each directory's access level.
#[derive(Debug, Clone, Default)]
pub struct DirectoryFileAccess {
    directories: Vec<DirectoryConfig>,
}

impl DirectoryFileAccess {
    pub fn new(directories: Vec<DirectoryConfig>) -> Self {
        Self { directories }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(config.directories.clone())
    }
}

fn has_traversal(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

impl FileAccess for DirectoryFileAccess {
    fn check_file(&self, identity: Option<&Identity>, file_path: &str) -> Option<PathBuf> {
        let requested = Path::new(file_path);
        if file_path.is_empty() || has_traversal(requested) {
            return None;
        }

        self.directories
            .iter()
            .filter(|d| d.access_level.permits(identity, &d.groups))
            .find_map(|directory| {
                let candidate = if requested.is_absolute() {
                    requested
                        .starts_with(&directory.path)
                        .then(|| requested.to_path_buf())?
                } else {
                    directory.path.join(requested)
                };
                candidate.is_file().then_some(candidate)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_protocol::AccessLevel;

    fn setup() -> (tempfile::TempDir, DirectoryFileAccess) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("public")).unwrap();
        std::fs::create_dir_all(dir.path().join("private")).unwrap();
        std::fs::write(dir.path().join("public/a.fits"), b"a").unwrap();
        std::fs::write(dir.path().join("private/b.fits"), b"b").unwrap();

        let access = DirectoryFileAccess::new(vec![
            DirectoryConfig {
                path: dir.path().join("public"),
                access_level: AccessLevel::Public,
                groups: vec![],
            },
            DirectoryConfig {
                path: dir.path().join("private"),
                access_level: AccessLevel::Private,
                groups: vec!["astro".to_string()],
            },
        ]);
        (dir, access)
    }

    #[test]
    fn test_relative_and_absolute_paths() {
        let (dir, access) = setup();
        assert!(access.check_file(None, "a.fits").is_some());
        let absolute = dir.path().join("public/a.fits");
        assert!(access
            .check_file(None, absolute.to_str().unwrap())
            .is_some());
        assert!(access.check_file(None, "missing.fits").is_none());
    }

    #[test]
    fn test_private_directory_requires_group() {
        let (_dir, access) = setup();
        let member = Identity::new("alice").with_groups(["astro"]);
        assert!(access.check_file(None, "b.fits").is_none());
        assert!(access.check_file(Some(&member), "b.fits").is_some());
    }

    #[test]
    fn test_traversal_is_rejected() {
        let (_dir, access) = setup();
        assert!(access.check_file(None, "../private/b.fits").is_none());
    }
}
