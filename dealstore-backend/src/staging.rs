//! Local staging trees.
//!
//! A staged tree is a temporary directory laid out exactly like the part of
//! the repository it will be grafted onto. It is uploaded as one unit and
//! removed when dropped, whatever happened in between.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use dealstore_common::Layout;

const STAGING_PREFIX: &str = "dealstore-stage-";

pub struct StagedTree {
    dir: TempDir,
}

impl StagedTree {
    /// Create an empty tree under `parent`, or the system temp dir.
    pub fn create(parent: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(STAGING_PREFIX);
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        debug!(path = %dir.path().display(), "Created staging tree");
        Ok(Self { dir })
    }

    /// Create a tree holding every directory `layout` requires, and nothing else.
    pub fn with_layout(parent: Option<&Path>, layout: &dyn Layout) -> io::Result<Self> {
        let tree = Self::create(parent)?;
        for dir in layout.paths() {
            std::fs::create_dir_all(tree.dir.path().join(&dir))?;
        }
        Ok(tree)
    }

    /// Write `data` at `relative`, creating parent directories as needed.
    pub fn add_file(&self, relative: &str, data: &[u8]) -> io::Result<()> {
        let dest = self.resolve(relative)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, data)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn resolve(&self, relative: &str) -> io::Result<PathBuf> {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() || relative.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid staging path: {:?}", relative),
            ));
        }
        Ok(self.dir.path().join(relative))
    }
}

/// One file or directory inside a staged tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Slash-separated path relative to the tree root.
    pub relative: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Walk `root` and return its entries, parents before children, in name order.
/// The root itself is not included.
pub fn tree_entries(root: &Path) -> io::Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entries.push(TreeEntry {
            relative,
            path: entry.path().to_path_buf(),
            is_dir: entry.file_type().is_dir(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use dealstore_common::layout::{DefaultLayout, S3LegacyLayout};

    use super::*;

    #[test]
    fn test_with_layout_builds_skeleton() {
        let parent = tempfile::tempdir().unwrap();
        let tree = StagedTree::with_layout(Some(parent.path()), &DefaultLayout).unwrap();
        for dir in ["data", "index", "keys", "locks", "snapshots", "data/00", "data/ff"] {
            assert!(tree.path().join(dir).is_dir(), "missing {}", dir);
        }
        assert!(!tree.path().join("config").exists());
    }

    #[test]
    fn test_tree_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let path = {
            let tree = StagedTree::with_layout(Some(parent.path()), &S3LegacyLayout).unwrap();
            tree.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_add_file_and_walk() {
        let tree = StagedTree::create(None).unwrap();
        tree.add_file("keys/abc", b"key").unwrap();
        tree.add_file("data/ab/abcd", b"blob").unwrap();

        let entries = tree_entries(tree.path()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.relative.as_str()).collect();
        assert_eq!(names, vec!["data", "data/ab", "data/ab/abcd", "keys", "keys/abc"]);
        assert!(entries[0].is_dir);
        assert!(!entries[2].is_dir);
    }

    #[test]
    fn test_add_file_rejects_escapes() {
        let tree = StagedTree::create(None).unwrap();
        assert!(tree.add_file("../outside", b"x").is_err());
        assert!(tree.add_file("keys/../../x", b"x").is_err());
        assert!(tree.add_file("", b"x").is_err());
    }
}
