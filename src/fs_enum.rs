use anyhow::{Context, Result};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::path::Path;
// Filesystem enumeration for snapshot scans

/// One regular file found under the sync root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Path relative to the root, `/`-separated
    pub name: String,
    /// Modification time, unix seconds
    pub mtime: i64,
}

/// Substring include/exclude lists applied to relative paths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFilter {
    /// Empty means match everything
    #[serde(default, rename = "match")]
    pub match_patterns: Vec<String>,
    /// Empty means ignore nothing
    #[serde(default, rename = "ignore")]
    pub ignore_patterns: Vec<String>,
}

impl FileFilter {
    pub fn new(match_patterns: Vec<String>, ignore_patterns: Vec<String>) -> Self {
        Self {
            match_patterns,
            ignore_patterns,
        }
    }

    /// Check if a relative path should be included. Ignore wins over match.
    pub fn should_include(&self, rel: &str) -> bool {
        if self.ignore_patterns.iter().any(|p| rel.contains(p.as_str())) {
            return false;
        }
        self.match_patterns.is_empty() || self.match_patterns.iter().any(|p| rel.contains(p.as_str()))
    }
}

/// Modification time of `path` in unix seconds
pub fn file_mtime(path: &Path) -> std::io::Result<i64> {
    let md = std::fs::metadata(path)?;
    Ok(FileTime::from_last_modification_time(&md).unix_seconds())
}

/// Turn a walked path into the `/`-separated name relative to `root`.
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut name = String::new();
    for component in rel.components() {
        let part = component.as_os_str().to_str()?;
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(part);
    }
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Enumerate regular files under `root` that pass `filter`. Symlinks are not
/// followed; unreadable entries and non-UTF-8 names are skipped.
pub fn enumerate_files(root: &Path, filter: &FileFilter) -> Result<Vec<ScannedFile>> {
    use walkdir::WalkDir;

    if !root.is_dir() {
        anyhow::bail!("not a directory: {}", root.display());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(name) = relative_name(root, entry.path()) else {
            tracing::warn!("skipping non-UTF-8 path {}", entry.path().display());
            continue;
        };
        if !filter.should_include(&name) {
            continue;
        }

        let md = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()));
        match md {
            Ok(md) => entries.push(ScannedFile {
                name,
                mtime: FileTime::from_last_modification_time(&md).unix_seconds(),
            }),
            // Vanished between readdir and stat; the next scan settles it
            Err(e) => tracing::debug!("{:#}", e),
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn patterns(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filter_empty_matches_all() {
        let f = FileFilter::default();
        assert!(f.should_include("a.txt"));
        assert!(f.should_include("deep/dir/b.bin"));
    }

    #[test]
    fn test_filter_match_and_ignore() {
        let f = FileFilter::new(patterns(&[".c", ".h"]), patterns(&["build/"]));
        assert!(f.should_include("src/main.c"));
        assert!(f.should_include("include/pub.h"));
        assert!(!f.should_include("README.md"));
        // ignore takes precedence
        assert!(!f.should_include("build/main.c"));
    }

    #[test]
    fn test_filter_ignore_only() {
        let f = FileFilter::new(vec![], patterns(&[".git", "~"]));
        assert!(f.should_include("src/lib.rs"));
        assert!(!f.should_include(".git/HEAD"));
        assert!(!f.should_include("notes.txt~"));
    }

    #[test]
    fn test_enumerate_files_relative_names() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("dir1/dir2")).unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        fs::write(tmp.path().join("dir1/b.bin"), "b").unwrap();
        fs::write(tmp.path().join("dir1/dir2/c.dat"), "c").unwrap();

        let mut names: Vec<String> = enumerate_files(tmp.path(), &FileFilter::default())
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "dir1/b.bin", "dir1/dir2/c.dat"]);
    }

    #[test]
    fn test_enumerate_files_filtered_with_mtime() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("keep.txt"), "k").unwrap();
        fs::write(tmp.path().join("skip.log"), "s").unwrap();
        filetime::set_file_mtime(tmp.path().join("keep.txt"), FileTime::from_unix_time(100, 0)).unwrap();

        let filter = FileFilter::new(vec![], patterns(&[".log"]));
        let files = enumerate_files(tmp.path(), &filter).unwrap();
        assert_eq!(
            files,
            vec![ScannedFile {
                name: "keep.txt".into(),
                mtime: 100
            }]
        );
    }

    #[test]
    fn test_enumerate_missing_root() {
        let tmp = TempDir::new().unwrap();
        assert!(enumerate_files(&tmp.path().join("nope"), &FileFilter::default()).is_err());
    }
}
