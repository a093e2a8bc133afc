//! Exclude pattern matching for sync operations.
//!
//! Patterns are globs evaluated against folder-relative paths using `/` as
//! the separator. A path is excluded when a pattern matches the whole path,
//! its file name, or any of its directory components, so `node_modules`
//! excludes that directory at any depth and `*.tmp` excludes `sub/b.tmp`.

use std::path::{Component, Path};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::warn;

/// Compiled exclude patterns for one folder.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    glob_set: GlobSet,
    patterns: Vec<String>,
}

impl Default for PathMatcher {
    fn default() -> Self {
        Self::empty()
    }
}

impl PathMatcher {
    /// A matcher that excludes nothing.
    pub fn empty() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    /// Compile `patterns`, skipping any that are not valid globs.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut accepted = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            // Trailing slash marks a directory in gitignore habits; match the name.
            let normalized = pattern.trim_end_matches('/');
            match GlobBuilder::new(normalized).literal_separator(true).build() {
                Ok(glob) => {
                    builder.add(glob);
                    accepted.push(pattern.to_string());
                }
                Err(e) => warn!(pattern, error = %e, "Ignoring invalid exclude pattern"),
            }
        }

        let glob_set = match builder.build() {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "Failed to build exclude set, excluding nothing");
                return Self::empty();
            }
        };

        Self {
            glob_set,
            patterns: accepted,
        }
    }

    /// Check if a folder-relative path should be excluded.
    pub fn is_excluded(&self, relative: &str) -> bool {
        if self.glob_set.is_empty() {
            return false;
        }

        let relative = relative.replace('\\', "/");
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            return false;
        }

        if self.glob_set.is_match(relative) {
            return true;
        }

        // Every component, file name included, is matched on its own.
        Path::new(relative).components().any(|component| match component {
            Component::Normal(name) => self.glob_set.is_match(name.to_string_lossy().as_ref()),
            _ => false,
        })
    }

    /// Same as [`is_excluded`](Self::is_excluded) for a path under `root`.
    ///
    /// Paths outside `root` are never excluded.
    pub fn is_excluded_under(&self, root: &Path, path: &Path) -> bool {
        match path.strip_prefix(root) {
            Ok(rel) => self.is_excluded(&relative_key(rel)),
            Err(_) => false,
        }
    }

    /// Patterns that compiled successfully.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Render a relative path with forward slashes.
pub fn relative_key(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk `start`, a directory inside `root`, never descending into excluded
/// directories. With `dirs_only`, files are dropped from the walk as well.
pub fn walk_pruned(
    root: &Path,
    start: &Path,
    matcher: &PathMatcher,
    dirs_only: bool,
) -> jwalk::WalkDir {
    let root = root.to_path_buf();
    let matcher = matcher.clone();

    jwalk::WalkDir::new(start)
        .skip_hidden(false)
        .follow_links(false)
        .parallelism(jwalk::Parallelism::Serial)
        .process_read_dir(move |_depth, _dir, _state, children| {
            children.retain(|entry| match entry {
                Ok(e) => {
                    (!dirs_only || e.file_type().is_dir())
                        && !matcher.is_excluded_under(&root, &e.path())
                }
                // Keep errors so the caller can log them.
                Err(_) => true,
            });
        })
}

/// One-shot form of [`PathMatcher::is_excluded`].
pub fn matches<S: AsRef<str>>(relative: &str, patterns: &[S]) -> bool {
    PathMatcher::new(patterns).is_excluded(relative)
}
