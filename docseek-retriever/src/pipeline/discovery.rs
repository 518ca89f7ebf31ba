//! File discovery under the indexed root.
//!
//! Walks with the `ignore` crate: hidden entries are skipped, `.gitignore`
//! files are honoured (without requiring a git repository), and a custom
//! per-directory ignore file (`.docseekignore` by default) uses the same
//! syntax. Include patterns, when configured, act as a whitelist.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::IndexingConfig;

/// A file eligible for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the root, `/`-separated
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// Lower-case extension without the dot
    pub extension: String,
}

/// `/`-separated form of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Lower-case extension of `path`, empty when it has none.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Walk `root` and return every indexable file, sorted by relative path.
///
/// # Arguments
/// * `root` - Directory to walk
/// * `config` - Ignore, size and include rules
/// * `extensions` - Lower-case extensions that may be indexed
///
/// # Errors
/// Fails when `root` is not a directory or an include pattern is not a
/// valid glob. Unreadable entries are logged and skipped.
pub fn discover_files(
    root: &Path,
    config: &IndexingConfig,
    extensions: &HashSet<String>,
) -> Result<Vec<DiscoveredFile>> {
    if !root.is_dir() {
        anyhow::bail!("Index root {} is not a directory", root.display());
    }

    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .parents(false)
        .git_ignore(config.respect_gitignore)
        .git_exclude(config.respect_gitignore)
        .git_global(false)
        .require_git(false);
    if !config.ignore_file_name.is_empty() {
        builder.add_custom_ignore_filename(&config.ignore_file_name);
    }
    if !config.include_patterns.is_empty() {
        let mut overrides = OverrideBuilder::new(root);
        for pattern in &config.include_patterns {
            overrides
                .add(pattern)
                .with_context(|| format!("Invalid include pattern '{pattern}'"))?;
        }
        builder.overrides(overrides.build()?);
    }

    let mut files = Vec::new();
    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let path = entry.path();
        let extension = extension_of(path);
        if !extensions.contains(&extension) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Failed to get metadata for {}: {}", path.display(), e);
                continue;
            }
        };
        if metadata.len() > config.max_file_size {
            debug!(
                "Skipping {} ({} bytes exceeds limit)",
                path.display(),
                metadata.len()
            );
            continue;
        }
        let Some(relative_path) = relative_path(root, path) else {
            continue;
        };
        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        files.push(DiscoveredFile {
            relative_path,
            absolute_path: path.to_path_buf(),
            size: metadata.len(),
            modified_at,
            extension,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    debug!("Discovered {} files under {}", files.len(), root.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn extensions(list: &[&str]) -> HashSet<String> {
        list.iter().map(|e| e.to_string()).collect()
    }

    fn paths(files: &[DiscoveredFile]) -> Vec<&str> {
        files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn test_discovery_rules() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("notes/archive"))?;
        std::fs::create_dir_all(root.join(".hidden"))?;
        std::fs::write(root.join("readme.md"), "# Readme")?;
        std::fs::write(root.join("notes/a.txt"), "alpha")?;
        std::fs::write(root.join("notes/archive/old.txt"), "old")?;
        std::fs::write(root.join("notes/big.txt"), "x".repeat(64))?;
        std::fs::write(root.join("notes/binary.exe"), "MZ")?;
        std::fs::write(root.join(".hidden/secret.txt"), "secret")?;
        std::fs::write(root.join(".gitignore"), "*.log\n")?;
        std::fs::write(root.join("debug.log"), "log")?;
        std::fs::write(root.join("notes/.docseekignore"), "archive/\n")?;

        let config = IndexingConfig {
            max_file_size: 32,
            ..Default::default()
        };
        let files = discover_files(root, &config, &extensions(&["md", "txt", "log"]))?;

        assert_eq!(paths(&files), vec!["notes/a.txt", "readme.md"]);
        assert_eq!(files[0].extension, "txt");
        assert_eq!(files[0].size, 5);
        assert_eq!(files[0].absolute_path, root.join("notes/a.txt"));
        Ok(())
    }

    #[test]
    fn test_include_patterns_whitelist() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        std::fs::create_dir_all(root.join("docs"))?;
        std::fs::write(root.join("docs/guide.md"), "guide")?;
        std::fs::write(root.join("docs/todo.txt"), "todo")?;
        std::fs::write(root.join("top.md"), "top")?;

        let config = IndexingConfig {
            include_patterns: vec!["*.md".to_string()],
            ..Default::default()
        };
        let files = discover_files(root, &config, &extensions(&["md", "txt"]))?;
        assert_eq!(paths(&files), vec!["docs/guide.md", "top.md"]);
        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let config = IndexingConfig::default();
        assert!(discover_files(Path::new("/definitely/not/here"), &config, &HashSet::new()).is_err());
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/data");
        assert_eq!(
            relative_path(root, &root.join("a").join("b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(relative_path(root, root), None);
    }
}
