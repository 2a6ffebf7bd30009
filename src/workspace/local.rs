//! Workspace backed by a local directory
//!
//! Masks use Ant-style globs relative to the workspace root:
//! - `*` and `?` never cross a `/`
//! - `**` matches any number of directories, including none
//! - several masks can be given as a comma separated list
//! - a trailing `/` selects everything below a directory

use anyhow::{Context, bail};
use async_trait::async_trait;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::core::traits::WorkspaceResolver;

const GLOB_META: &[char] = &['*', '?', '[', '{'];

/// Build workspace rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Explain why a single mask matches nothing
    fn explain(&self, mask: &str) -> String {
        if let Err(e) = compile_mask(mask) {
            return format!("'{}' is not a valid file mask: {}", mask, e);
        }

        if !self.root.is_dir() {
            return format!("Workspace {} does not exist", self.root.display());
        }

        // Walk the literal leading directories of the mask.
        let mut checked = self.root.clone();
        let mut literal = Vec::new();
        let segments: Vec<&str> = mask.split('/').filter(|s| !s.is_empty()).collect();

        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            if segment.contains(GLOB_META) {
                break;
            }
            checked.push(segment);
            literal.push(*segment);
            if !checked.is_dir() {
                return format!("'{}' does not exist in the workspace", literal.join("/"));
            }
        }

        if literal.is_empty() {
            format!("No files in the workspace match '{}'", mask)
        } else {
            format!(
                "'{}' exists but no files in it match '{}'",
                literal.join("/"),
                mask
            )
        }
    }
}

/// Split a comma separated mask list into normalized masks
fn split_masks(pattern: &str) -> Vec<String> {
    pattern
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| {
            let mut mask = m.replace('\\', "/");
            while let Some(stripped) = mask.strip_prefix("./") {
                mask = stripped.to_string();
            }
            if mask.ends_with('/') {
                mask.push_str("**");
            }
            mask
        })
        .collect()
}

fn compile_mask(mask: &str) -> Result<globset::Glob, globset::Error> {
    GlobBuilder::new(mask).literal_separator(true).build()
}

fn compile(pattern: &str) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for mask in split_masks(pattern) {
        let glob = compile_mask(&mask).with_context(|| format!("invalid file mask '{}'", mask))?;
        builder.add(glob);
    }
    builder.build().context("failed to compile file masks")
}

fn scan(root: &Path, globs: &GlobSet) -> anyhow::Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("workspace {} does not exist", root.display());
    }

    let mut matches = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");

        if globs.is_match(relative.as_str()) {
            matches.push(entry.into_path());
        }
    }

    matches.sort();
    Ok(matches)
}

fn md5_file(path: &Path) -> anyhow::Result<[u8; 16]> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

#[async_trait]
impl WorkspaceResolver for LocalWorkspace {
    async fn list(&self, pattern: &str) -> anyhow::Result<Vec<PathBuf>> {
        let globs = compile(pattern)?;
        let root = self.root.clone();

        let matches = tokio::task::spawn_blocking(move || scan(&root, &globs))
            .await
            .context("workspace scan task failed")??;

        debug!(pattern, count = matches.len(), "Resolved file mask");
        Ok(matches)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .unwrap_or(false)
    }

    async fn is_directory(&self, path: &Path) -> bool {
        tokio::fs::metadata(self.resolve(path))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn length(&self, path: &Path) -> anyhow::Result<u64> {
        let path = self.resolve(path);
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        Ok(metadata.len())
    }

    async fn digest(&self, path: &Path) -> anyhow::Result<[u8; 16]> {
        let path = self.resolve(path);
        tokio::task::spawn_blocking(move || md5_file(&path))
            .await
            .context("digest task failed")?
    }

    async fn validate_mask(&self, pattern: &str) -> Option<String> {
        let masks = split_masks(pattern);
        if masks.is_empty() {
            return Some("The file mask is empty".to_string());
        }

        if let Ok(matches) = self.list(pattern).await
            && !matches.is_empty()
        {
            return None;
        }

        Some(
            masks
                .iter()
                .map(|m| self.explain(m))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, LocalWorkspace) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("dist/sub")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("dist/a.zip"), b"aaaa").unwrap();
        fs::write(root.join("dist/b.zip"), b"bb").unwrap();
        fs::write(root.join("dist/sub/c.zip"), b"c").unwrap();
        fs::write(root.join("docs/readme.txt"), b"hello").unwrap();

        let workspace = LocalWorkspace::new(root);
        (dir, workspace)
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_single_star_does_not_cross_directories() {
        let (_dir, workspace) = workspace();

        let matches = workspace.list("dist/*.zip").await.unwrap();

        assert_eq!(names(&matches), vec!["a.zip", "b.zip"]);
    }

    #[tokio::test]
    async fn test_double_star_matches_nested() {
        let (_dir, workspace) = workspace();

        let matches = workspace.list("dist/**/*.zip").await.unwrap();

        assert_eq!(names(&matches), vec!["a.zip", "b.zip", "c.zip"]);
    }

    #[tokio::test]
    async fn test_comma_separated_masks() {
        let (_dir, workspace) = workspace();

        let matches = workspace.list("dist/a.zip, docs/*.txt").await.unwrap();

        assert_eq!(names(&matches), vec!["a.zip", "readme.txt"]);
    }

    #[tokio::test]
    async fn test_trailing_slash_selects_directory_contents() {
        let (_dir, workspace) = workspace();

        let matches = workspace.list("./dist/").await.unwrap();

        assert_eq!(matches.len(), 3);
    }

    #[tokio::test]
    async fn test_list_only_returns_files() {
        let (_dir, workspace) = workspace();

        let matches = workspace.list("**").await.unwrap();

        assert_eq!(matches.len(), 4);
        for path in &matches {
            assert!(path.is_file());
        }
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        let workspace = LocalWorkspace::new(dir.path().join("gone"));

        assert!(workspace.list("*.zip").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_mask_is_an_error() {
        let (_dir, workspace) = workspace();

        let error = workspace.list("dist/[a.zip").await.unwrap_err();
        assert!(error.to_string().contains("invalid file mask"));
    }

    #[tokio::test]
    async fn test_file_queries() {
        let (dir, workspace) = workspace();
        let file = dir.path().join("docs/readme.txt");

        assert!(workspace.exists(&file).await);
        assert!(!workspace.is_directory(&file).await);
        assert!(workspace.is_directory(Path::new("dist")).await);
        assert!(!workspace.exists(Path::new("dist/missing.zip")).await);
        assert_eq!(workspace.length(&file).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_digest() {
        let (dir, workspace) = workspace();

        let digest = workspace
            .digest(&dir.path().join("docs/readme.txt"))
            .await
            .unwrap();

        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(hex, "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn test_validate_mask_matching() {
        let (_dir, workspace) = workspace();

        assert_eq!(workspace.validate_mask("dist/*.zip").await, None);
    }

    #[tokio::test]
    async fn test_validate_mask_missing_directory() {
        let (_dir, workspace) = workspace();

        let hint = workspace.validate_mask("build/libs/*.jar").await.unwrap();
        assert_eq!(hint, "'build' does not exist in the workspace");
    }

    #[tokio::test]
    async fn test_validate_mask_existing_directory_without_matches() {
        let (_dir, workspace) = workspace();

        let hint = workspace.validate_mask("dist/*.jar").await.unwrap();
        assert_eq!(hint, "'dist' exists but no files in it match 'dist/*.jar'");
    }

    #[tokio::test]
    async fn test_validate_mask_invalid() {
        let (_dir, workspace) = workspace();

        let hint = workspace.validate_mask("dist/[a.zip").await.unwrap();
        assert!(hint.contains("is not a valid file mask"));
    }
}
