use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::{IndexerConfig, STATE_DIR};
use crate::error::{Error, Result};

/// Leading window inspected for NUL bytes when classifying binaries.
const BINARY_SNIFF_BYTES: usize = 8000;

/// One scannable file, content already read and hashed.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Project-relative path, forward slashes.
    pub path: String,
    /// Full-content hash, stable across runs.
    pub hash: String,
    pub mtime: DateTime<Utc>,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Indexable files in lexicographic path order.
    pub files: Vec<FileInfo>,
    /// Paths classified as binary, oversized, or unreadable.
    pub skipped: Vec<String>,
}

pub struct Scanner {
    root: PathBuf,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    extra_ignore: Option<Gitignore>,
    max_file_bytes: u64,
}

impl Scanner {
    pub fn new(root: impl AsRef<Path>, config: &IndexerConfig) -> Result<Self> {
        let root = fs::canonicalize(root.as_ref())?;

        let include = build_globset(&config.include)?;
        let exclude = build_globset(&config.exclude)?;

        // Supplementary ignore file with gitignore semantics (anchored globs,
        // `!` negation, trailing-slash directory markers).
        let ignore_file = root.join(STATE_DIR).join("ignore");
        let extra_ignore = if ignore_file.exists() {
            let mut builder = GitignoreBuilder::new(&root);
            if let Some(e) = builder.add(&ignore_file) {
                return Err(Error::config(format!(
                    "invalid ignore file {}: {}",
                    ignore_file.display(),
                    e
                )));
            }
            Some(
                builder
                    .build()
                    .map_err(|e| Error::config(e.to_string()))?,
            )
        } else {
            None
        };

        Ok(Self {
            root,
            include,
            exclude,
            extra_ignore,
            max_file_bytes: config.max_file_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the project tree and classify every candidate file.
    pub fn scan(&self) -> Result<ScanOutcome> {
        // An unreadable root is fatal; everything below it is best-effort.
        fs::metadata(&self.root)?;

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .ignore(true)
            .parents(true)
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                name != ".git" && name != STATE_DIR
            })
            .build();

        let mut outcome = ScanOutcome::default();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "walk error, skipping entry");
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let rel = match self.relative(path) {
                Some(r) => r,
                None => continue,
            };

            if !self.selected(path, &rel) {
                continue;
            }

            match self.read_file(path, &rel) {
                Ok(Some(info)) => outcome.files.push(info),
                Ok(None) => outcome.skipped.push(rel),
                Err(e) => {
                    warn!(path = %rel, error = %e, "failed to read file, skipping");
                    outcome.skipped.push(rel);
                }
            }
        }

        outcome.files.sort_by(|a, b| a.path.cmp(&b.path));
        outcome.skipped.sort();
        Ok(outcome)
    }

    /// Classify a single file by project-relative path. Returns `None` when
    /// the file is gone, filtered out, binary, or oversized.
    pub fn scan_single(&self, rel: &str) -> Result<Option<FileInfo>> {
        let path = self.root.join(rel);
        if !path.is_file() {
            return Ok(None);
        }
        let rel = rel.replace('\\', "/");
        if !self.selected(&path, &rel) {
            return Ok(None);
        }
        self.read_file(&path, &rel)
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(rel.to_string_lossy().replace('\\', "/"))
    }

    fn selected(&self, path: &Path, rel: &str) -> bool {
        if let Some(extra) = &self.extra_ignore {
            if extra.matched_path_or_any_parents(path, false).is_ignore() {
                return false;
            }
        }
        if let Some(include) = &self.include {
            if !include.is_match(rel) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(rel) {
                return false;
            }
        }
        true
    }

    fn read_file(&self, path: &Path, rel: &str) -> Result<Option<FileInfo>> {
        let metadata = fs::metadata(path)?;
        if metadata.len() > self.max_file_bytes {
            return Ok(None);
        }

        let bytes = fs::read(path)?;
        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
        if sniff.contains(&0) {
            return Ok(None);
        }

        let content = String::from_utf8_lossy(&bytes).into_owned();
        let mtime: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(FileInfo {
            path: rel.to_string(),
            hash: hash_content(&content),
            mtime,
            content,
        }))
    }
}

/// Full-content hash used for change detection and chunk identity.
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::config(format!("invalid glob {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    Ok(Some(
        builder
            .build()
            .map_err(|e| Error::config(e.to_string()))?,
    ))
}
