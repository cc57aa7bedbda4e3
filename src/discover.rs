//! Filesystem discovery for the documents root and the code root.
//!
//! The documents root is walked recursively into one list of document
//! sources. The code root is split into repositories: every immediate
//! subdirectory is one, and files directly under the root form another. Each
//! repository becomes its own pipeline.
//!
//! Ignore rules, in order: pruned directories (`.git`, `target`,
//! `node_modules`, hidden entries when `skip_hidden`), ignored extensions,
//! `exclude_globs`, then `include_globs`. Globs match the path relative to the
//! directory being walked.
//!
//! Walk errors do not abort discovery; they come back as failures so the run
//! summary can report them. A dangling symlink is returned as a candidate and
//! fails when the pipeline tries to read it.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::config::IngestConfig;
use crate::error::{ConfigError, SourceError};
use crate::models::{FailedSource, SourceFile, SourceKind};

const PRUNED_DIRS: [&str; 3] = [".git", "target", "node_modules"];

/// Label used for code paths when the code root has no usable directory name.
pub const DEFAULT_CODE_LABEL: &str = "code";

/// Files found under one root, plus entries that could not be walked.
#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<SourceFile>,
    pub failures: Vec<FailedSource>,
}

impl Discovery {
    /// Every path this discovery saw, readable or not.
    pub fn seen_paths(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .map(|f| f.rel_path.as_str())
            .chain(self.failures.iter().map(|f| f.path.as_str()))
    }
}

/// One repository under the code root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRepo {
    /// Pipeline label, `<code label>/<dir>` or just `<code label>` for loose files.
    pub label: String,
    pub dir: PathBuf,
    /// Only the files directly in `dir`, no recursion.
    pub loose_files: bool,
}

/// Compiled ignore rules.
pub struct Walker {
    include: GlobSet,
    exclude: GlobSet,
    ignore_extensions: HashSet<String>,
    skip_hidden: bool,
    follow_symlinks: bool,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| ConfigError::Invalid(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| ConfigError::Invalid(format!("bad glob set: {}", e)))
}

/// `/`-joined components of `path` below `base`.
fn rel_string(path: &Path, base: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// The directory name used to prefix code paths.
pub fn code_label(code_root: &Path) -> String {
    let named = |p: &Path| {
        p.file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    };
    named(code_root)
        .or_else(|| code_root.canonicalize().ok().as_deref().and_then(named))
        .unwrap_or_else(|| DEFAULT_CODE_LABEL.to_string())
}

impl Walker {
    pub fn new(config: &IngestConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
            ignore_extensions: config
                .ignore_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            skip_hidden: config.skip_hidden,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn prune_dir(&self, entry: &DirEntry, skip: Option<&Path>) -> bool {
        if entry.depth() == 0 {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        if self.skip_hidden && name.starts_with('.') {
            return true;
        }
        if !entry.file_type().is_dir() {
            return false;
        }
        if PRUNED_DIRS.contains(&name.as_ref()) {
            return true;
        }
        match skip {
            Some(skip) => entry
                .path()
                .canonicalize()
                .map(|p| p == skip)
                .unwrap_or(false),
            None => false,
        }
    }

    fn wanted(&self, rel: &str) -> bool {
        let ext = Path::new(rel)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if let Some(ext) = ext {
            if self.ignore_extensions.contains(&ext) {
                return false;
            }
        }
        !self.exclude.is_match(rel) && self.include.is_match(rel)
    }

    /// Walk `root`, naming every file `{prefix}{path below root}`.
    ///
    /// `skip` is a canonical directory to leave out entirely. `max_depth`
    /// limits recursion (1 means the files directly in `root`).
    pub fn walk(
        &self,
        root: &Path,
        prefix: &str,
        kind: SourceKind,
        skip: Option<&Path>,
        max_depth: Option<usize>,
    ) -> Discovery {
        let mut out = Discovery::default();
        let mut walker = WalkDir::new(root).follow_links(self.follow_symlinks);
        if let Some(depth) = max_depth {
            walker = walker.max_depth(depth);
        }

        for entry in walker
            .into_iter()
            .filter_entry(|e| !self.prune_dir(e, skip))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(|p| format!("{}{}", prefix, rel_string(p, root)))
                        .unwrap_or_else(|| prefix.trim_end_matches('/').to_string());
                    tracing::warn!(path = %path, error = %err, "walk error");
                    out.failures.push(FailedSource {
                        path,
                        reason: SourceError::Walk(err.to_string()).to_string(),
                    });
                    continue;
                }
            };

            let file_type = entry.file_type();
            let candidate = if file_type.is_file() {
                true
            } else if file_type.is_symlink() {
                // not followed: a link to a file is read through, a dangling
                // link is kept so the read reports it
                match std::fs::metadata(entry.path()) {
                    Ok(meta) => meta.is_file(),
                    Err(_) => true,
                }
            } else {
                false
            };
            if !candidate {
                continue;
            }

            let rel = rel_string(entry.path(), root);
            if !self.wanted(&rel) {
                continue;
            }
            out.files.push(SourceFile {
                rel_path: format!("{}{}", prefix, rel),
                abs_path: entry.into_path(),
                kind,
            });
        }

        out.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        out
    }

    /// Document sources under `documents_root`, excluding `code_root` when nested inside it.
    pub fn documents(&self, documents_root: &Path, code_root: Option<&Path>) -> Discovery {
        let skip = code_root.and_then(|c| c.canonicalize().ok());
        self.walk(
            documents_root,
            "",
            SourceKind::Document,
            skip.as_deref(),
            None,
        )
    }

    /// Code sources of one repository.
    pub fn repository(&self, repo: &CodeRepo) -> Discovery {
        let prefix = format!("{}/", repo.label);
        let depth = repo.loose_files.then_some(1);
        self.walk(&repo.dir, &prefix, SourceKind::Code, None, depth)
    }

    /// Split `code_root` into repositories, sorted by label.
    pub fn repositories(&self, code_root: &Path) -> std::io::Result<Vec<CodeRepo>> {
        let label = code_label(code_root);
        let mut repos = Vec::new();
        let mut has_loose_files = false;

        for entry in std::fs::read_dir(code_root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if self.skip_hidden && name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let meta = if self.follow_symlinks {
                std::fs::metadata(&path)
            } else {
                std::fs::symlink_metadata(&path)
            };
            match meta {
                Ok(meta) if meta.is_dir() => {
                    if !PRUNED_DIRS.contains(&name.as_str()) {
                        repos.push(CodeRepo {
                            label: format!("{}/{}", label, name),
                            dir: path,
                            loose_files: false,
                        });
                    }
                }
                _ => has_loose_files = true,
            }
        }

        if has_loose_files {
            repos.push(CodeRepo {
                label: label.clone(),
                dir: code_root.to_path_buf(),
                loose_files: true,
            });
        }
        repos.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(repos)
    }
}
