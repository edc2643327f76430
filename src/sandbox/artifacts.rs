//! Artifact detection via before/after directory snapshots
//!
//! Naive "list every new file" reporting floods the caller with interpreter
//! caches, virtualenv internals, and lock files whenever the executed code
//! imports a local module or installs a dependency. This scanner's whole job
//! is separating signal (a report, a chart, a processed dataset) from noise
//! (packaging and interpreter side effects).

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Directory names whose entire subtree is pruned from the walk.
/// Pruning stops recursion, which matters on projects with large
/// dependency trees.
const PRUNED_DIRS: &[&str] = &[
    "venv",
    ".venv",
    "env",
    "virtualenv",
    "node_modules",
    "site-packages",
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".tox",
    ".nox",
    ".pip-cache",
    ".cache",
    ".npm",
    ".ipynb_checkpoints",
    ".idea",
    ".vscode",
];

/// Exact filenames that are never artifacts: virtualenv activation
/// scripts, package-manager wrappers and lock files, packaging and OS
/// metadata.
const EXCLUDED_FILENAMES: &[&str] = &[
    "activate",
    "activate.sh",
    "activate.fish",
    "activate.csh",
    "activate.bat",
    "activate.ps1",
    "pyvenv.cfg",
    "pip",
    "pip3",
    "python",
    "python3",
    "wheel",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Pipfile.lock",
    "uv.lock",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
];

/// Extensions that are never artifacts: compiled bytecode, shared
/// libraries, object files, headers, wheel/egg archives.
const EXCLUDED_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "pyd", "so", "dylib", "dll", "o", "a", "obj", "h", "hpp", "hh", "whl", "egg",
];

/// Extensions recognized as genuine output types, used by the
/// dependency-leak sanity filter and the stdout recovery scan.
const OUTPUT_EXTENSIONS: &[&str] = &[
    "html", "pdf", "csv", "json", "png", "jpg", "jpeg", "svg", "gif", "webp", "zip", "tar", "gz",
    "xlsx", "xls", "docx", "pptx", "txt", "md", "mp3", "mp4", "wav", "webm", "parquet",
];

static STDOUT_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)[\w@./~-][\w@.,~/-]*\.(html|pdf|csv|json|png|jpg|jpeg|svg|gif|webp|zip|tar|gz|xlsx|xls|docx|pptx|txt|md|mp3|mp4|wav|webm|parquet)\b",
    )
    .expect("invalid stdout path pattern")
});

/// Point-in-time listing of a working directory: absolute path → mtime.
/// Compared against a second snapshot after execution; never persisted.
#[derive(Debug, Default)]
pub struct ArtifactSnapshot {
    entries: HashMap<PathBuf, SystemTime>,
}

fn is_infrastructure_dir(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    PRUNED_DIRS.iter().any(|d| *d == name)
        || name.ends_with(".egg-info")
        || name.ends_with(".dist-info")
}

fn is_excluded_filename(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    EXCLUDED_FILENAMES.iter().any(|f| *f == name)
}

fn has_excluded_extension(path: &Path) -> bool {
    match path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
        Some(ext) => EXCLUDED_EXTENSIONS.iter().any(|e| *e == ext),
        None => false,
    }
}

fn has_output_extension(path: &Path) -> bool {
    match path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
        Some(ext) => OUTPUT_EXTENSIONS.iter().any(|e| *e == ext),
        None => false,
    }
}

/// True if any path component names a pruned infrastructure directory
fn inside_infrastructure_dir(path: &Path) -> bool {
    path.components()
        .any(|c| is_infrastructure_dir(c.as_os_str()))
}

/// Walk the tree rooted at `dir`, pruning infrastructure subtrees and
/// yielding only files.
fn walk_files(dir: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_dir() && is_infrastructure_dir(entry.file_name()))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
}

/// Capture the current state of a working directory
pub fn snapshot(dir: &Path) -> ArtifactSnapshot {
    let mut entries = HashMap::new();
    if dir.exists() {
        for entry in walk_files(dir) {
            if let Ok(metadata) = entry.metadata() {
                if let Ok(mtime) = metadata.modified() {
                    entries.insert(entry.path().to_path_buf(), mtime);
                }
            }
        }
    }
    ArtifactSnapshot { entries }
}

/// Diff the directory against a prior snapshot.
///
/// A file counts when it is absent from the snapshot or its mtime
/// increased since (so outputs overwritten by a retry are caught, not only
/// newly created ones). Zero-byte files never count, nor do paths in
/// `exclude` (the temporary payload script). Above `sanity_threshold`
/// candidates, a dependency install is assumed to have leaked into the
/// tree and the list is re-filtered to known output extensions; if that
/// empties it, the unfiltered candidates are returned rather than nothing.
pub fn diff(
    before: &ArtifactSnapshot,
    dir: &Path,
    exclude: &[&Path],
    sanity_threshold: usize,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for entry in walk_files(dir) {
        let path = entry.path();
        if exclude.iter().any(|e| *e == path) {
            continue;
        }
        if is_excluded_filename(entry.file_name()) || has_excluded_extension(path) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if metadata.len() == 0 {
            continue;
        }
        let changed = match (before.entries.get(path), metadata.modified()) {
            (None, _) => true,
            (Some(prev), Ok(now)) => now > *prev,
            (Some(_), Err(_)) => false,
        };
        if changed {
            candidates.push(path.to_path_buf());
        }
    }

    if candidates.len() > sanity_threshold {
        let filtered: Vec<PathBuf> = candidates
            .iter()
            .filter(|p| has_output_extension(p))
            .cloned()
            .collect();
        if !filtered.is_empty() {
            candidates = filtered;
        }
    }

    candidates.sort();
    candidates
}

/// Recover artifact paths from stdout when the diff came up empty.
///
/// Covers tools that write to a location the snapshot missed (a nested
/// directory created mid-run whose timestamps fell inside clock
/// granularity, or a write that landed before the baseline was captured).
/// Only paths that exist on disk, are non-empty, and pass the same
/// exclusion rules are returned.
pub fn scan_stdout_for_outputs(stdout: &str, working_dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for m in STDOUT_PATH_RE.find_iter(stdout) {
        let token = m.as_str();
        if token.starts_with('~') {
            continue;
        }
        let candidate = if Path::new(token).is_absolute() {
            PathBuf::from(token)
        } else {
            working_dir.join(token)
        };
        if inside_infrastructure_dir(&candidate) {
            continue;
        }
        if candidate
            .file_name()
            .map(is_excluded_filename)
            .unwrap_or(true)
        {
            continue;
        }
        let metadata = match candidate.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !metadata.is_file() || metadata.len() == 0 {
            continue;
        }
        if !found.contains(&candidate) {
            found.push(candidate);
        }
    }
    found.sort();
    found
}
