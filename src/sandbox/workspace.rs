//! Working-directory boundary validation
//!
//! Every execution call re-validates its working directory against the
//! approved root; nothing is cached per directory.

use std::path::{Component, Path, PathBuf};

/// Validate that `working_dir` resolves to the approved root or a descendant
/// of it.
///
/// The directory may not exist yet (callers create it after validation), so
/// resolution normalizes `..`/`.` components lexically and then
/// canonicalizes the nearest existing ancestor to defeat symlink traversal.
/// Returns a descriptive refusal message on violation; this is a pure check
/// with no side effects.
pub fn validate_working_dir(working_dir: &Path, approved_root: &Path) -> Result<(), String> {
    let root = approved_root
        .canonicalize()
        .unwrap_or_else(|_| normalize(approved_root));
    let resolved = resolve_lenient(working_dir);

    if resolved == root || resolved.starts_with(&root) {
        Ok(())
    } else {
        Err(format!(
            "BLOCKED: Working directory {} is outside the approved root ({})",
            working_dir.display(),
            approved_root.display()
        ))
    }
}

/// Lexically normalize a path, collapsing `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve a possibly-nonexistent path: canonicalize the deepest existing
/// ancestor, then re-append the remaining components.
fn resolve_lenient(path: &Path) -> PathBuf {
    let normalized = normalize(path);
    if let Ok(resolved) = normalized.canonicalize() {
        return resolved;
    }

    let mut current = normalized.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match current.canonicalize() {
            Ok(resolved) => {
                return tail
                    .iter()
                    .rev()
                    .fold(resolved, |acc, segment| acc.join(segment));
            }
            Err(_) => match (current.parent(), current.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name.to_os_string());
                    current = parent.to_path_buf();
                }
                _ => return normalized,
            },
        }
    }
}
