use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Truncate a string to at most `max` characters, appending `...` when cut.
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// A path validated to live inside the project root.
pub struct ProjectPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve a relative path against the project root, rejecting anything that
/// could escape it. The target does not have to exist yet (fix steps create
/// files), but the deepest existing ancestor is canonicalized and checked.
pub fn resolve_project_path(project_root: &Path, candidate: &Path) -> Result<ProjectPath> {
    if candidate.as_os_str().is_empty() {
        return Err(Error::policy("path is empty"));
    }
    if candidate.is_absolute() {
        return Err(Error::policy(format!(
            "absolute paths are not allowed: {}",
            candidate.display()
        )));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::policy(format!(
            "parent traversal is not allowed: {}",
            candidate.display()
        )));
    }

    let root = project_root
        .canonicalize()
        .map_err(|e| Error::io("resolving project root", e))?;
    let joined = root.join(candidate);

    // Canonicalize the deepest existing ancestor so symlinks cannot smuggle
    // the target outside the root.
    let mut probe = joined.clone();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) => probe = parent.to_path_buf(),
            None => break,
        }
    }
    let resolved_probe = probe
        .canonicalize()
        .map_err(|e| Error::io(format!("resolving {}", probe.display()), e))?;
    if !resolved_probe.starts_with(&root) {
        return Err(Error::policy(format!(
            "path escapes project root: {}",
            candidate.display()
        )));
    }

    let relative = joined
        .strip_prefix(&root)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|_| candidate.to_path_buf());

    Ok(ProjectPath {
        absolute: joined,
        relative,
    })
}
