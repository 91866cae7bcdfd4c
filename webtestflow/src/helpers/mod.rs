//! Path, identifier and JSON helpers shared across stages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use md5::{Digest, Md5};
use std::path::{Component, Path, PathBuf};

/// Resolves `relative` against `base`, returning `relative` untouched when
/// it is already absolute. The result is lexically normalized (no `.` or
/// `..` components) without touching the filesystem.
#[must_use]
pub fn absolute_path(base: &Path, relative: impl AsRef<Path>) -> PathBuf {
    let relative = relative.as_ref();
    if relative.is_absolute() {
        return normalize(relative);
    }
    normalize(&base.join(relative))
}

/// Lexically normalizes a path by folding `.` and `..` components.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    result.push(Component::ParentDir);
                }
            }
            other => result.push(other),
        }
    }
    result
}

/// Generates the collision-resistant run identifier.
///
/// The identifier joins a short digest of the base path with the current
/// epoch milliseconds, so that two concurrent runs from different checkouts
/// (or from the same checkout at different times) never share one. Dev-mode
/// runs always use the literal `"dev"` so re-runs reuse their leases.
///
/// The identifier is used as a process-key fragment and as a lease-file
/// key, and must never contain `=` (padding is rewritten to `d`).
#[must_use]
pub fn seq_id(base_path: &Path, is_dev: bool) -> String {
    if is_dev {
        return "dev".to_string();
    }

    let digest = Md5::digest(base_path.to_string_lossy().as_bytes());
    let encoded = STANDARD.encode(digest);
    let tail = &encoded[encoded.len().saturating_sub(6)..];
    let token = tail.replace(['=', '+', '/'], "d");

    format!("{token}{}", Utc::now().timestamp_millis())
}

/// Computes the lexical relative path from `from` to `to`.
///
/// Both paths are expected to be absolute and normalized. Used for the
/// workspace-relative locations exported to the hosting CI system.
#[must_use]
pub fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from.components().collect();
    let to: Vec<Component<'_>> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common..from.len() {
        result.push("..");
    }
    for component in &to[common..] {
        result.push(component);
    }

    if result.as_os_str().is_empty() {
        result.push(".");
    }
    result
}

/// Additively deep-merges `incoming` into `target`.
///
/// Nested objects are merged key by key; any other value type overwrites
/// the slot it lands on. Keys absent from `incoming` are left untouched,
/// so repeated exports from different stages accumulate.
pub fn merge_json(
    target: &mut serde_json::Map<String, serde_json::Value>,
    incoming: serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in incoming {
        match (target.get_mut(&key), value) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(new)) => {
                merge_json(existing, new);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Recursively copies a directory tree.
pub fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
