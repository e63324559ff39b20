//! Detection of the out-of-band analysis marker in captured output.

use std::path::{Path, PathBuf};

/// Default marker prefix a script prints to request analysis of a file.
pub const DEFAULT_MARKER: &str = "#STEPWISE_ANALYZE_IMAGE_PATH:";

/// Return the path named by the first line that starts with `marker`.
pub fn find_marked_path<'a>(lines: &'a [String], marker: &str) -> Option<&'a str> {
    lines
        .iter()
        .find_map(|line| line.strip_prefix(marker))
        .map(str::trim)
        .filter(|path| !path.is_empty())
}

/// Choose the artifact to analyse.
///
/// A marker path wins over the dependency-supplied fallback. Relative marker
/// paths resolve against `base_dir`; without a base directory an absolute
/// fallback is preferred to guessing one.
pub fn resolve_target(
    marked: Option<&str>,
    fallback: Option<&str>,
    base_dir: Option<&Path>,
) -> Option<PathBuf> {
    let fallback = fallback.map(str::trim).filter(|p| !p.is_empty());
    let Some(marked) = marked else {
        return fallback.map(|p| resolve(Path::new(p), base_dir));
    };

    let marked_path = Path::new(marked);
    if marked_path.is_absolute() {
        return Some(marked_path.to_path_buf());
    }
    match base_dir {
        Some(dir) => Some(dir.join(marked_path)),
        None => match fallback.map(Path::new) {
            Some(fb) if fb.is_absolute() => Some(fb.to_path_buf()),
            _ => Some(marked_path.to_path_buf()),
        },
    }
}

fn resolve(path: &Path, base_dir: Option<&Path>) -> PathBuf {
    match base_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}
