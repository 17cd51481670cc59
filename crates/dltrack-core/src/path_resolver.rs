//! Collision-free destination naming

use crate::platform::FileSystem;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const FALLBACK_FILENAME: &str = "download";

/// Pick a path in `dir` for `filename` that does not exist yet.
///
/// Tries `name.ext`, then `name (1).ext`, `name (2).ext`, ... and checks
/// every candidate against the filesystem.
pub fn resolve_destination(fs: &dyn FileSystem, dir: &Path, filename: &str) -> PathBuf {
    resolve_destination_excluding(fs, dir, filename, &HashSet::new())
}

/// Like [`resolve_destination`], but also skips paths in `reserved`.
///
/// Completions that are still moving their file hold a reservation, so a
/// candidate is free only when it is neither on disk nor reserved.
pub fn resolve_destination_excluding(
    fs: &dyn FileSystem,
    dir: &Path,
    filename: &str,
    reserved: &HashSet<PathBuf>,
) -> PathBuf {
    let taken = |candidate: &Path| reserved.contains(candidate) || fs.exists(candidate);

    let filename = sanitize_filename(filename);
    let first = dir.join(&filename);
    if !taken(first.as_path()) {
        return first;
    }

    let (stem, extension) = split_extension(&filename);
    (1u64..)
        .map(|n| match extension {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|candidate| !taken(candidate.as_path()))
        .unwrap_or(first)
}

/// Reduce a suggested name to a bare file name
pub fn sanitize_filename(filename: &str) -> String {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        FALLBACK_FILENAME.to_string()
    } else {
        name.to_string()
    }
}

fn split_extension(filename: &str) -> (&str, Option<&str>) {
    let path = Path::new(filename);
    match (path.file_stem().and_then(|s| s.to_str()), path.extension().and_then(|e| e.to_str())) {
        (Some(stem), Some(ext)) => (stem, Some(ext)),
        _ => (filename, None),
    }
}
