//! Operations on the photo files themselves: sorting them into dated folders,
//! and finding and removing duplicates.

pub mod duplicates;
pub mod organize;
pub mod trash;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub use duplicates::{
    group_duplicates, removal_candidates, remove_duplicate, DuplicateGroup, Removal, RemovalAction,
};
pub use organize::{plan_organize, FileOperation, OrganizePattern};

/// Move a file, falling back to copy and delete across filesystems.
pub fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    std::fs::rename(source, destination)
        .or_else(|_| {
            std::fs::copy(source, destination)?;
            std::fs::remove_file(source)
        })
        .with_context(|| format!("Failed to move {} to {}", source.display(), destination.display()))
}

/// `destination` itself if it is free, otherwise the first free
/// `stem_1.ext`, `stem_2.ext`, ... next to it.
pub fn unique_destination(destination: &Path) -> PathBuf {
    if !destination.exists() {
        return destination.to_path_buf();
    }
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = destination
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = destination.parent().unwrap_or(Path::new(""));

    let mut counter = 1;
    loop {
        let candidate = parent.join(format!("{stem}_{counter}{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
