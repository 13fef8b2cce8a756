//! Grouping files by perceptual hash, and disposing of the extra copies.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::trash::move_to_trash;
use super::{move_file, unique_destination};

/// Files that look the same. The first path is the one that is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: usize,
    pub paths: Vec<PathBuf>,
}

/// Group `(path, hash)` pairs by hash, keeping only hashes seen more than
/// once. Groups and their paths keep the input order.
pub fn group_duplicates(hashes: Vec<(PathBuf, String)>) -> Vec<DuplicateGroup> {
    let mut order: Vec<Vec<PathBuf>> = Vec::new();
    let mut by_hash: HashMap<String, usize> = HashMap::new();

    for (path, hash) in hashes {
        match by_hash.get(&hash) {
            Some(&index) => order[index].push(path),
            None => {
                by_hash.insert(hash, order.len());
                order.push(vec![path]);
            }
        }
    }

    order
        .into_iter()
        .filter(|paths| paths.len() > 1)
        .enumerate()
        .map(|(id, paths)| DuplicateGroup { id, paths })
        .collect()
}

/// Every path of every group except the first.
pub fn removal_candidates(groups: &[DuplicateGroup]) -> Vec<PathBuf> {
    groups
        .iter()
        .flat_map(|g| g.paths.iter().skip(1).cloned())
        .collect()
}

/// What to do with a duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemovalAction {
    /// Move into the configured trash directory.
    Trash,
    Delete,
    MoveTo { folder: PathBuf },
}

/// Where a removed duplicate went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    Trashed(PathBuf),
    Deleted,
    Moved(PathBuf),
}

pub fn remove_duplicate(path: &Path, action: &RemovalAction, trash_dir: &Path) -> Result<Removal> {
    if !path.is_file() {
        bail!("File not found: {}", path.display());
    }
    match action {
        RemovalAction::Trash => Ok(Removal::Trashed(move_to_trash(path, trash_dir)?)),
        RemovalAction::Delete => {
            std::fs::remove_file(path).with_context(|| format!("Failed to delete {}", path.display()))?;
            Ok(Removal::Deleted)
        }
        RemovalAction::MoveTo { folder } => {
            let name = path
                .file_name()
                .with_context(|| format!("No file name in {}", path.display()))?;
            let destination = unique_destination(&folder.join(name));
            move_file(path, &destination)?;
            Ok(Removal::Moved(destination))
        }
    }
}
