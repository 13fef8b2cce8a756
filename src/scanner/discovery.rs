use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext)
        })
        .unwrap_or(false)
}

/// Walk `roots` for image files.
///
/// Hidden files and directories are skipped, as is anything under `exclude`
/// (the face thumbnail directory, typically). Roots that cannot be read are
/// logged and skipped. The result is sorted and free of duplicates.
pub fn discover_images(roots: &[PathBuf], extensions: &[String], exclude: Option<&Path>) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for root in roots {
        if !root.is_dir() {
            tracing::warn!(path = %root.display(), "Media directory does not exist");
            continue;
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_hidden(e) && exclude.map_or(true, |ex| !e.path().starts_with(ex)));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            if entry.file_type().is_file() && has_extension(path, extensions) {
                images.push(path.to_path_buf());
            }
        }
    }

    images.sort();
    images.dedup();
    images
}
