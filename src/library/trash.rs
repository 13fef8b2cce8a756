use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::move_file;

/// `{stem}_{timestamp}_{seq}{.ext}`. The process-wide counter keeps names
/// unique when several files are trashed in the same second.
fn trash_name(original: &Path) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let timestamp = Utc::now().timestamp();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    let extension = original
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    format!("{stem}_{timestamp}_{seq}{extension}")
}

/// Move a file into `trash_dir`. Returns where it ended up.
pub fn move_to_trash(path: &Path, trash_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(trash_dir)
        .with_context(|| format!("Failed to create trash directory {}", trash_dir.display()))?;
    let trash_path = trash_dir.join(trash_name(path));
    move_file(path, &trash_path)?;
    Ok(trash_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_same_name_twice() {
        let dir = tempdir().unwrap();
        let trash = dir.path().join("trash");
        let a = dir.path().join("one/IMG_1.jpg");
        let b = dir.path().join("two/IMG_1.jpg");
        for path in [&a, &b] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"x").unwrap();
        }

        let first = move_to_trash(&a, &trash).unwrap();
        let second = move_to_trash(&b, &trash).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(&trash) && first.exists());
        assert!(second.to_string_lossy().ends_with(".jpg"));
        assert!(!a.exists() && !b.exists());
    }
}
