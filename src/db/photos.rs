use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use std::path::{Path, PathBuf};

use super::faces::NewFace;
use super::Database;
use crate::faces::extractor::ExtractionResult;

/// Lifecycle of a photo in the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoStatus {
    Imported,
    Indexed,
    Synced,
}

impl PhotoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoStatus::Imported => "imported",
            PhotoStatus::Indexed => "indexed",
            PhotoStatus::Synced => "synced",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "imported" => Some(PhotoStatus::Imported),
            "indexed" => Some(PhotoStatus::Indexed),
            "synced" => Some(PhotoStatus::Synced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Photo {
    pub id: i64,
    pub path: PathBuf,
    pub sha256_hash: Option<String>,
    pub date_taken: Option<String>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub status: PhotoStatus,
}

const PHOTO_COLUMNS: &str =
    "id, path, sha256_hash, date_taken, year, month, gps_latitude, gps_longitude, status";

fn photo_from_row(row: &rusqlite::Row) -> rusqlite::Result<Photo> {
    let status: String = row.get(8)?;
    Ok(Photo {
        id: row.get(0)?,
        path: PathBuf::from(row.get::<_, String>(1)?),
        sha256_hash: row.get(2)?,
        date_taken: row.get(3)?,
        year: row.get(4)?,
        month: row.get(5)?,
        gps_latitude: row.get(6)?,
        gps_longitude: row.get(7)?,
        status: PhotoStatus::from_str(&status).unwrap_or(PhotoStatus::Imported),
    })
}

impl Database {
    /// Record a newly imported file. Returns `None` when the path is already
    /// in the library.
    pub fn insert_imported_photo(&self, path: &Path, sha256_hash: &str) -> Result<Option<i64>> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO photos (path, sha256_hash, status) VALUES (?, ?, 'imported')",
            params![path.to_string_lossy(), sha256_hash],
        )?;
        Ok((inserted > 0).then(|| self.conn.last_insert_rowid()))
    }

    pub fn get_photo(&self, photo_id: i64) -> Result<Option<Photo>> {
        let photo = self
            .conn
            .query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?"),
                [photo_id],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    pub fn get_photo_by_path(&self, path: &Path) -> Result<Option<Photo>> {
        let photo = self
            .conn
            .query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE path = ?"),
                [path.to_string_lossy()],
                photo_from_row,
            )
            .optional()?;
        Ok(photo)
    }

    /// `(id, path)` of every photo in the given state, oldest first.
    pub fn photos_with_status(&self, status: PhotoStatus) -> Result<Vec<(i64, PathBuf)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path FROM photos WHERE status = ? ORDER BY id")?;
        let photos = stmt
            .query_map([status.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    pub fn all_photo_paths(&self) -> Result<Vec<(i64, PathBuf)>> {
        let mut stmt = self.conn.prepare("SELECT id, path FROM photos ORDER BY id")?;
        let photos = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    pub fn count_photos_by_status(&self) -> Result<Vec<(PhotoStatus, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM photos GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .filter_map(|r| r.ok())
            .filter_map(|(status, count)| PhotoStatus::from_str(&status).map(|s| (s, count)))
            .collect();
        Ok(counts)
    }

    /// Write the outcome of indexing one photo.
    ///
    /// Tags and faces from any previous index of the same photo are replaced.
    /// Returns the ids of the inserted faces.
    pub fn save_index_result(&self, photo_id: i64, result: &ExtractionResult) -> Result<Vec<i64>> {
        let date_taken = result
            .date
            .taken
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string());
        let (latitude, longitude) = match result.gps {
            Some(gps) => (Some(gps.latitude), Some(gps.longitude)),
            None => (None, None),
        };

        self.conn.execute(
            r#"
            UPDATE photos
            SET date_taken = ?, year = ?, month = ?,
                gps_latitude = ?, gps_longitude = ?,
                status = 'indexed', indexed_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![date_taken, result.date.year, result.date.month, latitude, longitude, photo_id],
        )?;

        self.conn.execute("DELETE FROM tags WHERE photo_id = ?", [photo_id])?;
        self.conn.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?;

        {
            let mut stmt = self
                .conn
                .prepare("INSERT INTO tags (photo_id, tag_name, tag_value) VALUES (?, ?, ?)")?;
            for tag in &result.tags {
                stmt.execute(params![photo_id, tag.name, tag.value])?;
            }
        }

        let mut face_ids = Vec::with_capacity(result.faces.len());
        for face in &result.faces {
            face_ids.push(self.insert_face(&NewFace {
                photo_id,
                embedding: &face.embedding,
                thumbnail_path: face.thumbnail_path.as_deref(),
                bbox: face.bbox,
            })?);
        }

        Ok(face_ids)
    }

    pub fn photo_tags(&self, photo_id: i64) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag_name, tag_value FROM tags WHERE photo_id = ? ORDER BY id")?;
        let tags = stmt
            .query_map([photo_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    /// Delete a photo; its tags and faces go with it.
    pub fn delete_photo(&self, photo_id: i64) -> Result<bool> {
        let deleted = self.conn.execute("DELETE FROM photos WHERE id = ?", [photo_id])?;
        Ok(deleted > 0)
    }

    /// Point a photo at its new location after the file was moved.
    pub fn update_photo_path(&self, old_path: &Path, new_path: &Path) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE photos SET path = ? WHERE path = ?",
            params![new_path.to_string_lossy(), old_path.to_string_lossy()],
        )?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::TestDb;
    use crate::db::BoundingBox;
    use crate::faces::extractor::{ExtractedFace, ExtractionResult, Tag};
    use crate::scanner::dates::CaptureDate;
    use crate::scanner::metadata::GpsCoordinates;
    use chrono::NaiveDate;

    fn sample_result(faces: usize) -> ExtractionResult {
        ExtractionResult {
            date: CaptureDate {
                taken: NaiveDate::from_ymd_opt(2021, 7, 4).and_then(|d| d.and_hms_opt(12, 0, 0)),
                year: Some(2021),
                month: Some(7),
            },
            gps: Some(GpsCoordinates {
                latitude: 48.85,
                longitude: -2.35,
            }),
            tags: vec![Tag {
                name: "Make".to_string(),
                value: "Canon".to_string(),
            }],
            faces: (0..faces)
                .map(|i| ExtractedFace {
                    bbox: BoundingBox {
                        top: 10,
                        right: 50,
                        bottom: 60,
                        left: 5 + i as i32,
                    },
                    embedding: vec![i as f32, 1.0],
                    thumbnail_path: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_import_is_unique_per_path() {
        let t = TestDb::new();
        let path = Path::new("/photos/a.jpg");

        let first = t.db.insert_imported_photo(path, "abc").unwrap();
        assert!(first.is_some());
        assert!(t.db.insert_imported_photo(path, "abc").unwrap().is_none());

        let imported = t.db.photos_with_status(PhotoStatus::Imported).unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].1, PathBuf::from("/photos/a.jpg"));
    }

    #[test]
    fn test_save_index_result_replaces_previous_index() {
        let t = TestDb::new();
        let id = t
            .db
            .insert_imported_photo(Path::new("/photos/b.jpg"), "def")
            .unwrap()
            .unwrap();

        let first = t.db.save_index_result(id, &sample_result(2)).unwrap();
        assert_eq!(first.len(), 2);
        let second = t.db.save_index_result(id, &sample_result(1)).unwrap();
        assert_eq!(second.len(), 1);

        assert_eq!(t.db.get_faces_for_photo(id).unwrap().len(), 1);
        assert_eq!(t.db.photo_tags(id).unwrap().len(), 1);

        let photo = t.db.get_photo(id).unwrap().unwrap();
        assert_eq!(photo.status, PhotoStatus::Indexed);
        assert_eq!(photo.year, Some(2021));
        assert_eq!(photo.month, Some(7));
        assert_eq!(photo.date_taken.as_deref(), Some("2021-07-04 12:00:00"));
        assert_eq!(photo.gps_longitude, Some(-2.35));
    }

    #[test]
    fn test_delete_photo_cascades_to_faces() {
        let t = TestDb::new();
        let id = t
            .db
            .insert_imported_photo(Path::new("/photos/c.jpg"), "ghi")
            .unwrap()
            .unwrap();
        let faces = t.db.save_index_result(id, &sample_result(1)).unwrap();

        assert!(t.db.delete_photo(id).unwrap());
        assert!(t.db.get_faces(&faces).unwrap().is_empty());
    }

    #[test]
    fn test_update_photo_path() {
        let t = TestDb::new();
        let old = Path::new("/photos/d.jpg");
        let new = Path::new("/photos/2021/July/d.jpg");
        let id = t.db.insert_imported_photo(old, "jkl").unwrap().unwrap();

        assert!(t.db.update_photo_path(old, new).unwrap());
        assert!(t.db.get_photo_by_path(old).unwrap().is_none());
        assert_eq!(t.db.get_photo_by_path(new).unwrap().unwrap().id, id);
        assert!(!t.db.update_photo_path(old, new).unwrap());
    }
}
