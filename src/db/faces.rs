//! Faces and the people they are assigned to.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::embeddings::{bytes_to_embedding, embedding_to_bytes};
use super::Database;

/// Face location in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl BoundingBox {
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceStatus {
    Unassigned,
    Assigned,
    Ignored,
}

impl FaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaceStatus::Unassigned => "unassigned",
            FaceStatus::Assigned => "assigned",
            FaceStatus::Ignored => "ignored",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unassigned" => Some(FaceStatus::Unassigned),
            "assigned" => Some(FaceStatus::Assigned),
            "ignored" => Some(FaceStatus::Ignored),
            _ => None,
        }
    }
}

/// A detected face in a photo
#[derive(Debug, Clone)]
pub struct Face {
    pub id: i64,
    pub photo_id: i64,
    pub embedding: Vec<f32>,
    pub thumbnail_path: Option<PathBuf>,
    pub bbox: BoundingBox,
    pub person_id: Option<i64>,
    pub status: FaceStatus,
}

/// Borrowed form used when inserting.
#[derive(Debug, Clone, Copy)]
pub struct NewFace<'a> {
    pub photo_id: i64,
    pub embedding: &'a [f32],
    pub thumbnail_path: Option<&'a Path>,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone)]
pub struct Person {
    pub id: i64,
    pub name: String,
    pub face_count: i64,
    pub pending_confirmation: bool,
    pub avg_embedding: Option<Vec<f32>>,
}

const FACE_COLUMNS: &str = "id, photo_id, embedding, thumbnail_path, \
     location_top, location_right, location_bottom, location_left, person_id, status";

fn face_from_row(row: &rusqlite::Row) -> rusqlite::Result<Face> {
    let blob: Vec<u8> = row.get(2)?;
    let status: String = row.get(9)?;
    Ok(Face {
        id: row.get(0)?,
        photo_id: row.get(1)?,
        embedding: bytes_to_embedding(&blob),
        thumbnail_path: row.get::<_, Option<String>>(3)?.map(PathBuf::from),
        bbox: BoundingBox {
            top: row.get(4)?,
            right: row.get(5)?,
            bottom: row.get(6)?,
            left: row.get(7)?,
        },
        person_id: row.get(8)?,
        status: FaceStatus::from_str(&status).unwrap_or(FaceStatus::Unassigned),
    })
}

fn person_from_row(row: &rusqlite::Row) -> rusqlite::Result<Person> {
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        face_count: row.get(2)?,
        pending_confirmation: row.get(3)?,
        avg_embedding: row.get::<_, Option<Vec<u8>>>(4)?.map(|b| bytes_to_embedding(&b)),
    })
}

const PERSON_QUERY: &str = r#"
    SELECT p.id, p.name, COUNT(f.id) AS face_count, p.pending_confirmation, p.avg_embedding
    FROM people p
    LEFT JOIN faces f ON f.person_id = p.id
"#;

impl Database {
    // ========================================================================
    // Faces
    // ========================================================================

    pub fn insert_face(&self, face: &NewFace) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO faces (photo_id, embedding, thumbnail_path,
                               location_top, location_right, location_bottom, location_left,
                               status)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'unassigned')
            "#,
            params![
                face.photo_id,
                embedding_to_bytes(face.embedding),
                face.thumbnail_path.map(|p| p.to_string_lossy().into_owned()),
                face.bbox.top,
                face.bbox.right,
                face.bbox.bottom,
                face.bbox.left,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_face(&self, face_id: i64) -> Result<Option<Face>> {
        let face = self
            .conn
            .query_row(
                &format!("SELECT {FACE_COLUMNS} FROM faces WHERE id = ?"),
                [face_id],
                face_from_row,
            )
            .optional()?;
        Ok(face)
    }

    /// Faces for the given ids, in the order requested. Unknown ids are skipped.
    pub fn get_faces(&self, face_ids: &[i64]) -> Result<Vec<Face>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {FACE_COLUMNS} FROM faces WHERE id = ?"))?;
        let mut faces = Vec::with_capacity(face_ids.len());
        for &id in face_ids {
            if let Some(face) = stmt.query_row([id], face_from_row).optional()? {
                faces.push(face);
            }
        }
        Ok(faces)
    }

    pub fn get_faces_for_photo(&self, photo_id: i64) -> Result<Vec<Face>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FACE_COLUMNS} FROM faces WHERE photo_id = ? ORDER BY id"
        ))?;
        let faces = stmt
            .query_map([photo_id], face_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    pub fn get_unassigned_faces(&self) -> Result<Vec<Face>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FACE_COLUMNS} FROM faces WHERE status = 'unassigned' AND person_id IS NULL ORDER BY id"
        ))?;
        let faces = stmt
            .query_map([], face_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    /// `(face_id, embedding, capture year)` for every face assigned to a person.
    pub fn get_person_face_embeddings(&self, person_id: i64) -> Result<Vec<(i64, Vec<f32>, Option<i32>)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT f.id, f.embedding, p.year
            FROM faces f
            JOIN photos p ON p.id = f.photo_id
            WHERE f.person_id = ?
            ORDER BY f.id
            "#,
        )?;
        let faces = stmt
            .query_map([person_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    bytes_to_embedding(&row.get::<_, Vec<u8>>(1)?),
                    row.get::<_, Option<i32>>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    /// Point a face at a person (or at nobody) and set its status.
    pub fn set_face_assignment(&self, face_id: i64, person_id: Option<i64>, status: FaceStatus) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE faces SET person_id = ?, status = ? WHERE id = ?",
            params![person_id, status.as_str(), face_id],
        )?;
        Ok(updated > 0)
    }

    /// Distinct people that own at least one face of the photo.
    pub fn person_ids_for_photo(&self, photo_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT person_id FROM faces WHERE photo_id = ? AND person_id IS NOT NULL ORDER BY person_id",
        )?;
        let ids = stmt
            .query_map([photo_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn thumbnail_paths(&self) -> Result<Vec<PathBuf>> {
        let mut stmt = self
            .conn
            .prepare("SELECT thumbnail_path FROM faces WHERE thumbnail_path IS NOT NULL")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(paths.into_iter().map(PathBuf::from).collect())
    }

    pub fn count_faces(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(count)
    }

    // ========================================================================
    // People
    // ========================================================================

    pub fn create_person(&self, name: &str, pending_confirmation: bool) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO people (name, pending_confirmation) VALUES (?, ?)",
            params![name, pending_confirmation],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_person(&self, person_id: i64) -> Result<Option<Person>> {
        let person = self
            .conn
            .query_row(
                &format!("{PERSON_QUERY} WHERE p.id = ? GROUP BY p.id"),
                [person_id],
                person_from_row,
            )
            .optional()?;
        Ok(person)
    }

    /// Find a person by name (case-insensitive)
    pub fn find_person_by_name(&self, name: &str) -> Result<Option<Person>> {
        let person = self
            .conn
            .query_row(
                &format!("{PERSON_QUERY} WHERE LOWER(p.name) = LOWER(?) GROUP BY p.id ORDER BY p.id LIMIT 1"),
                [name],
                person_from_row,
            )
            .optional()?;
        Ok(person)
    }

    pub fn get_all_people(&self) -> Result<Vec<Person>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PERSON_QUERY} GROUP BY p.id ORDER BY p.name, p.id"))?;
        let people = stmt
            .query_map([], person_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(people)
    }

    /// Give a person a final name and clear the pending flag.
    pub fn confirm_person(&self, person_id: i64, name: &str) -> Result<bool> {
        let updated = self.conn.execute(
            r#"
            UPDATE people
            SET name = ?, pending_confirmation = 0, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![name, person_id],
        )?;
        Ok(updated > 0)
    }

    pub fn set_person_avg_embedding(&self, person_id: i64, embedding: Option<&[f32]>) -> Result<()> {
        self.conn.execute(
            "UPDATE people SET avg_embedding = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![embedding.map(embedding_to_bytes), person_id],
        )?;
        Ok(())
    }

    /// Remember that `person_id` was staged from cluster `label` of `job_id`.
    pub fn record_staged_cluster(&self, job_id: &str, label: &str, person_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO staged_clusters (job_id, label, person_id) VALUES (?, ?, ?)",
            params![job_id, label, person_id],
        )?;
        Ok(())
    }

    /// The person staged from cluster `label` of `job_id`, if it still exists.
    pub fn staged_cluster_person(&self, job_id: &str, label: &str) -> Result<Option<Person>> {
        let person = self
            .conn
            .query_row(
                &format!(
                    "{PERSON_QUERY} JOIN staged_clusters s ON s.person_id = p.id \
                     WHERE s.job_id = ? AND s.label = ? GROUP BY p.id"
                ),
                params![job_id, label],
                person_from_row,
            )
            .optional()?;
        Ok(person)
    }

    /// Delete a person. Their faces become unassigned, not deleted.
    pub fn delete_person(&self, person_id: i64) -> Result<bool> {
        self.conn.execute(
            "UPDATE faces SET person_id = NULL, status = 'unassigned' WHERE person_id = ?",
            [person_id],
        )?;
        let deleted = self.conn.execute("DELETE FROM people WHERE id = ?", [person_id])?;
        Ok(deleted > 0)
    }
}
