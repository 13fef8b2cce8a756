//! Embedding blobs and the per-person, per-year centroid table.

use anyhow::{Context, Result};
use rusqlite::params;

use super::Database;

/// A stored centroid for one person and one capture year.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonEmbedding {
    pub person_id: i64,
    pub year: i32,
    pub centroid: Vec<f32>,
    pub included_face_ids: Vec<i64>,
}

impl Database {
    /// Insert or replace the centroid for `(person_id, year)`.
    pub fn upsert_person_embedding(
        &self,
        person_id: i64,
        year: i32,
        centroid: &[f32],
        included_face_ids: &[i64],
    ) -> Result<()> {
        let face_ids_json = serde_json::to_string(included_face_ids)?;
        self.conn.execute(
            r#"
            INSERT INTO people_embeddings (person_id, year, centroid_blob, included_face_ids)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(person_id, year) DO UPDATE SET
                centroid_blob = excluded.centroid_blob,
                included_face_ids = excluded.included_face_ids,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![person_id, year, embedding_to_bytes(centroid), face_ids_json],
        )?;
        Ok(())
    }

    /// All centroids for a person, ordered by year.
    pub fn get_person_embeddings(&self, person_id: i64) -> Result<Vec<PersonEmbedding>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT year, centroid_blob, included_face_ids
            FROM people_embeddings
            WHERE person_id = ?
            ORDER BY year
            "#,
        )?;

        let rows = stmt
            .query_map([person_id], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(year, blob, face_ids)| {
                let included_face_ids: Vec<i64> = serde_json::from_str(&face_ids)
                    .with_context(|| format!("Corrupt face id list for person {person_id}, year {year}"))?;
                Ok(PersonEmbedding {
                    person_id,
                    year,
                    centroid: bytes_to_embedding(&blob),
                    included_face_ids,
                })
            })
            .collect()
    }

    /// Drop every centroid row for `person_id` whose year is not in `keep_years`.
    pub fn delete_person_embeddings_except(&self, person_id: i64, keep_years: &[i32]) -> Result<usize> {
        let stored: Vec<i32> = {
            let mut stmt = self
                .conn
                .prepare("SELECT year FROM people_embeddings WHERE person_id = ?")?;
            let years = stmt
                .query_map([person_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i32>>>()?;
            years
        };

        let mut removed = 0;
        for year in stored.into_iter().filter(|y| !keep_years.contains(y)) {
            removed += self.conn.execute(
                "DELETE FROM people_embeddings WHERE person_id = ? AND year = ?",
                params![person_id, year],
            )?;
        }
        Ok(removed)
    }
}

/// Encode a vector as little-endian f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes. Trailing bytes that do not form a full
/// value are ignored.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::TestDb;

    #[test]
    fn test_embedding_conversion() {
        let original = vec![1.5, -2.3, 0.0, 100.0];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes_to_embedding(&bytes), original);
    }

    #[test]
    fn test_truncated_blob_drops_partial_value() {
        let mut bytes = embedding_to_bytes(&[1.0, 2.0]);
        bytes.push(0xff);
        assert_eq!(bytes_to_embedding(&bytes), vec![1.0, 2.0]);
    }

    #[test]
    fn test_person_embedding_upsert_and_prune() {
        let t = TestDb::new();
        let person = t.db.create_person("Grace", false).unwrap();

        t.db.upsert_person_embedding(person, 2020, &[1.0, 0.0], &[1, 2]).unwrap();
        t.db.upsert_person_embedding(person, 2022, &[0.0, 1.0], &[3]).unwrap();
        t.db.upsert_person_embedding(person, 2020, &[0.5, 0.5], &[1]).unwrap();

        let stored = t.db.get_person_embeddings(person).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].year, 2020);
        assert_eq!(stored[0].centroid, vec![0.5, 0.5]);
        assert_eq!(stored[0].included_face_ids, vec![1]);

        let removed = t.db.delete_person_embeddings_except(person, &[2022]).unwrap();
        assert_eq!(removed, 1);
        let stored = t.db.get_person_embeddings(person).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].year, 2022);
    }
}
