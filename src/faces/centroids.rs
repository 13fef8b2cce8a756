//! Per-person centroid maintenance.
//!
//! A person keeps an overall average embedding plus one centroid per capture
//! year. Faces whose photo has no year count toward the overall average only.

use anyhow::Result;
use ndarray::{Array2, Axis};
use std::collections::BTreeMap;

use crate::db::Database;

/// One of a person's faces, as seen by the centroid computation.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSample {
    pub face_id: i64,
    pub year: Option<i32>,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YearCentroid {
    pub centroid: Vec<f32>,
    pub face_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersonCentroids {
    pub overall: Option<Vec<f32>>,
    pub by_year: BTreeMap<i32, YearCentroid>,
}

/// Arithmetic mean of equal-length vectors.
///
/// `None` for no input, zero-length vectors or mixed lengths.
pub fn mean_embedding<'a>(embeddings: impl IntoIterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let rows: Vec<&[f32]> = embeddings.into_iter().collect();
    let dim = rows.first()?.len();
    if dim == 0 || rows.iter().any(|r| r.len() != dim) {
        return None;
    }

    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    let matrix = Array2::from_shape_vec((rows.len(), dim), flat).ok()?;
    matrix.mean_axis(Axis(0)).map(|mean| mean.to_vec())
}

/// Compute overall and per-year centroids. Input order does not matter.
pub fn compute_centroids(samples: &[FaceSample]) -> PersonCentroids {
    let mut samples: Vec<&FaceSample> = samples.iter().filter(|s| !s.embedding.is_empty()).collect();
    samples.sort_by_key(|s| s.face_id);

    let overall = mean_embedding(samples.iter().map(|s| s.embedding.as_slice()));

    let mut grouped: BTreeMap<i32, Vec<&FaceSample>> = BTreeMap::new();
    for sample in &samples {
        if let Some(year) = sample.year {
            grouped.entry(year).or_default().push(sample);
        }
    }

    let by_year = grouped
        .into_iter()
        .filter_map(|(year, members)| {
            let centroid = mean_embedding(members.iter().map(|s| s.embedding.as_slice()))?;
            let face_ids = members.iter().map(|s| s.face_id).collect();
            Some((year, YearCentroid { centroid, face_ids }))
        })
        .collect();

    PersonCentroids { overall, by_year }
}

/// Recompute and store a person's centroids on the current connection.
///
/// Callers are expected to hold a write transaction; see
/// [`update_person_embeddings`].
pub fn refresh_person_embeddings(db: &Database, person_id: i64) -> Result<PersonCentroids> {
    let samples: Vec<FaceSample> = db
        .get_person_face_embeddings(person_id)?
        .into_iter()
        .map(|(face_id, embedding, year)| FaceSample {
            face_id,
            year,
            embedding,
        })
        .collect();

    let centroids = compute_centroids(&samples);

    db.set_person_avg_embedding(person_id, centroids.overall.as_deref())?;
    for (&year, entry) in &centroids.by_year {
        db.upsert_person_embedding(person_id, year, &entry.centroid, &entry.face_ids)?;
    }
    let years: Vec<i32> = centroids.by_year.keys().copied().collect();
    db.delete_person_embeddings_except(person_id, &years)?;

    tracing::debug!(
        person_id,
        faces = samples.len(),
        years = years.len(),
        "Recomputed person centroids"
    );

    Ok(centroids)
}

/// Recompute a person's centroids in their own IMMEDIATE transaction, so
/// concurrent recomputations for the same person run one after the other.
pub fn update_person_embeddings(db: &Database, person_id: i64) -> Result<PersonCentroids> {
    db.immediate(|db| refresh_person_embeddings(db, person_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::TestDb;
    use crate::db::{BoundingBox, FaceStatus, NewFace};
    use std::path::Path;

    fn sample(face_id: i64, year: Option<i32>, embedding: Vec<f32>) -> FaceSample {
        FaceSample {
            face_id,
            year,
            embedding,
        }
    }

    #[test]
    fn test_mean_embedding() {
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        assert_eq!(mean_embedding([&a[..], &b[..]]), Some(vec![2.0, 3.0]));
        assert_eq!(mean_embedding(std::iter::empty()), None);
        assert_eq!(mean_embedding([&a[..], &[1.0f32][..]]), None);
    }

    #[test]
    fn test_yearless_faces_only_affect_overall() {
        let centroids = compute_centroids(&[
            sample(3, Some(2020), vec![1.0, 0.0]),
            sample(1, Some(2020), vec![0.0, 1.0]),
            sample(2, None, vec![1.0, 1.0]),
            sample(4, Some(2022), vec![2.0, 2.0]),
        ]);

        assert_eq!(centroids.overall, Some(vec![1.0, 1.0]));
        assert_eq!(centroids.by_year.len(), 2);
        let y2020 = &centroids.by_year[&2020];
        assert_eq!(y2020.centroid, vec![0.5, 0.5]);
        assert_eq!(y2020.face_ids, vec![1, 3]);
        assert_eq!(centroids.by_year[&2022].face_ids, vec![4]);
    }

    #[test]
    fn test_compute_is_order_independent() {
        let a = compute_centroids(&[
            sample(1, Some(2020), vec![0.1, 0.7]),
            sample(2, Some(2020), vec![0.3, 0.2]),
            sample(3, Some(2020), vec![0.9, 0.4]),
        ]);
        let b = compute_centroids(&[
            sample(3, Some(2020), vec![0.9, 0.4]),
            sample(1, Some(2020), vec![0.1, 0.7]),
            sample(2, Some(2020), vec![0.3, 0.2]),
        ]);
        assert_eq!(a, b);
    }

    fn setup_person(t: &TestDb) -> (i64, Vec<i64>) {
        let db = &t.db;
        let person = db.create_person("Ada", false).unwrap();
        let mut face_ids = Vec::new();
        for (name, year, embedding) in [
            ("2019_a.jpg", Some(2019), [1.0f32, 0.0]),
            ("2019_b.jpg", Some(2019), [0.0f32, 1.0]),
            ("undated.jpg", None, [1.0f32, 1.0]),
        ] {
            let photo = db
                .insert_imported_photo(Path::new(name), "h")
                .unwrap()
                .unwrap();
            db.conn
                .execute("UPDATE photos SET year = ? WHERE id = ?", rusqlite::params![year, photo])
                .unwrap();
            let face = db
                .insert_face(&NewFace {
                    photo_id: photo,
                    embedding: &embedding,
                    thumbnail_path: None,
                    bbox: BoundingBox {
                        top: 0,
                        right: 1,
                        bottom: 1,
                        left: 0,
                    },
                })
                .unwrap();
            db.set_face_assignment(face, Some(person), FaceStatus::Assigned)
                .unwrap();
            face_ids.push(face);
        }
        (person, face_ids)
    }

    #[test]
    fn test_update_is_idempotent() {
        let t = TestDb::new();
        let (person, _) = setup_person(&t);

        update_person_embeddings(&t.db, person).unwrap();
        let first = t.db.get_person_embeddings(person).unwrap();
        let first_avg = t.db.get_person(person).unwrap().unwrap().avg_embedding;

        update_person_embeddings(&t.db, person).unwrap();
        let second = t.db.get_person_embeddings(person).unwrap();
        let second_avg = t.db.get_person(person).unwrap().unwrap().avg_embedding;

        assert_eq!(first, second);
        assert_eq!(first_avg, second_avg);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].centroid, vec![0.5, 0.5]);
        let avg = first_avg.unwrap();
        assert!((avg[0] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_update_drops_emptied_years() {
        let t = TestDb::new();
        let (person, faces) = setup_person(&t);
        update_person_embeddings(&t.db, person).unwrap();

        for &face in &faces[..2] {
            t.db.set_face_assignment(face, None, FaceStatus::Unassigned)
                .unwrap();
        }
        let centroids = update_person_embeddings(&t.db, person).unwrap();

        assert!(centroids.by_year.is_empty());
        assert!(t.db.get_person_embeddings(person).unwrap().is_empty());
        assert_eq!(centroids.overall, Some(vec![1.0, 1.0]));
    }
}
