//! The batch work behind each job kind.

use anyhow::{bail, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::batch::BatchWork;
use super::JobResultData;
use crate::db::{Database, FaceStatus, PersonEmbedding};
use crate::faces::centroids::refresh_person_embeddings;
use crate::faces::clustering::{discover, Cluster};
use crate::faces::extractor::ExtractionResult;
use crate::faces::similarity::{matches, similarity};
use crate::faces::worker::{Extraction, WorkerProcess};
use crate::library::organize::{self, remove_empty_dirs, FileOperation};
use crate::library::{group_duplicates, remove_duplicate, Removal, RemovalAction};
use crate::scanner::{perceptual_hash, sha256_file};

/// Hash files and record them as imported photos.
pub struct ImportBatch;

impl BatchWork for ImportBatch {
    type Item = PathBuf;
    type Output = (PathBuf, String);

    fn process(&mut self, _db: &Database, path: &PathBuf) -> Option<Self::Output> {
        match sha256_file(path) {
            Ok(hash) => Some((path.clone(), hash)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "Could not hash file");
                None
            }
        }
    }

    fn persist(&mut self, db: &Database, job_id: &str, _task_id: &str, outputs: Vec<Self::Output>) -> Result<bool> {
        let mut added = 0;
        for (path, hash) in &outputs {
            if db.insert_imported_photo(path, hash)?.is_some() {
                added += 1;
            }
        }
        tracing::debug!(job_id, added, seen = outputs.len(), "Imported photos");
        Ok(true)
    }
}

/// Run the extractor over imported photos and store what it finds.
pub struct IndexBatch {
    extraction: Extraction,
    thumbnail_dir: PathBuf,
    item_timeout: Option<Duration>,
    worker: Option<WorkerProcess>,
}

impl IndexBatch {
    pub fn new(extraction: Extraction, thumbnail_dir: PathBuf, item_timeout: Option<Duration>) -> Self {
        Self {
            extraction,
            thumbnail_dir,
            item_timeout,
            worker: None,
        }
    }

    fn extract(&mut self, path: &Path) -> Option<ExtractionResult> {
        match &self.extraction {
            Extraction::InProcess(extractor) => extractor.extract(path, &self.thumbnail_dir),
            Extraction::Workers(pool) => {
                let worker = self.worker.get_or_insert_with(|| pool.checkout());
                match worker.extract(path, &self.thumbnail_dir, self.item_timeout) {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "Extraction failed");
                        None
                    }
                }
            }
        }
    }
}

impl Drop for IndexBatch {
    fn drop(&mut self) {
        if let (Some(worker), Extraction::Workers(pool)) = (self.worker.take(), &self.extraction) {
            pool.checkin(worker);
        }
    }
}

impl BatchWork for IndexBatch {
    type Item = (i64, PathBuf);
    type Output = (i64, ExtractionResult);

    fn process(&mut self, _db: &Database, (photo_id, path): &(i64, PathBuf)) -> Option<Self::Output> {
        self.extract(path).map(|result| (*photo_id, result))
    }

    fn persist(&mut self, db: &Database, _job_id: &str, _task_id: &str, outputs: Vec<Self::Output>) -> Result<bool> {
        // Re-indexing drops a photo's old faces, so their people need new centroids
        let mut affected = BTreeSet::new();
        for (photo_id, result) in &outputs {
            affected.extend(db.person_ids_for_photo(*photo_id)?);
            db.save_index_result(*photo_id, result)?;
        }
        for person_id in affected {
            refresh_person_embeddings(db, person_id)?;
        }
        Ok(true)
    }
}

/// Score candidate faces against one person and record the matches.
pub struct AutoAssignBatch {
    pub person_id: i64,
    pub similarity_threshold: f32,
    centroids: Vec<PersonEmbedding>,
    embeddings: HashMap<i64, Vec<f32>>,
}

impl AutoAssignBatch {
    pub fn new(person_id: i64, similarity_threshold: f32) -> Self {
        Self {
            person_id,
            similarity_threshold,
            centroids: Vec::new(),
            embeddings: HashMap::new(),
        }
    }
}

impl BatchWork for AutoAssignBatch {
    type Item = i64;
    type Output = (i64, Vec<f32>);

    fn prepare(&mut self, db: &Database, face_ids: &[i64]) -> Result<()> {
        if db.get_person(self.person_id)?.is_none() {
            bail!("Person {} not found", self.person_id);
        }
        self.centroids = db.get_person_embeddings(self.person_id)?;
        self.embeddings = db
            .get_faces(face_ids)?
            .into_iter()
            .filter(|f| f.status == FaceStatus::Unassigned)
            .map(|f| (f.id, f.embedding))
            .collect();
        Ok(())
    }

    /// Faces that vanished or were claimed since the job started count as
    /// errors.
    fn process(&mut self, _db: &Database, face_id: &i64) -> Option<Self::Output> {
        match self.embeddings.remove(face_id) {
            Some(embedding) => Some((*face_id, embedding)),
            None => {
                tracing::debug!(face_id, "Face no longer a candidate");
                None
            }
        }
    }

    fn persist(&mut self, db: &Database, job_id: &str, task_id: &str, outputs: Vec<Self::Output>) -> Result<bool> {
        let scores = similarity(&self.centroids, &outputs);
        let found = matches(&scores, self.similarity_threshold);
        tracing::debug!(job_id, candidates = outputs.len(), matches = found.len(), "Scored faces");
        Ok(db.insert_job_result(job_id, task_id, &JobResultData::Matches { matches: found })?)
    }
}

/// Cluster the unassigned faces of a discovery job. The whole face set is a
/// single item.
pub struct DiscoverBatch {
    pub distance_threshold: f32,
}

impl BatchWork for DiscoverBatch {
    type Item = Vec<i64>;
    type Output = Vec<Cluster>;

    fn process(&mut self, db: &Database, face_ids: &Vec<i64>) -> Option<Self::Output> {
        let faces = match db.get_faces(face_ids) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "Could not load faces for discovery");
                return None;
            }
        };
        let candidates: Vec<(i64, Vec<f32>)> = faces
            .into_iter()
            .filter(|f| f.status == FaceStatus::Unassigned)
            .map(|f| (f.id, f.embedding))
            .collect();
        Some(discover(&candidates, self.distance_threshold))
    }

    fn persist(&mut self, db: &Database, job_id: &str, task_id: &str, outputs: Vec<Self::Output>) -> Result<bool> {
        let clusters: Vec<Cluster> = outputs.into_iter().flatten().collect();
        tracing::info!(job_id, clusters = clusters.len(), "Discovery finished");
        Ok(db.insert_job_result(job_id, task_id, &JobResultData::Clusters { clusters })?)
    }
}

/// Perceptually hash every file of a duplicate search and record the groups.
/// Dispatched as one batch so every file is compared with every other.
pub struct FindDuplicatesBatch;

impl BatchWork for FindDuplicatesBatch {
    type Item = PathBuf;
    type Output = (PathBuf, String);

    fn process(&mut self, _db: &Database, path: &PathBuf) -> Option<Self::Output> {
        match perceptual_hash(path) {
            Ok(hash) => Some((path.clone(), hash)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "Could not hash image");
                None
            }
        }
    }

    fn persist(&mut self, db: &Database, job_id: &str, task_id: &str, outputs: Vec<Self::Output>) -> Result<bool> {
        let groups = group_duplicates(outputs);
        tracing::info!(job_id, groups = groups.len(), "Duplicate search finished");
        Ok(db.insert_job_result(job_id, task_id, &JobResultData::Duplicates { groups })?)
    }
}

/// Dispose of duplicate files and drop or repoint their photo rows.
pub struct RemoveDuplicatesBatch {
    pub action: RemovalAction,
    pub trash_dir: PathBuf,
}

impl BatchWork for RemoveDuplicatesBatch {
    type Item = PathBuf;
    type Output = (PathBuf, Removal);

    fn process(&mut self, _db: &Database, path: &PathBuf) -> Option<Self::Output> {
        match remove_duplicate(path, &self.action, &self.trash_dir) {
            Ok(removal) => Some((path.clone(), removal)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "Could not remove duplicate");
                None
            }
        }
    }

    fn persist(&mut self, db: &Database, job_id: &str, _task_id: &str, outputs: Vec<Self::Output>) -> Result<bool> {
        let mut affected = BTreeSet::new();
        for (path, removal) in &outputs {
            match removal {
                Removal::Moved(destination) => {
                    db.update_photo_path(path, destination)?;
                }
                Removal::Trashed(_) | Removal::Deleted => {
                    if let Some(photo) = db.get_photo_by_path(path)? {
                        affected.extend(db.person_ids_for_photo(photo.id)?);
                        db.delete_photo(photo.id)?;
                    }
                }
            }
        }
        for person_id in affected {
            refresh_person_embeddings(db, person_id)?;
        }
        tracing::debug!(job_id, removed = outputs.len(), "Removed duplicates");
        Ok(true)
    }
}

/// Copy or move photos into dated folders. Moves are recorded in the store
/// and leave no empty folders behind under `source_root`.
pub struct OrganizeBatch {
    pub source_root: PathBuf,
}

impl BatchWork for OrganizeBatch {
    type Item = FileOperation;
    /// The operation as carried out, with its final destination.
    type Output = FileOperation;

    fn process(&mut self, _db: &Database, operation: &FileOperation) -> Option<Self::Output> {
        match organize::execute(operation) {
            Ok(destination) => {
                if !operation.copy {
                    if let Some(parent) = operation.source.parent() {
                        remove_empty_dirs(parent, &self.source_root);
                    }
                }
                Some(FileOperation {
                    destination,
                    ..operation.clone()
                })
            }
            Err(e) => {
                tracing::warn!(path = %operation.source.display(), error = %format!("{e:#}"), "Could not organize file");
                None
            }
        }
    }

    fn persist(&mut self, db: &Database, job_id: &str, _task_id: &str, outputs: Vec<Self::Output>) -> Result<bool> {
        let mut moved = 0;
        for operation in outputs.iter().filter(|op| !op.copy) {
            if db.update_photo_path(&operation.source, &operation.destination)? {
                moved += 1;
            }
        }
        tracing::debug!(job_id, files = outputs.len(), moved, "Organized photos");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::TestDb;
    use crate::db::{BoundingBox, NewFace, PhotoStatus};
    use crate::faces::detector::test_support::StubFaceModel;
    use crate::jobs::batch::{run_batch, BatchOutcome};
    use crate::jobs::{new_task_id, JobData};
    use crate::library::{plan_organize, OrganizePattern};
    use image::{Rgb, RgbImage};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn job(db: &Database, data: JobData, task_count: u64) -> String {
        db.insert_job(&data, task_count).unwrap()
    }

    fn face(db: &Database, photo: &str, embedding: &[f32]) -> i64 {
        let photo_id = db
            .insert_imported_photo(Path::new(photo), photo)
            .unwrap()
            .unwrap();
        db.insert_face(&NewFace {
            photo_id,
            embedding,
            thumbnail_path: None,
            bbox: BoundingBox {
                top: 0,
                right: 4,
                bottom: 4,
                left: 0,
            },
        })
        .unwrap()
    }

    #[test]
    fn test_import_batch() {
        let t = TestDb::new();
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        std::fs::write(&a, b"a").unwrap();
        let missing = dir.path().join("missing.jpg");

        let job_id = job(&t.db, JobData::ImportPhotos { media_dirs: Vec::new() }, 3);
        let outcome = run_batch(&t.db, &job_id, &new_task_id(), vec![a.clone(), missing, a.clone()], ImportBatch, 5);

        assert_eq!(
            outcome,
            BatchOutcome::Committed {
                completed: 2,
                errors: 1,
                cancelled: 0
            }
        );
        let photo = t.db.get_photo_by_path(&a).unwrap().unwrap();
        assert_eq!(photo.status, PhotoStatus::Imported);
    }

    #[test]
    fn test_index_batch_reindex_refreshes_people() {
        let t = TestDb::new();
        let dir = tempdir().unwrap();
        let path = dir.path().join("IMG_20200101_000000.png");
        RgbImage::from_pixel(20, 20, Rgb([3, 4, 0])).save(&path).unwrap();
        let photo_id = t.db.insert_imported_photo(&path, "h").unwrap().unwrap();

        let work = || {
            IndexBatch::new(
                Extraction::in_process(Arc::new(StubFaceModel), 50),
                dir.path().join("faces"),
                None,
            )
        };

        let job_id = job(&t.db, JobData::IndexPhotos { thumbnail_dir: dir.path().to_path_buf() }, 2);
        run_batch(&t.db, &job_id, &new_task_id(), vec![(photo_id, path.clone())], work(), 5);

        let faces = t.db.get_faces_for_photo(photo_id).unwrap();
        assert_eq!(faces.len(), 1);
        let person = t.db.create_person("Erin", false).unwrap();
        crate::faces::people::assign_faces(&t.db, person, &[faces[0].id]).unwrap();
        assert_eq!(t.db.get_person_embeddings(person).unwrap().len(), 1);

        // Second pass replaces the face, leaving the person empty
        run_batch(&t.db, &job_id, &new_task_id(), vec![(photo_id, path)], work(), 5);
        assert!(t.db.get_person_embeddings(person).unwrap().is_empty());
        assert_eq!(t.db.get_person(person).unwrap().unwrap().avg_embedding, None);
        assert_eq!(t.db.get_photo(photo_id).unwrap().unwrap().year, Some(2020));
    }

    #[cfg(unix)]
    #[test]
    fn test_index_batch_hands_its_worker_back() {
        use crate::faces::worker::{WorkerCommand, WorkerPool};
        use std::ffi::OsString;

        let t = TestDb::new();
        let dir = tempdir().unwrap();
        let photo_id = t.db.insert_imported_photo(Path::new("/p/a.jpg"), "h").unwrap().unwrap();
        // Answers every request with "no result"
        let pool = Arc::new(WorkerPool::new(WorkerCommand {
            program: PathBuf::from("sh"),
            args: vec![
                OsString::from("-c"),
                OsString::from(r#"while read line; do echo '{"result":null}'; done"#),
            ],
        }));

        let job_id = job(&t.db, JobData::IndexPhotos { thumbnail_dir: dir.path().to_path_buf() }, 2);
        let work = IndexBatch::new(
            Extraction::Workers(Arc::clone(&pool)),
            dir.path().to_path_buf(),
            Some(Duration::from_secs(10)),
        );
        let items = vec![(photo_id, PathBuf::from("/p/a.jpg")), (photo_id, PathBuf::from("/p/a.jpg"))];
        let outcome = run_batch(&t.db, &job_id, &new_task_id(), items, work, 5);

        assert_eq!(
            outcome,
            BatchOutcome::Committed {
                completed: 0,
                errors: 2,
                cancelled: 0
            }
        );
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_auto_assign_batch_records_matches() {
        let t = TestDb::new();
        let anchor = face(&t.db, "/p/0.jpg", &[1.0, 0.0]);
        let close = face(&t.db, "/p/1.jpg", &[0.99, 0.05]);
        let far = face(&t.db, "/p/2.jpg", &[0.0, 1.0]);
        t.db.conn.execute("UPDATE photos SET year = 2021", []).unwrap();
        let person = t.db.create_person("Finn", false).unwrap();
        crate::faces::people::assign_faces(&t.db, person, &[anchor]).unwrap();
        assert_eq!(t.db.get_person_embeddings(person).unwrap().len(), 1);

        let data = JobData::AutoAssignFaces {
            person_id: person,
            person_name: "Finn".to_string(),
            similarity_threshold: 0.95,
            face_ids: vec![close, far, anchor],
        };
        let job_id = job(&t.db, data, 3);
        let outcome = run_batch(
            &t.db,
            &job_id,
            &new_task_id(),
            vec![close, far, anchor],
            AutoAssignBatch::new(person, 0.95),
            5,
        );
        // The anchor is already assigned, so it is not a candidate
        assert_eq!(
            outcome,
            BatchOutcome::Committed {
                completed: 2,
                errors: 1,
                cancelled: 0
            }
        );

        let rows = t.db.get_job_results(&job_id).unwrap();
        let JobResultData::Matches { matches } = rows[0].data().unwrap() else {
            panic!("expected matches");
        };
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].face_id, close);
    }

    #[test]
    fn test_auto_assign_for_missing_person_fails_batch() {
        let t = TestDb::new();
        let f = face(&t.db, "/p/0.jpg", &[1.0]);
        let data = JobData::AutoAssignFaces {
            person_id: 404,
            person_name: "Nobody".to_string(),
            similarity_threshold: 0.9,
            face_ids: vec![f],
        };
        let job_id = job(&t.db, data, 1);
        let outcome = run_batch(&t.db, &job_id, &new_task_id(), vec![f], AutoAssignBatch::new(404, 0.9), 5);
        assert_eq!(
            outcome,
            BatchOutcome::Committed {
                completed: 0,
                errors: 1,
                cancelled: 0
            }
        );
    }

    #[test]
    fn test_discover_batch() {
        let t = TestDb::new();
        let a = face(&t.db, "/p/a.jpg", &[0.0, 0.0]);
        let b = face(&t.db, "/p/b.jpg", &[0.2, 0.0]);
        let c = face(&t.db, "/p/c.jpg", &[0.0, 0.5]);
        let ids = vec![a, b, c];

        let data = JobData::DiscoverPeople {
            distance_threshold: 5.0,
            face_ids: ids.clone(),
        };
        let job_id = job(&t.db, data, 1);
        run_batch(
            &t.db,
            &job_id,
            &new_task_id(),
            vec![ids],
            DiscoverBatch {
                distance_threshold: 5.0,
            },
            5,
        );

        let rows = t.db.get_job_results(&job_id).unwrap();
        let JobResultData::Clusters { clusters } = rows[0].data().unwrap() else {
            panic!("expected clusters");
        };
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].face_ids, vec![a, b]);
        assert_eq!(clusters[0].label, "Cluster 0");
    }

    fn gradient(path: &Path, horizontal: bool) {
        RgbImage::from_fn(64, 64, |x, y| {
            let v = (if horizontal { x } else { y }) as u8 * 3;
            Rgb([v, v, v])
        })
        .save(path)
        .unwrap();
    }

    #[test]
    fn test_find_duplicates_batch_groups_lookalikes() {
        let t = TestDb::new();
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.png");
        let a_copy = dir.path().join("a (1).png");
        let b = dir.path().join("b.png");
        gradient(&a, true);
        std::fs::copy(&a, &a_copy).unwrap();
        gradient(&b, false);
        let files = vec![a.clone(), b, dir.path().join("gone.png"), a_copy.clone()];

        let data = JobData::FindDuplicates {
            directories: vec![dir.path().to_path_buf()],
        };
        let job_id = job(&t.db, data, files.len() as u64);
        let outcome = run_batch(&t.db, &job_id, &new_task_id(), files, FindDuplicatesBatch, 10);
        assert_eq!(
            outcome,
            BatchOutcome::Committed {
                completed: 3,
                errors: 1,
                cancelled: 0
            }
        );

        let rows = t.db.get_job_results(&job_id).unwrap();
        let JobResultData::Duplicates { groups } = rows[0].data().unwrap() else {
            panic!("expected duplicates");
        };
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].paths, vec![a, a_copy]);
    }

    #[test]
    fn test_remove_duplicates_batch_drops_photos_and_refreshes_people() {
        let t = TestDb::new();
        let dir = tempdir().unwrap();
        let trash = dir.path().join("trash");
        let keep = dir.path().join("keep.jpg");
        let dupe = dir.path().join("dupe.jpg");
        std::fs::write(&keep, b"x").unwrap();
        std::fs::write(&dupe, b"x").unwrap();

        let kept_face = face(&t.db, &keep.to_string_lossy(), &[1.0, 0.0]);
        let dupe_face = face(&t.db, &dupe.to_string_lossy(), &[0.0, 1.0]);
        let person = t.db.create_person("Gail", false).unwrap();
        crate::faces::people::assign_faces(&t.db, person, &[kept_face, dupe_face]).unwrap();
        let average = |db: &Database| db.get_person(person).unwrap().unwrap().avg_embedding;
        assert_eq!(average(&t.db), Some(vec![0.5, 0.5]));

        let missing = dir.path().join("missing.jpg");
        let data = JobData::RemoveDuplicates {
            paths: vec![dupe.clone(), missing.clone()],
            action: RemovalAction::Trash,
        };
        let job_id = job(&t.db, data, 2);
        let work = RemoveDuplicatesBatch {
            action: RemovalAction::Trash,
            trash_dir: trash.clone(),
        };
        let outcome = run_batch(&t.db, &job_id, &new_task_id(), vec![dupe.clone(), missing], work, 10);
        assert_eq!(
            outcome,
            BatchOutcome::Committed {
                completed: 1,
                errors: 1,
                cancelled: 0
            }
        );

        assert!(!dupe.exists());
        assert_eq!(std::fs::read_dir(&trash).unwrap().count(), 1);
        assert!(t.db.get_photo_by_path(&dupe).unwrap().is_none());
        assert!(t.db.get_photo_by_path(&keep).unwrap().is_some());
        assert_eq!(average(&t.db), Some(vec![1.0, 0.0]));
    }

    #[test]
    fn test_remove_duplicates_move_repoints_photo() {
        let t = TestDb::new();
        let dir = tempdir().unwrap();
        let dupe = dir.path().join("dupe.jpg");
        std::fs::write(&dupe, b"x").unwrap();
        let photo_id = t.db.insert_imported_photo(&dupe, "h").unwrap().unwrap();
        let folder = dir.path().join("duplicates");
        let action = RemovalAction::MoveTo { folder: folder.clone() };

        let data = JobData::RemoveDuplicates {
            paths: vec![dupe.clone()],
            action: action.clone(),
        };
        let job_id = job(&t.db, data, 1);
        let work = RemoveDuplicatesBatch {
            action,
            trash_dir: dir.path().join("trash"),
        };
        run_batch(&t.db, &job_id, &new_task_id(), vec![dupe], work, 10);

        let photo = t.db.get_photo(photo_id).unwrap().unwrap();
        assert_eq!(photo.path, folder.join("dupe.jpg"));
        assert!(photo.path.exists());
    }

    #[test]
    fn test_organize_batch_moves_files_and_records_paths() {
        let t = TestDb::new();
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let old = root.join("old");
        std::fs::create_dir_all(&old).unwrap();
        let source = old.join("IMG_20190704_120000.jpg");
        std::fs::write(&source, b"x").unwrap();
        let photo_id = t.db.insert_imported_photo(&source, "h").unwrap().unwrap();

        let plan = plan_organize(&[source.clone()], &root, OrganizePattern::YearMonth, false);
        assert_eq!(plan.len(), 1);
        let data = JobData::OrganizePhotos {
            source_dir: root.clone(),
            destination_dir: root.clone(),
            pattern: OrganizePattern::YearMonth,
            keep_original: false,
        };
        let job_id = job(&t.db, data, 1);
        let outcome = run_batch(
            &t.db,
            &job_id,
            &new_task_id(),
            plan,
            OrganizeBatch {
                source_root: root.clone(),
            },
            10,
        );
        assert_eq!(
            outcome,
            BatchOutcome::Committed {
                completed: 1,
                errors: 0,
                cancelled: 0
            }
        );

        let target = root.join("2019/July/IMG_20190704_120000.jpg");
        assert!(target.exists());
        assert!(!old.exists());
        assert_eq!(t.db.get_photo(photo_id).unwrap().unwrap().path, target);
    }

    #[test]
    fn test_organize_batch_copy_keeps_photo_path() {
        let t = TestDb::new();
        let dir = tempdir().unwrap();
        let source = dir.path().join("IMG_20190704_120000.jpg");
        std::fs::write(&source, b"x").unwrap();
        let photo_id = t.db.insert_imported_photo(&source, "h").unwrap().unwrap();
        let out = dir.path().join("sorted");

        let plan = plan_organize(&[source.clone()], &out, OrganizePattern::Year, true);
        let data = JobData::OrganizePhotos {
            source_dir: dir.path().to_path_buf(),
            destination_dir: out.clone(),
            pattern: OrganizePattern::Year,
            keep_original: true,
        };
        let job_id = job(&t.db, data, 1);
        run_batch(
            &t.db,
            &job_id,
            &new_task_id(),
            plan,
            OrganizeBatch {
                source_root: dir.path().to_path_buf(),
            },
            10,
        );

        assert!(source.exists());
        assert!(out.join("2019/IMG_20190704_120000.jpg").exists());
        assert_eq!(t.db.get_photo(photo_id).unwrap().unwrap().path, source);
    }
}
