//! Changes to face membership, and the consumers of auto-assign and
//! discovery job results.
//!
//! Every operation runs in one IMMEDIATE transaction and recomputes the
//! centroids of each person whose faces changed before committing.

use anyhow::{anyhow, bail, Result};
use std::collections::BTreeSet;

use super::centroids::refresh_person_embeddings;
use super::clustering::Cluster;
use super::similarity::rank_people;
use crate::db::{Database, Face, FaceStatus, Person};
use crate::jobs::{JobData, JobResultData};

fn refresh_all(db: &Database, people: &BTreeSet<i64>) -> Result<()> {
    for &person_id in people {
        if db.get_person(person_id)?.is_some() {
            refresh_person_embeddings(db, person_id)?;
        }
    }
    Ok(())
}

/// Point `faces` at `person_id` (or at nobody) and collect everyone affected.
fn reassign(
    db: &Database,
    faces: &[Face],
    person_id: Option<i64>,
    status: FaceStatus,
) -> Result<(usize, BTreeSet<i64>)> {
    let mut affected: BTreeSet<i64> = person_id.into_iter().collect();
    let mut changed = 0;
    for face in faces {
        if face.person_id == person_id && face.status == status {
            continue;
        }
        affected.extend(face.person_id);
        if db.set_face_assignment(face.id, person_id, status)? {
            changed += 1;
        }
    }
    Ok((changed, affected))
}

pub fn create_person(db: &Database, name: &str) -> Result<i64> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Person name must not be empty");
    }
    let id = db.create_person(name, false)?;
    tracing::info!(person_id = id, name, "Created person");
    Ok(id)
}

/// Assign faces to a person, moving them away from anyone they belonged to.
pub fn assign_faces(db: &Database, person_id: i64, face_ids: &[i64]) -> Result<usize> {
    db.immediate(|db| {
        if db.get_person(person_id)?.is_none() {
            bail!("Person {person_id} not found");
        }
        let faces = db.get_faces(face_ids)?;
        let (changed, affected) = reassign(db, &faces, Some(person_id), FaceStatus::Assigned)?;
        refresh_all(db, &affected)?;
        Ok(changed)
    })
}

pub fn unassign_faces(db: &Database, face_ids: &[i64]) -> Result<usize> {
    db.immediate(|db| {
        let faces = db.get_faces(face_ids)?;
        let (changed, affected) = reassign(db, &faces, None, FaceStatus::Unassigned)?;
        refresh_all(db, &affected)?;
        Ok(changed)
    })
}

/// Mark faces as not worth assigning. Ignored faces are left out of
/// auto-assign and discovery.
pub fn ignore_faces(db: &Database, face_ids: &[i64]) -> Result<usize> {
    db.immediate(|db| {
        let faces = db.get_faces(face_ids)?;
        let (changed, affected) = reassign(db, &faces, None, FaceStatus::Ignored)?;
        refresh_all(db, &affected)?;
        Ok(changed)
    })
}

/// Delete a person. Their faces go back to unassigned and their centroids
/// are dropped with them.
pub fn delete_person(db: &Database, person_id: i64) -> Result<bool> {
    db.immediate(|db| {
        let deleted = db.delete_person(person_id)?;
        if deleted {
            tracing::info!(person_id, "Deleted person");
        }
        Ok(deleted)
    })
}

/// Give a pending person their real name.
pub fn confirm_person(db: &Database, person_id: i64, name: &str) -> Result<bool> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Person name must not be empty");
    }
    Ok(db.confirm_person(person_id, name)?)
}

/// The confirmed people a face most resembles, best first, with their cosine
/// similarity to the face.
pub fn suggest_people(db: &Database, face_id: i64, limit: usize) -> Result<Vec<(Person, f32)>> {
    let face = db.get_face(face_id)?.ok_or_else(|| anyhow!("Face {face_id} not found"))?;
    let people: Vec<Person> = db
        .get_all_people()?
        .into_iter()
        .filter(|p| !p.pending_confirmation && face.person_id != Some(p.id))
        .collect();
    let averages: Vec<(i64, Vec<f32>)> = people
        .iter()
        .filter_map(|p| p.avg_embedding.clone().map(|avg| (p.id, avg)))
        .collect();

    Ok(rank_people(&face.embedding, &averages)
        .into_iter()
        .take(limit)
        .filter_map(|(id, score)| people.iter().find(|p| p.id == id).map(|p| (p.clone(), score)))
        .collect())
}

fn job_data(db: &Database, job_id: &str) -> Result<JobData> {
    let job = db
        .get_job(job_id)?
        .ok_or_else(|| anyhow!("Job {job_id} not found"))?;
    Ok(job.data()?)
}

fn still_unassigned(db: &Database, face_ids: &[i64]) -> Result<Vec<Face>> {
    Ok(db
        .get_faces(face_ids)?
        .into_iter()
        .filter(|f| f.status == FaceStatus::Unassigned)
        .collect())
}

/// Assign every matched face of an auto-assign job to its target person.
///
/// Faces that were assigned or ignored since the job ran are left alone.
pub fn apply_auto_assign_results(db: &Database, job_id: &str) -> Result<usize> {
    let JobData::AutoAssignFaces { person_id, .. } = job_data(db, job_id)? else {
        bail!("Job {job_id} is not an auto-assign job");
    };

    let mut face_ids = Vec::new();
    for row in db.get_job_results(job_id)? {
        if let JobResultData::Matches { matches } = row.data()? {
            face_ids.extend(matches.into_iter().map(|m| m.face_id));
        }
    }

    db.immediate(|db| {
        if db.get_person(person_id)?.is_none() {
            bail!("Person {person_id} no longer exists");
        }
        let faces = still_unassigned(db, &face_ids)?;
        let (changed, affected) = reassign(db, &faces, Some(person_id), FaceStatus::Assigned)?;
        refresh_all(db, &affected)?;
        tracing::info!(job_id, person_id, assigned = changed, "Applied auto-assign results");
        Ok(changed)
    })
}

fn job_clusters(db: &Database, job_id: &str) -> Result<Vec<Cluster>> {
    if !matches!(job_data(db, job_id)?, JobData::DiscoverPeople { .. }) {
        bail!("Job {job_id} is not a discovery job");
    }
    let mut clusters = Vec::new();
    for row in db.get_job_results(job_id)? {
        if let JobResultData::Clusters { clusters: found } = row.data()? {
            clusters.extend(found);
        }
    }
    Ok(clusters)
}

/// Turn every cluster of a discovery job into a person pending confirmation,
/// named after the cluster label. Clusters whose faces have all been claimed
/// in the meantime are skipped, as are clusters already staged.
pub fn stage_clusters(db: &Database, job_id: &str) -> Result<Vec<i64>> {
    let clusters = job_clusters(db, job_id)?;
    db.immediate(|db| {
        let mut staged = Vec::new();
        for cluster in &clusters {
            if db.staged_cluster_person(job_id, &cluster.label)?.is_some() {
                continue;
            }
            let faces = still_unassigned(db, &cluster.face_ids)?;
            if faces.is_empty() {
                continue;
            }
            let person_id = db.create_person(&cluster.label, true)?;
            db.record_staged_cluster(job_id, &cluster.label, person_id)?;
            let (_, affected) = reassign(db, &faces, Some(person_id), FaceStatus::Assigned)?;
            refresh_all(db, &affected)?;
            staged.push(person_id);
        }
        tracing::info!(job_id, people = staged.len(), "Staged discovered clusters");
        Ok(staged)
    })
}

/// Name a discovered cluster.
///
/// A pending person staged from this job's cluster is confirmed under `name`.
/// Otherwise the cluster's unassigned faces go to the person called `name`,
/// who is created if needed.
pub fn confirm_cluster(db: &Database, job_id: &str, label: &str, name: &str) -> Result<i64> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Person name must not be empty");
    }
    let cluster = job_clusters(db, job_id)?
        .into_iter()
        .find(|c| c.label == label)
        .ok_or_else(|| anyhow!("Job {job_id} has no cluster {label:?}"))?;

    db.immediate(|db| {
        if let Some(staged) = db.staged_cluster_person(job_id, label)? {
            if staged.pending_confirmation {
                db.confirm_person(staged.id, name)?;
                return Ok(staged.id);
            }
        }

        let person_id = match db.find_person_by_name(name)? {
            Some(person) => person.id,
            None => db.create_person(name, false)?,
        };
        let faces = still_unassigned(db, &cluster.face_ids)?;
        let (changed, affected) = reassign(db, &faces, Some(person_id), FaceStatus::Assigned)?;
        refresh_all(db, &affected)?;
        tracing::info!(job_id, label, person_id, assigned = changed, "Confirmed cluster");
        Ok(person_id)
    })
}
