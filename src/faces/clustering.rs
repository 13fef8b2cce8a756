//! Grouping unassigned faces into candidate people.
//!
//! DBSCAN over Euclidean distance. A point's neighbourhood excludes the point
//! itself, so with `min_samples = 1` a face needs at least one other face
//! within `eps` to seed or join a cluster; isolated faces are noise and are
//! dropped from the output.

use serde::{Deserialize, Serialize};

/// Scaling from the user-facing distance threshold to the DBSCAN radius.
const EPS_SCALE: f32 = 0.45 * 0.1;

pub const MIN_SAMPLES: usize = 1;

/// A group of faces that look like the same person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub label: String,
    pub face_ids: Vec<i64>,
}

/// DBSCAN radius for a distance threshold.
pub fn eps_for(distance_threshold: f32) -> f32 {
    distance_threshold * EPS_SCALE
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

fn neighbours(points: &[&[f32]], idx: usize, eps: f32) -> Vec<usize> {
    points
        .iter()
        .enumerate()
        .filter(|&(i, other)| i != idx && euclidean_distance(points[idx], other) <= eps)
        .map(|(i, _)| i)
        .collect()
}

/// Label every point with its cluster index, or `None` for noise.
///
/// Clusters are numbered in the order their first core point is met.
pub fn dbscan(points: &[&[f32]], eps: f32, min_samples: usize) -> Vec<Option<usize>> {
    let mut labels: Vec<Option<usize>> = vec![None; points.len()];
    let mut visited = vec![false; points.len()];
    let mut next_label = 0;

    for i in 0..points.len() {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let seeds = neighbours(points, i, eps);
        if seeds.len() < min_samples.max(1) {
            continue;
        }

        let label = next_label;
        next_label += 1;
        labels[i] = Some(label);

        let mut queue = seeds;
        let mut j = 0;
        while j < queue.len() {
            let n = queue[j];
            j += 1;

            // Border points previously marked noise get claimed here.
            if labels[n].is_none() {
                labels[n] = Some(label);
            }
            if visited[n] {
                continue;
            }
            visited[n] = true;

            let expansion = neighbours(points, n, eps);
            if expansion.len() >= min_samples.max(1) {
                queue.extend(expansion);
            }
        }
    }

    labels
}

/// Cluster faces and return the non-noise groups, labelled `Cluster 0`,
/// `Cluster 1`, ... in discovery order.
pub fn discover(faces: &[(i64, Vec<f32>)], distance_threshold: f32) -> Vec<Cluster> {
    let points: Vec<&[f32]> = faces.iter().map(|(_, e)| e.as_slice()).collect();
    let labels = dbscan(&points, eps_for(distance_threshold), MIN_SAMPLES);

    let mut groups: Vec<Vec<i64>> = Vec::new();
    for ((face_id, _), label) in faces.iter().zip(labels) {
        if let Some(label) = label {
            if groups.len() <= label {
                groups.resize_with(label + 1, Vec::new);
            }
            groups[label].push(*face_id);
        }
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(n, face_ids)| Cluster {
            label: format!("Cluster {n}"),
            face_ids,
        })
        .collect()
}
