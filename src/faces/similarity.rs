//! Scoring faces against a person's centroids.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::centroids::mean_embedding;
use crate::db::PersonEmbedding;

/// A face whose score against a person reached the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub face_id: i64,
    pub similarity: f32,
}

/// Cosine similarity in `[-1, 1]`; 0 for empty, mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Score every candidate face against a person.
///
/// A face's score is its best cosine similarity over the person's per-year
/// centroids. A person with no centroids yet is represented by the mean of the
/// candidates themselves.
pub fn similarity(centroids: &[PersonEmbedding], faces: &[(i64, Vec<f32>)]) -> HashMap<i64, f32> {
    let fallback;
    let references: Vec<&[f32]> = if centroids.is_empty() {
        fallback = mean_embedding(faces.iter().map(|(_, e)| e.as_slice()));
        fallback.as_deref().into_iter().collect()
    } else {
        centroids.iter().map(|c| c.centroid.as_slice()).collect()
    };

    faces
        .iter()
        .map(|(face_id, embedding)| {
            let best = references
                .iter()
                .map(|reference| cosine_similarity(embedding, reference))
                .fold(f32::NEG_INFINITY, f32::max);
            let score = if best.is_finite() { best } else { 0.0 };
            (*face_id, score)
        })
        .collect()
}

/// Faces scoring at or above `threshold`, best first.
pub fn matches(scores: &HashMap<i64, f32>, threshold: f32) -> Vec<FaceMatch> {
    let mut matched: Vec<FaceMatch> = scores
        .iter()
        .filter(|(_, score)| **score >= threshold)
        .map(|(&face_id, &similarity)| FaceMatch { face_id, similarity })
        .collect();
    matched.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then(a.face_id.cmp(&b.face_id))
    });
    matched
}

/// Rank people for a single face by their average embedding, best first.
/// People without an average embedding are skipped.
pub fn rank_people(face_embedding: &[f32], people: &[(i64, Vec<f32>)]) -> Vec<(i64, f32)> {
    let mut ranked: Vec<(i64, f32)> = people
        .iter()
        .filter(|(_, avg)| !avg.is_empty())
        .map(|(id, avg)| (*id, cosine_similarity(face_embedding, avg)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn centroid(year: i32, v: Vec<f32>) -> PersonEmbedding {
        PersonEmbedding {
            person_id: 1,
            year,
            centroid: v,
            included_face_ids: vec![],
        }
    }

    /// Unit vector at `cos = target` to the x axis, in the xy plane.
    fn at_cosine(target: f32) -> Vec<f32> {
        vec![target, (1.0 - target * target).sqrt(), 0.0]
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.0001);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 0.0001);
        assert!((cosine_similarity(&a, &[-1.0, 0.0, 0.0]) + 1.0).abs() < 0.0001);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_best_year_wins() {
        let c1 = vec![1.0, 0.0, 0.0];
        // c2 sits at cos 0.80 from the face, on the other side of it from c1
        let face = at_cosine(0.97);
        let angle_face = 0.97f32.acos();
        let angle_c2 = angle_face + 0.80f32.acos();
        let c2 = vec![angle_c2.cos(), angle_c2.sin(), 0.0];

        let scores = similarity(&[centroid(2020, c1), centroid(2022, c2)], &[(42, face)]);
        assert!((scores[&42] - 0.97).abs() < 1e-4);
    }

    #[test]
    fn test_bootstrap_uses_candidate_mean() {
        let faces = vec![(1, vec![1.0, 0.0]), (2, vec![0.0, 1.0])];
        let scores = similarity(&[], &faces);
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((scores[&1] - expected).abs() < 1e-5);
        assert!((scores[&2] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_no_candidates_no_scores() {
        assert!(similarity(&[], &[]).is_empty());
    }

    #[test]
    fn test_matches_threshold_is_inclusive() {
        let scores = HashMap::from([(1, 0.95), (2, 0.949), (3, 0.99)]);
        let matched = matches(&scores, 0.95);
        assert_eq!(
            matched.iter().map(|m| m.face_id).collect::<Vec<_>>(),
            vec![3, 1]
        );
    }

    #[test]
    fn test_rank_people() {
        let people = vec![
            (1, vec![0.0, 1.0]),
            (2, vec![1.0, 0.0]),
            (3, vec![]),
        ];
        let ranked = rank_people(&[1.0, 0.1], &people);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, 2);
    }
}
