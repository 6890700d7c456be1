use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Order an unordered id pair so the smaller id comes first. Every persisted
/// pair (submission or student) goes through this before hitting a
/// canonical-order unique constraint.
pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// One deduplicated pairwise similarity measurement, joined with the student
/// ids behind both submissions. Canonical form: `submission_id_1 <
/// submission_id_2`.
#[derive(Debug, Clone)]
pub struct SimilarityFact {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub submission_id_1: Uuid,
    pub submission_id_2: Uuid,
    pub student_id_1: Uuid,
    pub student_id_2: Uuid,
    pub percentage: f64,
    pub match_id: i64,
}

/// Global statistics for one assignment. Only the most recent report per
/// assignment survives a recomputation.
#[derive(Debug, Clone)]
pub struct AssignmentReport {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub mu: f64,
    pub sigma: f64,
    pub variance: f64,
    pub created_at: DateTime<Utc>,
}

/// Per-student slice of a semester scope, as read back for profile building.
#[derive(Debug, Clone)]
pub struct StudentReportRow {
    pub student_id: Uuid,
    pub z_score: f64,
    pub mean_similarity: f64,
}

/// Evidence tuple produced by the flagging engine and consumed by the
/// pair-stat rebuild. Always canonical: `student_a < student_b`.
#[derive(Debug, Clone, Copy)]
pub struct FlaggedPair {
    pub student_a: Uuid,
    pub student_b: Uuid,
    pub similarity: f64,
    pub z: f64,
}

impl FlaggedPair {
    pub fn new(student_1: Uuid, student_2: Uuid, similarity: f64, z: f64) -> Self {
        let (student_a, student_b) = canonical_pair(student_1, student_2);
        Self {
            student_a,
            student_b,
            similarity,
            z,
        }
    }
}

/// Semester-wide aggregate for one unordered student pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairFlagStat {
    pub student_a_id: Uuid,
    pub student_b_id: Uuid,
    pub assignments_shared: i64,
    pub total_similarity: f64,
    pub flagged_count: i64,
    pub total_z_score: f64,
    pub max_z_score: f64,
}

/// Behavioral profile of one student over a course offering. `cluster_label`
/// is set only after a clustering run; cluster 0 is always the lowest-risk
/// tier.
#[derive(Debug, Clone)]
pub struct StudentSemesterProfile {
    pub student_id: Uuid,
    pub avg_z_score: f64,
    pub max_z_score: f64,
    pub num_flagged_assignments: i64,
    pub mean_similarity_variance: f64,
    pub mean_similarity_skewness: f64,
    pub mean_similarity_kurtosis: f64,
    pub high_similarity_fraction: f64,
    pub cluster_label: Option<i32>,
}

impl StudentSemesterProfile {
    /// The exact ordered tuple of the seven scalar features, as fed to the
    /// clustering engine.
    pub fn feature_vector(&self) -> [f64; 7] {
        [
            self.avg_z_score,
            self.max_z_score,
            self.num_flagged_assignments as f64,
            self.mean_similarity_variance,
            self.mean_similarity_skewness,
            self.mean_similarity_kurtosis,
            self.high_similarity_fraction,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_pair_orders_reversed_input() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        assert_eq!(canonical_pair(high, low), (low, high));
        assert_eq!(canonical_pair(low, high), (low, high));
        assert_eq!(canonical_pair(low, low), (low, low));
    }

    #[test]
    fn flagged_pair_is_always_canonical() {
        let pair = FlaggedPair::new(Uuid::from_u128(9), Uuid::from_u128(3), 80.0, 2.1);
        assert_eq!(pair.student_a, Uuid::from_u128(3));
        assert_eq!(pair.student_b, Uuid::from_u128(9));
        assert!(pair.student_a < pair.student_b);
    }
}
