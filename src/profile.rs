use std::collections::BTreeMap;

use anyhow::Context;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::models::{StudentReportRow, StudentSemesterProfile};

/// Population variance (divide by N). Zero for empty input.
pub fn pvariance(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n
}

fn central_moment(xs: &[f64], order: i32) -> f64 {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    xs.iter().map(|x| (x - mean).powi(order)).sum::<f64>() / n
}

/// Biased sample skewness `m3 / m2^(3/2)`. Defaults to 0 when fewer than 3
/// samples exist or the variance is 0, since the higher moments are undefined
/// on degenerate inputs.
pub fn skewness(xs: &[f64]) -> f64 {
    if xs.len() < 3 {
        return 0.0;
    }
    let m2 = central_moment(xs, 2);
    if m2 == 0.0 {
        return 0.0;
    }
    central_moment(xs, 3) / m2.powf(1.5)
}

/// Biased excess kurtosis `m4 / m2^2 - 3`, with the same degenerate-input
/// guard as [`skewness`].
pub fn excess_kurtosis(xs: &[f64]) -> f64 {
    if xs.len() < 3 {
        return 0.0;
    }
    let m2 = central_moment(xs, 2);
    if m2 == 0.0 {
        return 0.0;
    }
    central_moment(xs, 4) / (m2 * m2) - 3.0
}

/// Fold per-assignment student reports into one seven-feature profile per
/// student. Output is ordered by student id so repeated runs over the same
/// reports build identical profile sets.
pub fn build_profiles(
    rows: &[StudentReportRow],
    z_threshold: f64,
) -> Vec<StudentSemesterProfile> {
    let mut buckets: BTreeMap<Uuid, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for row in rows {
        let bucket = buckets.entry(row.student_id).or_default();
        bucket.0.push(row.z_score);
        bucket.1.push(row.mean_similarity);
    }

    buckets
        .into_iter()
        .map(|(student_id, (zs, sims))| {
            let count = zs.len();
            let avg_z = zs.iter().sum::<f64>() / count as f64;
            let max_z = zs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let num_flagged = zs.iter().filter(|z| **z > z_threshold).count() as i64;

            StudentSemesterProfile {
                student_id,
                avg_z_score: avg_z,
                max_z_score: max_z,
                num_flagged_assignments: num_flagged,
                mean_similarity_variance: pvariance(&sims),
                mean_similarity_skewness: skewness(&sims),
                mean_similarity_kurtosis: excess_kurtosis(&sims),
                high_similarity_fraction: num_flagged as f64 / count as f64,
                cluster_label: None,
            }
        })
        .collect()
}

/// Recompute every StudentSemesterProfile for a (course, semester) scope.
/// Replace-on-write: the scope's previous profiles are deleted and the fresh
/// set bulk-inserted in one transaction. Returns the number of profiles
/// written.
pub async fn recompute_profiles(
    pool: &PgPool,
    course_id: Uuid,
    semester_id: Uuid,
    z_threshold: f64,
) -> anyhow::Result<usize> {
    let rows = db::fetch_scope_student_reports(pool, course_id, semester_id).await?;
    let profiles = build_profiles(&rows, z_threshold);

    let mut tx = pool.begin().await.context("begin profile transaction")?;

    sqlx::query(
        "DELETE FROM integrity.student_semester_profiles WHERE course_id = $1 AND semester_id = $2",
    )
    .bind(course_id)
    .bind(semester_id)
    .execute(&mut *tx)
    .await?;

    for profile in &profiles {
        sqlx::query(
            r#"
            INSERT INTO integrity.student_semester_profiles
            (id, course_id, semester_id, student_id, avg_z_score, max_z_score,
             num_flagged_assignments, mean_similarity_variance,
             mean_similarity_skewness, mean_similarity_kurtosis,
             high_similarity_fraction, feature_vector)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(course_id)
        .bind(semester_id)
        .bind(profile.student_id)
        .bind(profile.avg_z_score)
        .bind(profile.max_z_score)
        .bind(profile.num_flagged_assignments)
        .bind(profile.mean_similarity_variance)
        .bind(profile.mean_similarity_skewness)
        .bind(profile.mean_similarity_kurtosis)
        .bind(profile.high_similarity_fraction)
        .bind(profile.feature_vector().to_vec())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await.context("commit profile recompute")?;
    tracing::info!(
        course = %course_id,
        semester = %semester_id,
        profiles = profiles.len(),
        "recomputed semester profiles"
    );

    Ok(profiles.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(student: u128, z: f64, sim: f64) -> StudentReportRow {
        StudentReportRow {
            student_id: Uuid::from_u128(student),
            z_score: z,
            mean_similarity: sim,
        }
    }

    #[test]
    fn pvariance_uses_population_formula() {
        // statistics.pvariance([30, 50, 20]) == 1400/9
        assert!((pvariance(&[30.0, 50.0, 20.0]) - 1400.0 / 9.0).abs() < 1e-9);
        assert_eq!(pvariance(&[]), 0.0);
    }

    #[test]
    fn higher_moments_default_to_zero_when_degenerate() {
        assert_eq!(skewness(&[1.0, 2.0]), 0.0);
        assert_eq!(excess_kurtosis(&[1.0, 2.0]), 0.0);
        assert_eq!(skewness(&[5.0, 5.0, 5.0]), 0.0);
        assert_eq!(excess_kurtosis(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn skewness_sign_follows_the_tail() {
        assert!(skewness(&[1.0, 1.0, 1.0, 10.0]) > 0.0);
        assert!(skewness(&[10.0, 10.0, 10.0, 1.0]) < 0.0);
        // Symmetric input has zero skew.
        assert!(skewness(&[1.0, 2.0, 3.0]).abs() < 1e-12);
    }

    #[test]
    fn uniform_three_points_have_kurtosis_minus_1_5() {
        // m4/m2^2 for {-1, 0, 1} is (2/3)/(4/9) = 1.5; excess is -1.5.
        assert!((excess_kurtosis(&[1.0, 2.0, 3.0]) + 1.5).abs() < 1e-9);
    }

    #[test]
    fn profiles_aggregate_per_student() {
        let rows = vec![
            row(1, 2.5, 60.0),
            row(1, 0.5, 30.0),
            row(1, 1.0, 40.0),
            row(2, -0.2, 10.0),
        ];
        let profiles = build_profiles(&rows, 2.0);

        assert_eq!(profiles.len(), 2);
        let p1 = &profiles[0];
        assert_eq!(p1.student_id, Uuid::from_u128(1));
        assert!((p1.avg_z_score - (2.5 + 0.5 + 1.0) / 3.0).abs() < 1e-9);
        assert!((p1.max_z_score - 2.5).abs() < 1e-9);
        assert_eq!(p1.num_flagged_assignments, 1);
        assert!((p1.high_similarity_fraction - 1.0 / 3.0).abs() < 1e-9);
        assert!(p1.cluster_label.is_none());

        let p2 = &profiles[1];
        assert_eq!(p2.num_flagged_assignments, 0);
        assert_eq!(p2.mean_similarity_variance, 0.0);
    }

    #[test]
    fn feature_vector_order_is_fixed() {
        let profiles = build_profiles(&[row(1, 3.0, 50.0)], 2.0);
        let vec = profiles[0].feature_vector();

        assert_eq!(vec[0], profiles[0].avg_z_score);
        assert_eq!(vec[1], profiles[0].max_z_score);
        assert_eq!(vec[2], profiles[0].num_flagged_assignments as f64);
        assert_eq!(vec[6], profiles[0].high_similarity_fraction);
    }
}
